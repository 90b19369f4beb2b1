// =============================================================================
// Execution Circuit Breaker — per account, closed -> open -> half-open
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::types::AccountId;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<u64>,
}

impl BreakerEntry {
    fn fresh() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

pub struct CheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub state: BreakerState,
}

pub struct CircuitBreaker {
    trip_threshold: u32,
    cool_off_ms: u64,
    entries: Mutex<HashMap<AccountId, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(trip_threshold: u32, cool_off_ms: u64) -> Self {
        Self {
            trip_threshold,
            cool_off_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, account_id: &str) -> CheckResult {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(account_id.to_string())
            .or_insert_with(BreakerEntry::fresh);

        match entry.state {
            BreakerState::Closed => CheckResult {
                allowed: true,
                reason: None,
                retry_after_ms: None,
                state: entry.state,
            },
            BreakerState::Open => {
                let opened_at = entry.opened_at.unwrap_or(0);
                let elapsed = now_ms().saturating_sub(opened_at);
                if elapsed >= self.cool_off_ms {
                    entry.state = BreakerState::HalfOpen;
                    CheckResult {
                        allowed: true,
                        reason: None,
                        retry_after_ms: None,
                        state: entry.state,
                    }
                } else {
                    CheckResult {
                        allowed: false,
                        reason: Some("circuit breaker open".to_string()),
                        retry_after_ms: Some(self.cool_off_ms - elapsed),
                        state: entry.state,
                    }
                }
            }
            BreakerState::HalfOpen => CheckResult {
                allowed: true,
                reason: None,
                retry_after_ms: None,
                state: entry.state,
            },
        }
    }

    pub fn record_success(&self, account_id: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(account_id.to_string())
            .or_insert_with(BreakerEntry::fresh);
        entry.state = BreakerState::Closed;
        entry.consecutive_failures = 0;
        entry.opened_at = None;
    }

    /// Record an execution failure. THROTTLE never counts toward the trip
    /// (spec §4.4: "Opens after N consecutive execution failures... excludes
    /// THROTTLE").
    pub fn record_failure(&self, account_id: &str, code: ErrorCode) {
        if code == ErrorCode::Throttle {
            return;
        }
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(account_id.to_string())
            .or_insert_with(BreakerEntry::fresh);

        match entry.state {
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.opened_at = Some(now_ms());
            }
            _ => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.trip_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now_ms());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_n_failures_and_excludes_throttle() {
        let cb = CircuitBreaker::new(3, 60_000);
        cb.record_failure("A", ErrorCode::Throttle);
        cb.record_failure("A", ErrorCode::Throttle);
        assert!(cb.check("A").allowed);

        cb.record_failure("A", ErrorCode::BuyReject);
        cb.record_failure("A", ErrorCode::BuyReject);
        cb.record_failure("A", ErrorCode::BuyReject);
        let result = cb.check("A");
        assert!(!result.allowed);
        assert_eq!(result.state, BreakerState::Open);
    }

    #[test]
    fn success_resets_to_closed() {
        let cb = CircuitBreaker::new(1, 60_000);
        cb.record_failure("A", ErrorCode::BuyReject);
        assert_eq!(cb.check("A").state, BreakerState::Open);
        cb.record_success("A");
        assert_eq!(cb.check("A").state, BreakerState::Closed);
    }
}
