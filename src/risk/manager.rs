// =============================================================================
// Risk Manager (sidecar) — kill switch, rate limits, reject/stuck counters
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::risk::rate_limit::RateLimiter;
use crate::types::AccountId;

#[derive(Default)]
struct AccountCounters {
    rejects: AtomicU64,
    slippage_rejects: AtomicU64,
    stuck_orders: AtomicU64,
}

pub struct PreTradeLimits {
    pub max_order_stake: f64,
    pub max_notional: f64,
}

pub struct PreTradeResult {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct RiskManager {
    kill_switches: RwLock<HashMap<AccountId, AtomicBool>>,
    counters: RwLock<HashMap<AccountId, AccountCounters>>,
    rate_limiter: RateLimiter,
}

impl RiskManager {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            kill_switches: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            rate_limiter,
        }
    }

    pub fn set_kill_switch(&self, account_id: &str, active: bool) {
        let switches = self.kill_switches.upgradable_read();
        if let Some(existing) = switches.get(account_id) {
            existing.store(active, Ordering::SeqCst);
        } else {
            let mut switches = parking_lot::RwLockUpgradableReadGuard::upgrade(switches);
            switches.insert(account_id.to_string(), AtomicBool::new(active));
        }
    }

    pub fn is_kill_switch_active(&self, account_id: &str) -> bool {
        self.kill_switches
            .read()
            .get(account_id)
            .map(|b| b.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn pre_trade_check(
        &self,
        account_id: &str,
        stake: f64,
        limits: &PreTradeLimits,
    ) -> PreTradeResult {
        if self.is_kill_switch_active(account_id) {
            return PreTradeResult {
                allowed: false,
                reason: Some("Kill switch active".to_string()),
            };
        }
        if stake > limits.max_order_stake {
            return PreTradeResult {
                allowed: false,
                reason: Some(format!(
                    "stake {stake} exceeds max order stake {}",
                    limits.max_order_stake
                )),
            };
        }
        if stake > limits.max_notional {
            return PreTradeResult {
                allowed: false,
                reason: Some(format!(
                    "stake {stake} exceeds max notional {}",
                    limits.max_notional
                )),
            };
        }
        if !self.rate_limiter.allow_order(account_id) {
            return PreTradeResult {
                allowed: false,
                reason: Some("THROTTLE".to_string()),
            };
        }
        PreTradeResult {
            allowed: true,
            reason: None,
        }
    }

    pub fn record_reject(&self, account_id: &str) {
        let mut counters = self.counters.write();
        counters
            .entry(account_id.to_string())
            .or_insert_with(AccountCounters::default)
            .rejects
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_slippage_reject(&self, account_id: &str) {
        let mut counters = self.counters.write();
        counters
            .entry(account_id.to_string())
            .or_insert_with(AccountCounters::default)
            .slippage_rejects
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_stuck_order(&self, account_id: &str) {
        let mut counters = self.counters.write();
        counters
            .entry(account_id.to_string())
            .or_insert_with(AccountCounters::default)
            .stuck_orders
            .fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_blocks_pre_trade() {
        let rm = RiskManager::new(RateLimiter::default());
        rm.set_kill_switch("A", true);
        let result = rm.pre_trade_check(
            "A",
            1.0,
            &PreTradeLimits {
                max_order_stake: 100.0,
                max_notional: 1000.0,
            },
        );
        assert!(!result.allowed);
        assert_eq!(result.reason.as_deref(), Some("Kill switch active"));
    }

    #[test]
    fn allows_within_limits() {
        let rm = RiskManager::new(RateLimiter::default());
        let result = rm.pre_trade_check(
            "A",
            1.0,
            &PreTradeLimits {
                max_order_stake: 100.0,
                max_notional: 1000.0,
            },
        );
        assert!(result.allowed);
    }
}
