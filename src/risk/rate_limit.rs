// =============================================================================
// Windowed rate limiter — per account orders/sec, orders/min, cancels/sec
// =============================================================================
//
// Generalizes the atomic-counter-with-periodic-reset idiom the source engine
// used for its exchange rate limits into per-account sliding windows keyed
// by a coarse bucket id, so no separate reset task is needed.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::types::AccountId;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Window {
    bucket_ms: u64,
    bucket_start: AtomicU64,
    count: AtomicU32,
    limit: u32,
}

impl Window {
    fn new(bucket_ms: u64, limit: u32) -> Self {
        Self {
            bucket_ms,
            bucket_start: AtomicU64::new(now_ms()),
            count: AtomicU32::new(0),
            limit,
        }
    }

    fn try_consume(&self) -> bool {
        let now = now_ms();
        let start = self.bucket_start.load(Ordering::SeqCst);
        if now.saturating_sub(start) >= self.bucket_ms {
            self.bucket_start.store(now, Ordering::SeqCst);
            self.count.store(0, Ordering::SeqCst);
        }
        let prev = self.count.fetch_add(1, Ordering::SeqCst);
        if prev >= self.limit {
            self.count.fetch_sub(1, Ordering::SeqCst);
            false
        } else {
            true
        }
    }
}

struct AccountWindows {
    orders_per_sec: Window,
    orders_per_min: Window,
    cancels_per_sec: Window,
}

pub struct RateLimitConfig {
    pub orders_per_sec: u32,
    pub orders_per_min: u32,
    pub cancels_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            orders_per_sec: 5,
            orders_per_min: 120,
            cancels_per_sec: 5,
        }
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    accounts: Mutex<HashMap<AccountId, AccountWindows>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    fn with_windows<R>(&self, account_id: &str, f: impl FnOnce(&AccountWindows) -> R) -> R {
        let mut accounts = self.accounts.lock();
        let windows = accounts.entry(account_id.to_string()).or_insert_with(|| AccountWindows {
            orders_per_sec: Window::new(1_000, self.config.orders_per_sec),
            orders_per_min: Window::new(60_000, self.config.orders_per_min),
            cancels_per_sec: Window::new(1_000, self.config.cancels_per_sec),
        });
        f(windows)
    }

    /// Returns `true` if an order may be sent now, consuming one unit from
    /// both the per-second and per-minute windows.
    pub fn allow_order(&self, account_id: &str) -> bool {
        self.with_windows(account_id, |w| {
            w.orders_per_sec.try_consume() && w.orders_per_min.try_consume()
        })
    }

    pub fn allow_cancel(&self, account_id: &str) -> bool {
        self.with_windows(account_id, |w| w.cancels_per_sec.try_consume())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_after_per_second_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            orders_per_sec: 2,
            orders_per_min: 100,
            cancels_per_sec: 100,
        });
        assert!(limiter.allow_order("A"));
        assert!(limiter.allow_order("A"));
        assert!(!limiter.allow_order("A"));
    }

    #[test]
    fn accounts_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig {
            orders_per_sec: 1,
            orders_per_min: 100,
            cancels_per_sec: 100,
        });
        assert!(limiter.allow_order("A"));
        assert!(limiter.allow_order("B"));
    }
}
