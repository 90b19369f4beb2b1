// =============================================================================
// Settlement Lock — fair FIFO per-key lock with per-waiter timeout
// =============================================================================
//
// Design note: "Settlement lock as queue-of-waiters with per-waiter timeout
// -> a fair FIFO lock; callers must release exactly once, with a guard
// against double-release."
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

use crate::metrics::Metrics;

struct KeyState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

pub struct SettlementLock {
    keys: Mutex<HashMap<String, KeyState>>,
    acquire_timeout: Duration,
    metrics: Arc<Metrics>,
}

/// Held exactly once; dropping (or calling [`Guard::release`]) releases it
/// to the next FIFO waiter, guarding against double-release.
pub struct Guard<'a> {
    lock: &'a SettlementLock,
    key: String,
    released: bool,
}

impl<'a> Guard<'a> {
    pub fn release(mut self) {
        self.lock.release(&self.key);
        self.released = true;
    }
}

impl<'a> Drop for Guard<'a> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.release(&self.key);
        }
    }
}

impl SettlementLock {
    pub fn new(acquire_timeout_ms: u64, metrics: Arc<Metrics>) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            metrics,
        }
    }

    pub async fn acquire(&self, account_id: &str, key: &str) -> Result<Guard<'_>, String> {
        let rx = {
            let mut keys = self.keys.lock();
            let state = keys.entry(key.to_string()).or_insert_with(|| KeyState {
                held: false,
                waiters: VecDeque::new(),
            });

            if !state.held {
                state.held = true;
                None
            } else {
                self.metrics
                    .settlement_lock_contention_total
                    .with_label_values(&[account_id])
                    .inc();
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            let waited = std::time::Instant::now();
            match timeout(self.acquire_timeout, rx).await {
                Ok(Ok(())) => {
                    self.metrics
                        .settlement_lock_wait_seconds
                        .with_label_values(&[account_id])
                        .observe(waited.elapsed().as_secs_f64());
                }
                _ => {
                    self.metrics
                        .settlement_lock_timeouts_total
                        .with_label_values(&[account_id])
                        .inc();
                    let mut keys = self.keys.lock();
                    if let Some(state) = keys.get_mut(key) {
                        state.waiters.retain(|w| !w.is_closed());
                    }
                    return Err(format!("timed out acquiring settlement lock for {key}"));
                }
            }
        }

        Ok(Guard {
            lock: self,
            key: key.to_string(),
            released: false,
        })
    }

    fn release(&self, key: &str) {
        let mut keys = self.keys.lock();
        if let Some(state) = keys.get_mut(key) {
            match state.waiters.pop_front() {
                Some(next) => {
                    let _ = next.send(());
                }
                None => {
                    state.held = false;
                }
            }
            if !state.held && state.waiters.is_empty() {
                keys.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_access_to_the_same_key() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let lock = SettlementLock::new(5_000, metrics);
        let guard1 = lock.acquire("A", "A:1").await.unwrap();
        drop(guard1);
        let guard2 = lock.acquire("A", "A:1").await.unwrap();
        drop(guard2);
    }

    #[tokio::test]
    async fn second_waiter_times_out_when_never_released() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let lock = Arc::new(SettlementLock::new(50, metrics));
        let guard = lock.acquire("A", "A:1").await.unwrap();
        let result = lock.acquire("A", "A:1").await;
        assert!(result.is_err());
        drop(guard);
    }
}
