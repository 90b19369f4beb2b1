// =============================================================================
// Risk Cache — in-memory, per-account, O(1) fast-path checks
// =============================================================================
//
// One entry per account behind a single map-level mutex (design note: "Async
// mutation of shared counters under risk cache → per-account mutex; read
// snapshots via copy"). No network calls happen on this path.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::AccountId;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskCacheEntry {
    pub equity: f64,
    pub equity_peak: f64,
    pub daily_start_equity: f64,
    pub open_trade_count: u32,
    pub exposure: f64,
    pub win_streak: u32,
    pub loss_streak: u32,
    pub total_wins: u32,
    pub total_losses: u32,
    pub last_trade_at: Option<u64>,
    pub last_loss_at: Option<u64>,
    pub last_win_at: Option<u64>,
}

impl RiskCacheEntry {
    fn fresh(equity: f64) -> Self {
        Self {
            equity,
            equity_peak: equity,
            daily_start_equity: equity,
            open_trade_count: 0,
            exposure: 0.0,
            win_streak: 0,
            loss_streak: 0,
            total_wins: 0,
            total_losses: 0,
            last_trade_at: None,
            last_loss_at: None,
            last_win_at: None,
        }
    }

    /// Fraction of settled trades that were wins, in `[0, 1]`. `0.5` when
    /// no trade has settled yet (neutral prior).
    pub fn win_rate(&self) -> f64 {
        let total = self.total_wins + self.total_losses;
        if total == 0 {
            0.5
        } else {
            self.total_wins as f64 / total as f64
        }
    }

    /// Drawdown from the equity high-water mark, as a percentage in `[0, 100]`.
    pub fn drawdown_pct(&self) -> f64 {
        if self.equity_peak <= 0.0 {
            0.0
        } else {
            ((self.equity_peak - self.equity) / self.equity_peak * 100.0).max(0.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluateParams {
    pub proposed_stake: f64,
    pub max_stake: f64,
    pub daily_loss_limit_pct: f64,
    pub drawdown_limit_pct: f64,
    pub max_consecutive_losses: u32,
    pub cooldown_ms: u64,
    pub loss_cooldown_ms: u64,
    pub max_concurrent_trades: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HaltReason {
    DailyLoss,
    Drawdown,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RiskVerdict {
    Allow,
    ReduceStake { clamped_stake: f64 },
    Cooldown { wait_ms: u64 },
    LossCooldown { wait_ms: u64 },
    MaxConcurrent,
    Halt { reason: HaltReason },
}

#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub allowed: bool,
    pub reason: Option<String>,
}

pub struct RiskCache {
    entries: RwLock<HashMap<AccountId, RiskCacheEntry>>,
}

impl RiskCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn initialize(&self, account_id: &str, equity: f64) {
        self.entries
            .write()
            .insert(account_id.to_string(), RiskCacheEntry::fresh(equity));
    }

    pub fn snapshot(&self, account_id: &str) -> Option<RiskCacheEntry> {
        self.entries.read().get(account_id).cloned()
    }

    pub fn evaluate(&self, account_id: &str, params: EvaluateParams) -> RiskVerdict {
        let entries = self.entries.read();
        let entry = match entries.get(account_id) {
            Some(e) => e,
            None => return RiskVerdict::Allow,
        };

        let now = now_ms();

        if entry.daily_start_equity > 0.0 {
            let daily_loss_pct =
                (entry.daily_start_equity - entry.equity) / entry.daily_start_equity * 100.0;
            if daily_loss_pct >= params.daily_loss_limit_pct {
                return RiskVerdict::Halt {
                    reason: HaltReason::DailyLoss,
                };
            }
        }
        if entry.equity_peak > 0.0 {
            let drawdown_pct = (entry.equity_peak - entry.equity) / entry.equity_peak * 100.0;
            if drawdown_pct >= params.drawdown_limit_pct {
                return RiskVerdict::Halt {
                    reason: HaltReason::Drawdown,
                };
            }
        }

        if entry.open_trade_count >= params.max_concurrent_trades {
            return RiskVerdict::MaxConcurrent;
        }

        if entry.loss_streak >= params.max_consecutive_losses {
            if let Some(last_loss_at) = entry.last_loss_at {
                let elapsed = now.saturating_sub(last_loss_at);
                if elapsed < params.loss_cooldown_ms {
                    return RiskVerdict::LossCooldown {
                        wait_ms: params.loss_cooldown_ms - elapsed,
                    };
                }
            }
        }

        if let Some(last_trade_at) = entry.last_trade_at {
            let elapsed = now.saturating_sub(last_trade_at);
            if elapsed < params.cooldown_ms {
                return RiskVerdict::Cooldown {
                    wait_ms: params.cooldown_ms - elapsed,
                };
            }
        }

        if params.proposed_stake > params.max_stake {
            return RiskVerdict::ReduceStake {
                clamped_stake: params.max_stake,
            };
        }

        RiskVerdict::Allow
    }

    /// Atomically re-validates `maxConcurrentTrades` and commits the open in
    /// one write-lock critical section, so two concurrent `admit()` calls
    /// that both passed `evaluate()` cannot both succeed past the limit.
    pub fn record_opened(&self, account_id: &str, stake: f64, max_concurrent_trades: u32) -> RecordOutcome {
        let mut entries = self.entries.write();
        match entries.get_mut(account_id) {
            Some(entry) => {
                if entry.open_trade_count >= max_concurrent_trades {
                    return RecordOutcome {
                        allowed: false,
                        reason: Some("MAX_CONCURRENT".to_string()),
                    };
                }
                entry.open_trade_count += 1;
                entry.exposure += stake;
                RecordOutcome {
                    allowed: true,
                    reason: None,
                }
            }
            None => RecordOutcome {
                allowed: false,
                reason: Some("account not initialized in risk cache".to_string()),
            },
        }
    }

    pub fn record_settled(
        &self,
        account_id: &str,
        stake: f64,
        net_profit: f64,
        skip_exposure: bool,
    ) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(account_id) {
            if !skip_exposure {
                entry.exposure = (entry.exposure - stake).max(0.0);
            }
            entry.open_trade_count = entry.open_trade_count.saturating_sub(1);
            entry.equity += net_profit;
            entry.equity_peak = entry.equity_peak.max(entry.equity);

            let now = now_ms();
            entry.last_trade_at = Some(now);
            if net_profit < 0.0 {
                entry.loss_streak += 1;
                entry.win_streak = 0;
                entry.total_losses += 1;
                entry.last_loss_at = Some(now);
            } else {
                entry.win_streak += 1;
                entry.loss_streak = 0;
                entry.total_wins += 1;
                entry.last_win_at = Some(now);
            }
        }
    }

    pub fn record_failed_attempt(&self, account_id: &str, stake: f64) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(account_id) {
            entry.exposure = (entry.exposure - stake).max(0.0);
            entry.open_trade_count = entry.open_trade_count.saturating_sub(1);
        }
    }
}

impl Default for RiskCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_params(stake: f64) -> EvaluateParams {
        EvaluateParams {
            proposed_stake: stake,
            max_stake: 100.0,
            daily_loss_limit_pct: 10.0,
            drawdown_limit_pct: 20.0,
            max_consecutive_losses: 5,
            cooldown_ms: 0,
            loss_cooldown_ms: 0,
            max_concurrent_trades: 10,
        }
    }

    #[test]
    fn exposure_tracks_open_and_settled() {
        let cache = RiskCache::new();
        cache.initialize("A", 1000.0);
        cache.record_opened("A", 10.0, 10);
        assert_eq!(cache.snapshot("A").unwrap().exposure, 10.0);
        cache.record_settled("A", 10.0, 5.0, false);
        let snap = cache.snapshot("A").unwrap();
        assert_eq!(snap.exposure, 0.0);
        assert_eq!(snap.equity, 1005.0);
    }

    #[test]
    fn halts_on_daily_loss_limit() {
        let cache = RiskCache::new();
        cache.initialize("A", 1000.0);
        cache.record_opened("A", 200.0, 10);
        cache.record_settled("A", 200.0, -150.0, false);
        let verdict = cache.evaluate("A", default_params(1.0));
        assert_eq!(
            verdict,
            RiskVerdict::Halt {
                reason: HaltReason::DailyLoss
            }
        );
    }

    #[test]
    fn reduces_stake_beyond_max() {
        let cache = RiskCache::new();
        cache.initialize("A", 1000.0);
        let verdict = cache.evaluate("A", default_params(500.0));
        assert_eq!(
            verdict,
            RiskVerdict::ReduceStake {
                clamped_stake: 100.0
            }
        );
    }

    #[test]
    fn max_concurrent_trades_blocks() {
        let cache = RiskCache::new();
        cache.initialize("A", 1000.0);
        for _ in 0..10 {
            assert!(cache.record_opened("A", 1.0, 10).allowed);
        }
        let verdict = cache.evaluate("A", default_params(1.0));
        assert_eq!(verdict, RiskVerdict::MaxConcurrent);
    }

    #[test]
    fn record_opened_rejects_once_limit_is_already_saturated() {
        let cache = RiskCache::new();
        cache.initialize("A", 1000.0);
        for _ in 0..3 {
            assert!(cache.record_opened("A", 1.0, 3).allowed);
        }
        let outcome = cache.record_opened("A", 1.0, 3);
        assert!(!outcome.allowed);
        assert_eq!(outcome.reason.as_deref(), Some("MAX_CONCURRENT"));
        assert_eq!(cache.snapshot("A").unwrap().open_trade_count, 3);
    }
}
