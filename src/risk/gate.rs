// =============================================================================
// Pre-Trade Gate — ordered composition of every admission check
// =============================================================================
//
// Order (spec §4.5): kill switch -> circuit breaker -> validate -> persisted
// policy -> risk cache evaluate -> recovery stake override -> risk manager
// preTradeCheck -> recordOpened. Any denial aborts before recordOpened runs,
// so exposure is never touched on a rejected trade.
// =============================================================================

use std::sync::Arc;

use serde_json::json;

use crate::error::ExecutionError;
use crate::recovery::{RecoveryEngine, TradeOutcomeContext};
use crate::regime::RegimeDetector;
use crate::risk::cache::{EvaluateParams, HaltReason, RiskCache, RiskVerdict};
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::manager::{PreTradeLimits, RiskManager};
use crate::store::Store;
use crate::types::{TradeRiskConfig, TradeSignal};

pub struct RiskPolicy {
    pub max_stake: f64,
    pub max_order_stake: f64,
    pub max_notional: f64,
    pub daily_loss_limit_pct: f64,
    pub drawdown_limit_pct: f64,
    pub max_consecutive_losses: u32,
    pub cooldown_ms: u64,
    pub loss_cooldown_ms: u64,
    pub max_concurrent_trades: u32,
    pub stop_loss: Option<f64>,
    pub strategy_requires_stop_loss: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            max_stake: 100.0,
            max_order_stake: 100.0,
            max_notional: 1000.0,
            daily_loss_limit_pct: 10.0,
            drawdown_limit_pct: 20.0,
            max_consecutive_losses: 5,
            cooldown_ms: 0,
            loss_cooldown_ms: 0,
            max_concurrent_trades: 10,
            stop_loss: None,
            strategy_requires_stop_loss: false,
        }
    }
}

pub struct PreTradeGate {
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub risk_cache: Arc<RiskCache>,
    pub risk_manager: Arc<RiskManager>,
    pub recovery: Arc<RecoveryEngine>,
    pub regime: Arc<RegimeDetector>,
    pub store: Arc<dyn Store>,
}

#[derive(Debug)]
pub struct GateOutcome {
    pub approved_stake: f64,
    pub risk_config: TradeRiskConfig,
    pub recovery_multiplier: f64,
}

impl PreTradeGate {
    /// Runs every admission check in order; on the first denial returns the
    /// typed error without touching exposure counters.
    pub async fn admit(
        &self,
        account_id: &str,
        signal: &TradeSignal,
    ) -> Result<GateOutcome, ExecutionError> {
        if self.risk_manager.is_kill_switch_active(account_id) {
            return Err(ExecutionError::risk_halt("Kill switch active"));
        }

        let breaker_check = self.circuit_breaker.check(account_id);
        if !breaker_check.allowed {
            return Err(ExecutionError::throttle(
                breaker_check.reason.unwrap_or_else(|| "circuit breaker open".to_string()),
                breaker_check.retry_after_ms.unwrap_or(0),
            ));
        }

        signal.validate()?;

        let policy = self.load_policy(account_id).await;

        let verdict = self.risk_cache.evaluate(
            account_id,
            EvaluateParams {
                proposed_stake: signal.stake,
                max_stake: policy.max_stake,
                daily_loss_limit_pct: policy.daily_loss_limit_pct,
                drawdown_limit_pct: policy.drawdown_limit_pct,
                max_consecutive_losses: policy.max_consecutive_losses,
                cooldown_ms: policy.cooldown_ms,
                loss_cooldown_ms: policy.loss_cooldown_ms,
                max_concurrent_trades: policy.max_concurrent_trades,
            },
        );

        let risk_verdict_stake = match verdict {
            RiskVerdict::Allow => signal.stake,
            RiskVerdict::ReduceStake { clamped_stake } => clamped_stake,
            RiskVerdict::Cooldown { wait_ms } => {
                return Err(ExecutionError::risk_halt("Cooldown active")
                    .with_context(json!({ "waitMs": wait_ms })))
            }
            RiskVerdict::LossCooldown { wait_ms } => {
                return Err(ExecutionError::risk_halt("Loss cooldown active")
                    .with_context(json!({ "waitMs": wait_ms })))
            }
            RiskVerdict::MaxConcurrent => {
                return Err(ExecutionError::risk_halt("Maximum concurrent trades reached"))
            }
            RiskVerdict::Halt { reason } => {
                return Err(ExecutionError::risk_halt(match reason {
                    HaltReason::DailyLoss => "Daily loss limit reached",
                    HaltReason::Drawdown => "Drawdown limit reached",
                }))
            }
        };

        let recovery_multiplier = self
            .risk_cache
            .snapshot(account_id)
            .map(|entry| {
                let regime = self.regime.current(account_id, &signal.symbol);
                let ctx = TradeOutcomeContext::from_cache(&entry, regime.as_ref());
                self.recovery
                    .get_recovery_overrides(account_id, ctx)
                    .map(|o| o.stake_multiplier)
                    .unwrap_or(1.0)
            })
            .unwrap_or(1.0);

        let approved_stake = (risk_verdict_stake * recovery_multiplier).min(policy.max_stake);

        let pre_trade = self.risk_manager.pre_trade_check(
            account_id,
            approved_stake,
            &PreTradeLimits {
                max_order_stake: policy.max_order_stake,
                max_notional: policy.max_notional,
            },
        );
        if !pre_trade.allowed {
            let reason = pre_trade.reason.unwrap_or_default();
            return Err(if reason == "THROTTLE" {
                ExecutionError::throttle(reason, 1_000)
            } else {
                ExecutionError::risk_halt(reason)
            });
        }

        let record = self
            .risk_cache
            .record_opened(account_id, approved_stake, policy.max_concurrent_trades);
        if !record.allowed {
            return Err(ExecutionError::risk_halt(
                record.reason.unwrap_or_else(|| "risk cache denied open".to_string()),
            ));
        }

        Ok(GateOutcome {
            approved_stake,
            recovery_multiplier,
            risk_config: TradeRiskConfig {
                account_id: account_id.to_string(),
                approved_stake,
                stop_loss: policy.stop_loss,
                strategy_requires_stop_loss: policy.strategy_requires_stop_loss,
                max_order_stake: policy.max_order_stake,
                max_notional: policy.max_notional,
            },
        })
    }

    async fn load_policy(&self, account_id: &str) -> RiskPolicy {
        match self.store.get_setting(account_id, "risk_state").await {
            Ok(Some(value)) => serde_json::from_value(value).unwrap_or_default(),
            _ => RiskPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::RecoveryPolicy;
    use crate::risk::rate_limit::{RateLimitConfig, RateLimiter};
    use crate::store::sqlite::SqliteStore;
    use crate::types::{Direction, DurationUnit, EntryMode};

    async fn gate() -> PreTradeGate {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        let metrics = Arc::new(crate::metrics::Metrics::new().unwrap());
        PreTradeGate {
            circuit_breaker: Arc::new(CircuitBreaker::new(5, 30_000)),
            risk_cache: Arc::new(RiskCache::new()),
            risk_manager: Arc::new(RiskManager::new(RateLimiter::new(RateLimitConfig::default()))),
            recovery: Arc::new(RecoveryEngine::new(RecoveryPolicy::default(), metrics)),
            regime: Arc::new(RegimeDetector::new()),
            store,
        }
    }

    fn signal(stake: f64) -> TradeSignal {
        TradeSignal {
            direction: Direction::Call,
            symbol: "R_100".to_string(),
            stake,
            currency: "USD".to_string(),
            duration: 5,
            duration_unit: DurationUnit::Tick,
            entry_mode: EntryMode::Market,
            entry_target_price: None,
            entry_slippage_pct: None,
            bot_id: None,
            bot_run_id: None,
            correlation_id: "corr-1".to_string(),
            entry_profile_id: None,
        }
    }

    #[tokio::test]
    async fn admits_a_plain_trade_at_face_stake() {
        let gate = gate().await;
        gate.risk_cache.initialize("A", 1000.0);
        let outcome = gate.admit("A", &signal(10.0)).await.unwrap();
        assert_eq!(outcome.approved_stake, 10.0);
        assert_eq!(outcome.recovery_multiplier, 1.0);
    }

    #[tokio::test]
    async fn scales_stake_down_while_recovering_with_loss_streak() {
        let gate = gate().await;
        gate.risk_cache.initialize("A", 1000.0);

        let ctx = crate::recovery::TradeOutcomeContext {
            equity: 1000.0,
            win_rate: 0.3,
            regime_confidence: 0.5,
            volatility: 0.5,
            last_win_time_ms: None,
            drawdown_pct: 0.1,
        };
        gate.recovery.record_outcome("A", -10.0, ctx);
        gate.recovery.record_outcome("A", -5.0, ctx);
        gate.recovery.record_outcome("A", -5.0, ctx);

        let outcome = gate.admit("A", &signal(10.0)).await.unwrap();
        assert!(outcome.recovery_multiplier <= 1.0);
        assert!(outcome.approved_stake <= 10.0);
    }

    #[tokio::test]
    async fn kill_switch_blocks_before_recovery_is_consulted() {
        let gate = gate().await;
        gate.risk_cache.initialize("A", 1000.0);
        gate.risk_manager.set_kill_switch("A", true);
        let err = gate.admit("A", &signal(10.0)).await.unwrap_err();
        assert_eq!(err.message, "Kill switch active");
    }
}

impl<'de> serde::Deserialize<'de> for RiskPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Raw {
            max_stake: Option<f64>,
            max_order_stake: Option<f64>,
            max_notional: Option<f64>,
            daily_loss_limit_pct: Option<f64>,
            drawdown_limit_pct: Option<f64>,
            max_consecutive_losses: Option<u32>,
            cooldown_ms: Option<u64>,
            loss_cooldown_ms: Option<u64>,
            max_concurrent_trades: Option<u32>,
            stop_loss: Option<f64>,
            strategy_requires_stop_loss: Option<bool>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let defaults = RiskPolicy::default();
        Ok(RiskPolicy {
            max_stake: raw.max_stake.unwrap_or(defaults.max_stake),
            max_order_stake: raw.max_order_stake.unwrap_or(defaults.max_order_stake),
            max_notional: raw.max_notional.unwrap_or(defaults.max_notional),
            daily_loss_limit_pct: raw.daily_loss_limit_pct.unwrap_or(defaults.daily_loss_limit_pct),
            drawdown_limit_pct: raw.drawdown_limit_pct.unwrap_or(defaults.drawdown_limit_pct),
            max_consecutive_losses: raw
                .max_consecutive_losses
                .unwrap_or(defaults.max_consecutive_losses),
            cooldown_ms: raw.cooldown_ms.unwrap_or(defaults.cooldown_ms),
            loss_cooldown_ms: raw.loss_cooldown_ms.unwrap_or(defaults.loss_cooldown_ms),
            max_concurrent_trades: raw
                .max_concurrent_trades
                .unwrap_or(defaults.max_concurrent_trades),
            stop_loss: raw.stop_loss.or(defaults.stop_loss),
            strategy_requires_stop_loss: raw
                .strategy_requires_stop_loss
                .unwrap_or(defaults.strategy_requires_stop_loss),
        })
    }
}
