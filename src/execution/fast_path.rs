// =============================================================================
// Fast-Path Trade — public entry point, spec §4.7
// =============================================================================

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::contracts::OpenContractsIndex;
use crate::error::{ErrorCode, ExecutionError};
use crate::execution::engine;
use crate::metrics::Metrics;
use crate::pnl::PnlTracker;
use crate::risk::cache::RiskCache;
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::gate::PreTradeGate;
use crate::risk::manager::RiskManager;
use crate::settlement::tracker::SettlementTracker;
use crate::store::{OrderStatusEvent, OrderStatusRow, Store};
use crate::types::{ExecutionParams, TradeSignal};
use crate::ws::session::WsSessionManager;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FastPathResult {
    pub contract_id: i64,
    pub buy_price: f64,
    pub payout: f64,
    pub status: &'static str,
    pub execution_time_ms: u64,
}

pub struct FastPathTrade {
    pub sessions: Arc<WsSessionManager>,
    pub gate: Arc<PreTradeGate>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub risk_cache: Arc<RiskCache>,
    pub risk_manager: Arc<RiskManager>,
    pub contracts: Arc<OpenContractsIndex>,
    pub pnl: Arc<PnlTracker>,
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn Store>,
    pub settlement_tracker: Arc<SettlementTracker>,
}

impl FastPathTrade {
    pub async fn execute(
        &self,
        account_id: &str,
        token: &str,
        signal: TradeSignal,
    ) -> Result<FastPathResult, ExecutionError> {
        let started = std::time::Instant::now();

        let breaker = self.circuit_breaker.check(account_id);
        if !breaker.allowed {
            return Err(ExecutionError::throttle(
                breaker.reason.unwrap_or_else(|| "circuit breaker open".to_string()),
                breaker.retry_after_ms.unwrap_or(0),
            ));
        }

        signal.validate()?;

        let gate_outcome = self.gate.admit(account_id, &signal).await?;

        let params = ExecutionParams {
            account_id: account_id.to_string(),
            token: token.to_string(),
            direction: signal.direction,
            symbol: signal.symbol.clone(),
            stake: gate_outcome.approved_stake,
            duration: signal.duration,
            duration_unit: signal.duration_unit,
            currency: signal.currency.clone(),
            entry_mode: signal.entry_mode,
            entry_target_price: signal.entry_target_price,
            entry_slippage_pct: signal.entry_slippage_pct,
            correlation_id: signal.correlation_id.clone(),
        };

        let session = match self.sessions.get_or_create(account_id, token).await {
            Ok(s) => s,
            Err(e) => {
                self.on_failure(account_id, gate_outcome.approved_stake, &e).await;
                return Err(e);
            }
        };

        match engine::execute(&session, &params).await {
            Ok(result) => {
                result.trace.report(&self.metrics, account_id);

                self.circuit_breaker.record_success(account_id);
                self.contracts.insert(
                    account_id,
                    &signal.symbol,
                    signal.direction,
                    result.contract_id,
                    gate_outcome.approved_stake,
                    result.buy_price,
                    result.payout,
                );
                if let Some(contract) = self.contracts.get(account_id, result.contract_id) {
                    self.pnl.register_open(account_id, &contract);
                }
                self.metrics
                    .execution_outcomes_total
                    .with_label_values(&[account_id, "ok"])
                    .inc();

                let order_status_store = self.store.clone();
                let account_id_owned = account_id.to_string();
                let contract_id = result.contract_id;
                tokio::spawn(async move {
                    let _ = order_status_store
                        .append_order_status(OrderStatusRow {
                            account_id: account_id_owned,
                            contract_id: Some(contract_id),
                            event: OrderStatusEvent::BuyConfirmed,
                            detail: json!({ "buyPrice": result.buy_price, "payout": result.payout }),
                            created_at: chrono::Utc::now(),
                        })
                        .await;
                });

                self.settlement_tracker.spawn(
                    session.clone(),
                    account_id.to_string(),
                    signal.symbol.clone(),
                    result.contract_id,
                    gate_outcome.approved_stake,
                    params.duration_unit.to_millis(params.duration),
                    signal.correlation_id.clone(),
                );

                info!(account_id, contract_id = result.contract_id, "fast path executed");

                Ok(FastPathResult {
                    contract_id: result.contract_id,
                    buy_price: result.buy_price,
                    payout: result.payout,
                    status: "open",
                    execution_time_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                self.on_failure(account_id, gate_outcome.approved_stake, &e).await;

                if e.code == ErrorCode::SlippageExceeded {
                    let store = self.store.clone();
                    let account_id_owned = account_id.to_string();
                    let context = e.context.clone();
                    tokio::spawn(async move {
                        let _ = store
                            .append_order_status(OrderStatusRow {
                                account_id: account_id_owned,
                                contract_id: None,
                                event: OrderStatusEvent::SlippageReject,
                                detail: context,
                                created_at: chrono::Utc::now(),
                            })
                            .await;
                    });
                }

                warn!(account_id, error = %e, "fast path execution failed");
                Err(e)
            }
        }
    }

    async fn on_failure(&self, account_id: &str, stake: f64, error: &ExecutionError) {
        self.risk_cache.record_failed_attempt(account_id, stake);
        match error.code {
            ErrorCode::SlippageExceeded => self.risk_manager.record_slippage_reject(account_id),
            ErrorCode::ProposalReject | ErrorCode::BuyReject => {
                self.risk_manager.record_reject(account_id)
            }
            _ => {}
        }
        if error.code != ErrorCode::Throttle {
            self.circuit_breaker.record_failure(account_id, error.code);
        }
        self.metrics
            .execution_outcomes_total
            .with_label_values(&[account_id, error.code.as_str()])
            .inc();
    }
}
