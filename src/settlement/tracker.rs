// =============================================================================
// Settlement Tracker — spec §4.8
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::time::{sleep, timeout, Duration};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::contracts::OpenContractsIndex;
use crate::metrics::Metrics;
use crate::pnl::PnlTracker;
use crate::recovery::{RecoveryEngine, TradeOutcomeContext};
use crate::regime::RegimeDetector;
use crate::risk::cache::RiskCache;
use crate::risk::manager::RiskManager;
use crate::settlement::finalization::FinalizationState;
use crate::settlement::lock::SettlementLock;
use crate::store::{NotificationRow, NotificationType, OrderStatusEvent, OrderStatusRow, Store, TradeRow};
use crate::ws::protocol::{ForgetRequest, ProposalOpenContractRequest, ProposalOpenContractResponse};
use crate::ws::session::Session;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SettlementTracker {
    pub store: Arc<dyn Store>,
    pub contracts: Arc<OpenContractsIndex>,
    pub pnl: Arc<PnlTracker>,
    pub risk_cache: Arc<RiskCache>,
    pub risk_manager: Arc<RiskManager>,
    pub recovery: Arc<RecoveryEngine>,
    pub regime: Arc<RegimeDetector>,
    pub metrics: Arc<Metrics>,
    pub lock: Arc<SettlementLock>,
    pub finalization: Arc<FinalizationState>,
    pub config: Arc<Config>,
}

impl SettlementTracker {
    /// Spawns an independent task tracking one contract to settlement. The
    /// fast path does not await this; failures here never propagate to the
    /// caller (spec §7: "background settlement never propagates").
    pub fn spawn(
        self: &Arc<Self>,
        session: Arc<Session>,
        account_id: String,
        symbol: String,
        contract_id: i64,
        stake: f64,
        duration_ms: u64,
        correlation_id: String,
    ) {
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker
                .run(session, account_id, symbol, contract_id, stake, duration_ms, correlation_id)
                .await;
        });
    }

    #[instrument(skip(self, session), fields(account_id = %account_id, contract_id))]
    async fn run(
        &self,
        session: Arc<Session>,
        account_id: String,
        symbol: String,
        contract_id: i64,
        stake: f64,
        duration_ms: u64,
        correlation_id: String,
    ) {
        let settlement_timeout_ms = duration_ms
            .saturating_add(self.config.settlement_buffer_ms)
            .clamp(
                self.config.settlement_min_timeout_ms,
                self.config.settlement_max_timeout_ms,
            );

        let subscribe_result = self.subscribe_with_retry(&session, contract_id).await;

        let (listener_id, mut rx) = session.register_streaming_listener();

        let resolved = match subscribe_result {
            Ok(initial) if initial.is_sold => Some(initial),
            Ok(_) => {
                self.wait_for_settlement(&mut rx, contract_id, &account_id, settlement_timeout_ms)
                    .await
            }
            Err(e) => {
                warn!(account_id = %account_id, contract_id, error = %e, "subscribe failed, giving up tracking");
                None
            }
        };

        session.unregister_streaming_listener(listener_id);

        let forget_req = ForgetRequest {
            forget: format!("{contract_id}"),
        };
        let _ = session.send(forget_req, 2_000).await;

        match resolved {
            Some(update) => {
                self.finalize(&account_id, &symbol, contract_id, stake, update.profit, &correlation_id)
                    .await;
            }
            None => {
                self.metrics
                    .stuck_orders_total
                    .with_label_values(&[account_id.as_str()])
                    .inc();
                self.risk_manager.record_stuck_order(&account_id);
                self.risk_cache.record_failed_attempt(&account_id, stake);
                self.pnl.release_failed(&account_id, contract_id, stake);
                self.contracts.remove(&account_id, contract_id);
                warn!(account_id = %account_id, contract_id, "settlement timed out, recorded as stuck order");
            }
        }
    }

    async fn subscribe_with_retry(
        &self,
        session: &Session,
        contract_id: i64,
    ) -> Result<ProposalOpenContractResponse, String> {
        let mut attempt = 0;
        let mut delay = self.config.settlement_subscribe_base_delay_ms;
        loop {
            attempt += 1;
            let request = ProposalOpenContractRequest {
                proposal_open_contract: 1,
                contract_id,
                subscribe: 1,
                req_id: 0,
            };
            match session.send(request, 10_000).await {
                Ok(envelope) => {
                    if let Some(error) = envelope.error {
                        return Err(error.message);
                    }
                    let value = envelope
                        .proposal_open_contract
                        .ok_or_else(|| "missing proposal_open_contract payload".to_string())?;
                    return serde_json::from_value(value)
                        .map_err(|e| format!("malformed proposal_open_contract: {e}"));
                }
                Err(e) if e.retryable && attempt < self.config.settlement_subscribe_max_attempts => {
                    sleep(Duration::from_millis(delay)).await;
                    delay = (delay * 2).min(self.config.settlement_subscribe_max_delay_ms);
                }
                Err(e) => return Err(e.message),
            }
        }
    }

    async fn wait_for_settlement(
        &self,
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::ws::protocol::InboundEnvelope>,
        contract_id: i64,
        account_id: &str,
        timeout_ms: u64,
    ) -> Option<ProposalOpenContractResponse> {
        let deadline = timeout(Duration::from_millis(timeout_ms), async {
            loop {
                let envelope = rx.recv().await?;
                let payload = envelope.proposal_open_contract?;
                let update: ProposalOpenContractResponse = serde_json::from_value(payload).ok()?;
                if update.contract_id != contract_id {
                    continue;
                }
                if update.is_sold {
                    return Some(update);
                }
                self.contracts.mark_position(account_id, contract_id, update.profit);
                self.pnl.mark_to_market(account_id, contract_id, update.profit);
            }
        });

        deadline.await.unwrap_or(None)
    }

    #[instrument(skip(self), fields(account_id = %account_id, contract_id))]
    async fn finalize(
        &self,
        account_id: &str,
        symbol: &str,
        contract_id: i64,
        stake: f64,
        gross_profit: f64,
        correlation_id: &str,
    ) {
        let key = format!("{account_id}:{contract_id}");
        let guard = match self.lock.acquire(account_id, &key).await {
            Ok(g) => g,
            Err(e) => {
                warn!(account_id, contract_id, error = %e, "failed to acquire settlement lock");
                return;
            }
        };

        let result = self
            .finalize_locked(account_id, symbol, contract_id, stake, gross_profit, correlation_id)
            .await;

        if let Err(e) = result {
            let _ = self.store.mark_ledger_failed(correlation_id, &e).await;
            warn!(account_id, contract_id, error = %e, "finalize failed");
        }

        guard.release();
    }

    async fn finalize_locked(
        &self,
        account_id: &str,
        symbol: &str,
        contract_id: i64,
        stake: f64,
        gross_profit: f64,
        correlation_id: &str,
    ) -> Result<(), String> {
        let fees = self.config.fees_for_stake(stake);
        let net_profit = gross_profit - fees;

        self.store
            .upsert_ledger_pending(
                correlation_id,
                account_id,
                Some(contract_id),
                json!({
                    "accountId": account_id,
                    "contractId": contract_id,
                    "symbol": symbol,
                    "stake": stake,
                    "netProfit": net_profit,
                }),
            )
            .await
            .map_err(|e| e.to_string())?;

        let first_application = self.finalization.record_trade_settled_once(account_id, contract_id);
        if !first_application {
            self.store.mark_ledger_settled(correlation_id).await.map_err(|e| e.to_string())?;
            return Ok(());
        }

        self.risk_cache.record_settled(account_id, stake, net_profit, false);
        self.pnl.settle(account_id, contract_id, stake, net_profit);
        self.contracts.remove(account_id, contract_id);

        if let Some(entry) = self.risk_cache.snapshot(account_id) {
            if self.recovery.weights(account_id).is_none() {
                if let Ok(Some(persisted)) = self.store.get_neural_weights(account_id).await {
                    if let Ok(weights) = serde_json::from_value(persisted) {
                        self.recovery.hydrate(account_id, weights);
                    }
                }
            }

            let regime = self.regime.current(account_id, symbol);
            let ctx = TradeOutcomeContext::from_cache(&entry, regime.as_ref());
            let outcome_state = self.recovery.record_outcome(account_id, net_profit, ctx);

            if matches!(outcome_state.mode, crate::recovery::RecoveryMode::Graduated | crate::recovery::RecoveryMode::Cooldown)
            {
                if let Some(weights) = self.recovery.weights(account_id) {
                    if let Ok(value) = serde_json::to_value(&weights) {
                        let _ = self.store.upsert_neural_weights(account_id, value).await;
                    }
                }
            }
        }

        self.store
            .upsert_trade(TradeRow {
                account_id: account_id.to_string(),
                contract_id,
                symbol: symbol.to_string(),
                stake,
                net_profit,
                gross_profit,
                fees,
                opened_at: chrono::Utc::now(),
                settled_at: chrono::Utc::now(),
            })
            .await
            .map_err(|e| e.to_string())?;

        self.store.mark_ledger_settled(correlation_id).await.map_err(|e| e.to_string())?;

        let store = self.store.clone();
        let account_id_owned = account_id.to_string();
        tokio::spawn(async move {
            let _ = store
                .append_order_status(OrderStatusRow {
                    account_id: account_id_owned.clone(),
                    contract_id: Some(contract_id),
                    event: OrderStatusEvent::ContractSettled,
                    detail: json!({ "netProfit": net_profit }),
                    created_at: chrono::Utc::now(),
                })
                .await;
            let _ = store
                .append_notification(NotificationRow {
                    account_id: account_id_owned,
                    notification_type: NotificationType::TradeResult,
                    payload: json!({ "contractId": contract_id, "netProfit": net_profit }),
                    created_at: chrono::Utc::now(),
                })
                .await;
        });

        info!(account_id, contract_id, net_profit, "contract settled");
        Ok(())
    }
}
