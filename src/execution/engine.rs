// =============================================================================
// Execution Engine — the only component that speaks the broker order protocol
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::time::timeout;
use tracing::instrument;

use crate::error::ExecutionError;
use crate::execution::latency::LatencyTrace;
use crate::types::ExecutionParams;
use crate::ws::protocol::{BuyRequest, BuyResponse, ProposalRequest, ProposalResponse};
use crate::ws::session::Session;

const PROPOSAL_TIMEOUT_MS: u64 = 10_000;
const BUY_TIMEOUT_MS: u64 = 10_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct EngineResult {
    pub contract_id: i64,
    pub buy_price: f64,
    pub payout: f64,
    pub trace: LatencyTrace,
}

/// Outer timeout for the whole engine flow: `max(30s, baseDurationMs + 15s)`.
pub fn outer_timeout_ms(params: &ExecutionParams) -> u64 {
    let base = params.duration_unit.to_millis(params.duration);
    (base + 15_000).max(30_000)
}

#[instrument(skip(session, params), fields(account_id = %params.account_id, symbol = %params.symbol))]
pub async fn execute(
    session: &Session,
    params: &ExecutionParams,
) -> Result<EngineResult, ExecutionError> {
    let outer_timeout = Duration::from_millis(outer_timeout_ms(params));
    match timeout(outer_timeout, execute_inner(session, params)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::ws_timeout(format!(
            "execution flow exceeded outer timeout of {}ms",
            outer_timeout.as_millis()
        ))),
    }
}

async fn execute_inner(
    session: &Session,
    params: &ExecutionParams,
) -> Result<EngineResult, ExecutionError> {
    let mut trace = LatencyTrace::default();
    trace.decision_ts = Some(now_ms());

    let proposal_request = ProposalRequest {
        proposal: 1,
        amount: params.stake,
        basis: "stake",
        contract_type: params.direction.as_contract_type(),
        currency: params.currency.clone(),
        duration: params.duration,
        duration_unit: params.duration_unit.as_str(),
        symbol: params.symbol.clone(),
        req_id: 0,
    };

    trace.proposal_sent_ts = Some(now_ms());
    let proposal_envelope = session.send(proposal_request, PROPOSAL_TIMEOUT_MS).await?;
    trace.proposal_ack_ts = Some(now_ms());

    if let Some(error) = proposal_envelope.error {
        return Err(ExecutionError::proposal_reject(error.message));
    }
    let proposal_value = proposal_envelope
        .proposal
        .ok_or_else(|| ExecutionError::proposal_reject("missing proposal payload"))?;
    let proposal: ProposalResponse = serde_json::from_value(proposal_value)
        .map_err(|e| ExecutionError::proposal_reject(format!("malformed proposal: {e}")))?;

    if params.entry_mode == crate::types::EntryMode::HybridLimitMarket {
        if let (Some(target), Some(tolerance_pct), Some(spot)) = (
            params.entry_target_price,
            params.entry_slippage_pct,
            proposal.spot,
        ) {
            if target != 0.0 {
                let slippage_pct = ((spot - target) / target).abs() * 100.0;
                if slippage_pct > tolerance_pct {
                    return Err(ExecutionError::slippage_exceeded(
                        "slippage exceeded tolerance",
                        json!({
                            "spot": spot,
                            "entryTargetPrice": target,
                            "slippagePct": slippage_pct,
                            "tolerancePct": tolerance_pct,
                            "askPrice": proposal.ask_price,
                        }),
                    ));
                }
            }
        }
    }

    let buy_request = BuyRequest {
        buy: proposal.id.clone(),
        price: proposal.ask_price,
        req_id: 0,
    };
    trace.buy_sent_ts = Some(now_ms());
    let buy_envelope = session.send(buy_request, BUY_TIMEOUT_MS).await?;
    trace.buy_ack_ts = Some(now_ms());

    if let Some(error) = buy_envelope.error {
        return Err(ExecutionError::buy_reject(error.message));
    }
    let buy_value = buy_envelope
        .buy
        .ok_or_else(|| ExecutionError::buy_reject("missing buy payload"))?;
    let buy: BuyResponse = serde_json::from_value(buy_value)
        .map_err(|e| ExecutionError::buy_reject(format!("malformed buy response: {e}")))?;

    Ok(EngineResult {
        contract_id: buy.contract_id,
        buy_price: buy.buy_price,
        payout: buy.payout,
        trace,
    })
}
