// =============================================================================
// REST + SSE Edge Layer — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Only `health` is public; everything
// else requires a valid Bearer token via the `AuthBearer` extractor. CORS is
// permissive, matching the dashboard-facing posture of the source engine.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::regime::features::FeatureSnapshot;
use crate::types::TradeSignal;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/trades", post(submit_trade))
        .route("/api/v1/accounts/:account_id/pnl", get(pnl_snapshot))
        .route("/api/v1/accounts/:account_id/pnl/stream", get(crate::api::sse::pnl_stream))
        .route("/api/v1/bot-runs/stream", get(crate::api::sse::bot_run_stream))
        .route("/api/v1/accounts/:account_id/bot-runs", post(start_bot_run))
        .route("/api/v1/bot-runs/:run_id", post(stop_bot_run))
        .route("/api/v1/accounts/:account_id/regime/:symbol", get(regime_state))
        .route(
            "/api/v1/accounts/:account_id/regime/:symbol/evaluate",
            post(evaluate_regime),
        )
        .route("/api/v1/accounts/:account_id/recovery", get(recovery_state))
        .route("/api/v1/accounts/:account_id/kill-switch", post(set_kill_switch))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

#[derive(Deserialize)]
struct SubmitTradeRequest {
    account_id: String,
    token: String,
    signal: TradeSignal,
}

async fn submit_trade(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitTradeRequest>,
) -> impl IntoResponse {
    match state
        .fast_path
        .execute(&req.account_id, &req.token, req.signal)
        .await
    {
        Ok(result) => (StatusCode::OK, Json(json!(result))).into_response(),
        Err(err) => {
            let status = if err.retryable {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::UNPROCESSABLE_ENTITY
            };
            (
                status,
                Json(json!({
                    "code": err.code.as_str(),
                    "message": err.message,
                    "retryable": err.retryable,
                    "context": err.context,
                })),
            )
                .into_response()
        }
    }
}

async fn pnl_snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    match state.pnl.snapshot(&account_id) {
        Some(snapshot) => Json(json!(snapshot)).into_response(),
        None => (StatusCode::NOT_FOUND, "no pnl state for account").into_response(),
    }
}

#[derive(Deserialize)]
struct StartBotRunRequest {
    bot_id: String,
    #[serde(default)]
    config: serde_json::Value,
}

async fn start_bot_run(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<StartBotRunRequest>,
) -> impl IntoResponse {
    match state.start_bot_run(&account_id, &req.bot_id, req.config).await {
        Ok(run_id) => (StatusCode::CREATED, Json(json!({ "runId": run_id }))).into_response(),
        Err(err) => (StatusCode::CONFLICT, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn stop_bot_run(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    match state.stop_bot_run("", &run_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn regime_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((account_id, symbol)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.regime.current(&account_id, &symbol) {
        Some(regime) => Json(json!(regime)).into_response(),
        None => (StatusCode::NOT_FOUND, "no regime state yet").into_response(),
    }
}

/// Feeds one feature snapshot into the regime detector's hysteresis state
/// machine for this account/symbol. The external feature-producing service
/// drives classification by posting here; `GET .../regime/:symbol` only
/// reads back whatever this last produced.
async fn evaluate_regime(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((account_id, symbol)): Path<(String, String)>,
    Json(features): Json<FeatureSnapshot>,
) -> impl IntoResponse {
    let regime = state.regime.evaluate(&account_id, &symbol, &features);
    state.increment_version();
    Json(json!(regime))
}

async fn recovery_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    Json(json!(state.recovery.state(&account_id)))
}

#[derive(Deserialize)]
struct KillSwitchRequest {
    active: bool,
}

async fn set_kill_switch(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(req): Json<KillSwitchRequest>,
) -> impl IntoResponse {
    state.risk_manager.set_kill_switch(&account_id, req.active);
    state.increment_version();
    StatusCode::NO_CONTENT
}
