// =============================================================================
// SSE Edge Layer — spec §6 downstream consumer protocol
// =============================================================================
//
// One `pnl` event stream per account, sourced from `PnlTracker::subscribe`,
// plus one shared stream of bot-run lifecycle events. Both are plain
// server-sent-event streams built from a broadcast receiver via
// `tokio_stream::wrappers::BroadcastStream`.
// =============================================================================

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use crate::api::auth::validate_token;
use crate::app_state::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

fn authorize(query: &StreamQuery) -> Result<(), Response> {
    let token = query.token.as_deref().unwrap_or_default();
    if validate_token(token) {
        Ok(())
    } else {
        Err((StatusCode::FORBIDDEN, "invalid or missing token").into_response())
    }
}

pub async fn pnl_stream(
    Path(account_id): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(rejection) = authorize(&query) {
        return rejection;
    }

    let rx = state.pnl.subscribe(&account_id);
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(snapshot) => serde_json::to_string(&snapshot)
                    .ok()
                    .map(|json| Ok(Event::default().event("pnl").data(json))),
                Err(_lagged) => None,
            }
        }));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

pub async fn bot_run_stream(Query(query): Query<StreamQuery>, State(state): State<Arc<AppState>>) -> Response {
    if let Err(rejection) = authorize(&query) {
        return rejection;
    }

    let rx = state.bot_run_events.subscribe();
    let stream: std::pin::Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>> =
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(event) => serde_json::to_string(&event)
                    .ok()
                    .map(|json| Ok(Event::default().event("bot_run").data(json))),
                Err(_lagged) => None,
            }
        }));

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
