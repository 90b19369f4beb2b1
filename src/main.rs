// =============================================================================
// Execution Core — Main Entry Point
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod contracts;
mod error;
mod execution;
mod ledger;
mod metrics;
mod pnl;
mod recovery;
mod regime;
mod risk;
mod settlement;
mod store;
mod types;
mod ws;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::store::sqlite::SqliteStore;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("execution core starting up");

    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&config.database_url).await?);
    let metrics = Arc::new(Metrics::new()?);

    let replayed = crate::ledger::recover_unsettled_execution_ledger(&store)
        .await
        .map_err(anyhow::Error::msg)?;
    if replayed > 0 {
        info!(replayed, "execution ledger rows replayed on startup");
    }

    let state = Arc::new(AppState::new(config, store, metrics));

    let bind_addr = state.config.bind_addr.clone();
    let server_state = state.clone();
    let server = tokio::spawn(async move {
        let app = api::rest::router(server_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("failed to bind API listener");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server exited unexpectedly");
    });

    info!("execution core ready. Press Ctrl+C to stop.");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            warn!("shutdown signal received — stopping gracefully");
        }
        _ = server => {
            warn!("API server task exited early");
        }
    }

    state.sessions.close_all();
    info!("execution core shut down complete");
    Ok(())
}
