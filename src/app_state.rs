// =============================================================================
// Central Application State — Execution Core
// =============================================================================
//
// Ties every per-account subsystem together behind one Arc so HTTP handlers,
// actor tasks, and the ledger-replay startup path all see the same instances.
// Each subsystem still owns its own interior mutability (per-account maps
// guarded by their own mutex); AppState itself only adds the version counter
// and error log used by the edge layer.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::contracts::OpenContractsIndex;
use crate::execution::fast_path::FastPathTrade;
use crate::metrics::Metrics;
use crate::pnl::PnlTracker;
use crate::recovery::{RecoveryEngine, RecoveryPolicy};
use crate::regime::RegimeDetector;
use crate::risk::cache::RiskCache;
use crate::risk::circuit_breaker::CircuitBreaker;
use crate::risk::gate::PreTradeGate;
use crate::risk::manager::RiskManager;
use crate::risk::rate_limit::{RateLimitConfig, RateLimiter};
use crate::settlement::finalization::FinalizationState;
use crate::settlement::lock::SettlementLock;
use crate::settlement::tracker::SettlementTracker;
use crate::store::{BotRunRow, BotRunStatus, Store};
use crate::ws::session::WsSessionManager;

const MAX_RECENT_ERRORS: usize = 50;
const CIRCUIT_BREAKER_TRIP_THRESHOLD: u32 = 5;
const CIRCUIT_BREAKER_COOL_OFF_MS: u64 = 30_000;

/// A recorded error event for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

/// Emitted to the bot-run SSE stream on start/stop.
#[derive(Debug, Clone, Serialize)]
pub struct BotRunEvent {
    pub account_id: String,
    pub run_id: String,
    pub bot_id: String,
    pub status: &'static str,
    pub at: String,
}

pub struct AppState {
    pub state_version: AtomicU64,

    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<Metrics>,

    pub sessions: Arc<WsSessionManager>,
    pub risk_cache: Arc<RiskCache>,
    pub risk_manager: Arc<RiskManager>,
    pub circuit_breaker: Arc<CircuitBreaker>,
    pub gate: Arc<PreTradeGate>,
    pub contracts: Arc<OpenContractsIndex>,
    pub pnl: Arc<PnlTracker>,
    pub regime: Arc<RegimeDetector>,
    pub recovery: Arc<RecoveryEngine>,
    pub settlement_lock: Arc<SettlementLock>,
    pub finalization: Arc<FinalizationState>,
    pub settlement_tracker: Arc<SettlementTracker>,
    pub fast_path: Arc<FastPathTrade>,

    pub bot_run_events: broadcast::Sender<BotRunEvent>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>, metrics: Arc<Metrics>) -> Self {
        let config = Arc::new(config);

        let sessions = Arc::new(WsSessionManager::new(&config.deriv_app_id));
        let risk_cache = Arc::new(RiskCache::new());
        let rate_limiter = RateLimiter::new(RateLimitConfig::default());
        let risk_manager = Arc::new(RiskManager::new(rate_limiter));
        let circuit_breaker = Arc::new(CircuitBreaker::new(
            CIRCUIT_BREAKER_TRIP_THRESHOLD,
            CIRCUIT_BREAKER_COOL_OFF_MS,
        ));
        let contracts = Arc::new(OpenContractsIndex::new());
        let pnl = Arc::new(PnlTracker::new());
        let regime = Arc::new(RegimeDetector::new());
        let recovery = Arc::new(RecoveryEngine::new(RecoveryPolicy::default(), metrics.clone()));

        let gate = Arc::new(PreTradeGate {
            circuit_breaker: circuit_breaker.clone(),
            risk_cache: risk_cache.clone(),
            risk_manager: risk_manager.clone(),
            recovery: recovery.clone(),
            regime: regime.clone(),
            store: store.clone(),
        });

        let settlement_lock = Arc::new(SettlementLock::new(config.settlement_lock_timeout_ms, metrics.clone()));
        let finalization = Arc::new(FinalizationState::new());

        let settlement_tracker = Arc::new(SettlementTracker {
            store: store.clone(),
            contracts: contracts.clone(),
            pnl: pnl.clone(),
            risk_cache: risk_cache.clone(),
            risk_manager: risk_manager.clone(),
            recovery: recovery.clone(),
            regime: regime.clone(),
            metrics: metrics.clone(),
            lock: settlement_lock.clone(),
            finalization: finalization.clone(),
            config: config.clone(),
        });

        let fast_path = Arc::new(FastPathTrade {
            sessions: sessions.clone(),
            gate: gate.clone(),
            circuit_breaker: circuit_breaker.clone(),
            risk_cache: risk_cache.clone(),
            risk_manager: risk_manager.clone(),
            contracts: contracts.clone(),
            pnl: pnl.clone(),
            metrics: metrics.clone(),
            store: store.clone(),
            settlement_tracker: settlement_tracker.clone(),
        });

        let (bot_run_events, _) = broadcast::channel(64);

        Self {
            state_version: AtomicU64::new(1),
            config,
            store,
            metrics,
            sessions,
            risk_cache,
            risk_manager,
            circuit_breaker,
            gate,
            contracts,
            pnl,
            regime,
            recovery,
            settlement_lock,
            finalization,
            settlement_tracker,
            fast_path,
            bot_run_events,
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    pub fn push_error(&self, msg: String, code: Option<String>) {
        let record = ErrorRecord {
            message: msg,
            code,
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    /// Starts a bot run (enforcing the store's single-running-run invariant)
    /// and publishes the transition to the bot-run SSE stream.
    pub async fn start_bot_run(
        &self,
        account_id: &str,
        bot_id: &str,
        config: serde_json::Value,
    ) -> Result<String, crate::store::StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.store
            .start_bot_run(BotRunRow {
                id: run_id.clone(),
                account_id: account_id.to_string(),
                bot_id: bot_id.to_string(),
                run_status: BotRunStatus::Running,
                started_at: now,
                stopped_at: None,
                config,
            })
            .await?;

        let _ = self.bot_run_events.send(BotRunEvent {
            account_id: account_id.to_string(),
            run_id: run_id.clone(),
            bot_id: bot_id.to_string(),
            status: "running",
            at: now.to_rfc3339(),
        });
        self.increment_version();
        Ok(run_id)
    }

    pub async fn stop_bot_run(&self, account_id: &str, run_id: &str) -> Result<(), crate::store::StoreError> {
        let now = Utc::now();
        self.store.stop_bot_run(run_id, now).await?;
        let _ = self.bot_run_events.send(BotRunEvent {
            account_id: account_id.to_string(),
            run_id: run_id.to_string(),
            bot_id: String::new(),
            status: "stopped",
            at: now.to_rfc3339(),
        });
        self.increment_version();
        Ok(())
    }
}
