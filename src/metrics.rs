// =============================================================================
// Metrics — Prometheus facade
// =============================================================================
//
// The sink itself (where these numbers end up — a scrape endpoint, a push
// gateway) is out of scope per the specification; this module only defines
// and updates the instruments. All names use the `execcore_` prefix.
// =============================================================================

use prometheus::{
    core::{AtomicF64, GenericGauge},
    CounterVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    /// Latency trace intervals, by name (decision_to_gate, gate_to_proposal,
    /// proposal_ack, buy_ack, fill, settle), labelled by account.
    pub latency_seconds: HistogramVec,

    /// Settlement lock wait time.
    pub settlement_lock_wait_seconds: HistogramVec,
    /// Settlement lock contention events (a waiter had to queue behind another).
    pub settlement_lock_contention_total: CounterVec,
    /// Settlement lock acquisition timeouts.
    pub settlement_lock_timeouts_total: CounterVec,

    /// Circuit breaker state transitions, by account and to-state.
    pub circuit_breaker_transitions_total: CounterVec,
    /// Recovery engine mode transitions, by account and to-mode.
    pub recovery_mode_transitions_total: CounterVec,

    /// Execution outcomes by error code (or "ok").
    pub execution_outcomes_total: CounterVec,
    /// Stuck orders recorded by the settlement tracker.
    pub stuck_orders_total: CounterVec,

    /// Current open exposure, by account.
    pub open_exposure: GenericGauge<AtomicF64>,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "execcore_latency_seconds",
                "Execution pipeline interval latencies",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["account_id", "interval"],
        )?;
        registry.register(Box::new(latency_seconds.clone()))?;

        let settlement_lock_wait_seconds = HistogramVec::new(
            HistogramOpts::new(
                "execcore_settlement_lock_wait_seconds",
                "Time spent waiting to acquire the per-contract settlement lock",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0]),
            &["account_id"],
        )?;
        registry.register(Box::new(settlement_lock_wait_seconds.clone()))?;

        let settlement_lock_contention_total = CounterVec::new(
            Opts::new(
                "execcore_settlement_lock_contention_total",
                "Settlement lock acquisitions that had to queue behind another waiter",
            ),
            &["account_id"],
        )?;
        registry.register(Box::new(settlement_lock_contention_total.clone()))?;

        let settlement_lock_timeouts_total = CounterVec::new(
            Opts::new(
                "execcore_settlement_lock_timeouts_total",
                "Settlement lock acquisition timeouts",
            ),
            &["account_id"],
        )?;
        registry.register(Box::new(settlement_lock_timeouts_total.clone()))?;

        let circuit_breaker_transitions_total = CounterVec::new(
            Opts::new(
                "execcore_circuit_breaker_transitions_total",
                "Execution circuit breaker state transitions",
            ),
            &["account_id", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions_total.clone()))?;

        let recovery_mode_transitions_total = CounterVec::new(
            Opts::new(
                "execcore_recovery_mode_transitions_total",
                "Recovery engine mode transitions",
            ),
            &["account_id", "to_mode"],
        )?;
        registry.register(Box::new(recovery_mode_transitions_total.clone()))?;

        let execution_outcomes_total = CounterVec::new(
            Opts::new(
                "execcore_execution_outcomes_total",
                "Fast-path execution outcomes by result code",
            ),
            &["account_id", "code"],
        )?;
        registry.register(Box::new(execution_outcomes_total.clone()))?;

        let stuck_orders_total = CounterVec::new(
            Opts::new(
                "execcore_stuck_orders_total",
                "Contracts that timed out waiting for settlement",
            ),
            &["account_id"],
        )?;
        registry.register(Box::new(stuck_orders_total.clone()))?;

        let open_exposure = prometheus::Gauge::with_opts(Opts::new(
            "execcore_open_exposure",
            "Current aggregate open exposure across all accounts",
        ))?;
        registry.register(Box::new(open_exposure.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            latency_seconds,
            settlement_lock_wait_seconds,
            settlement_lock_contention_total,
            settlement_lock_timeouts_total,
            circuit_breaker_transitions_total,
            recovery_mode_transitions_total,
            execution_outcomes_total,
            stuck_orders_total,
            open_exposure,
        })
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_default()
    }

    pub fn observe_latency(&self, account_id: &str, interval: &str, seconds: f64) {
        self.latency_seconds
            .with_label_values(&[account_id, interval])
            .observe(seconds);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("failed to construct metrics registry")
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prefixed_families() {
        let m = Metrics::new().unwrap();
        m.observe_latency("acc1", "buy_ack", 0.2);
        let out = m.render();
        assert!(out.contains("execcore_latency_seconds"));
    }
}
