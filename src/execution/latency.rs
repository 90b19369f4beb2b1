// =============================================================================
// Latency Trace — opaque timestamps carried through one execution attempt
// =============================================================================

use crate::metrics::Metrics;

#[derive(Debug, Clone, Default)]
pub struct LatencyTrace {
    pub decision_ts: Option<u64>,
    pub gate_end_ts: Option<u64>,
    pub proposal_sent_ts: Option<u64>,
    pub proposal_ack_ts: Option<u64>,
    pub buy_sent_ts: Option<u64>,
    pub buy_ack_ts: Option<u64>,
    pub fill_ts: Option<u64>,
    pub settle_ts: Option<u64>,
    pub tick_received_ts: Option<u64>,
}

fn interval_seconds(from: Option<u64>, to: Option<u64>) -> Option<f64> {
    match (from, to) {
        (Some(a), Some(b)) if b >= a => Some((b - a) as f64 / 1000.0),
        _ => None,
    }
}

impl LatencyTrace {
    /// Reports every computed interval to the metrics sink by a fixed name
    /// (spec §4.6: "Every computed interval is reported to the metrics sink
    /// by a fixed name").
    pub fn report(&self, metrics: &Metrics, account_id: &str) {
        let intervals: [(&str, Option<f64>); 5] = [
            (
                "decision_to_gate",
                interval_seconds(self.decision_ts, self.gate_end_ts),
            ),
            (
                "gate_to_proposal",
                interval_seconds(self.gate_end_ts, self.proposal_sent_ts),
            ),
            (
                "proposal_ack",
                interval_seconds(self.proposal_sent_ts, self.proposal_ack_ts),
            ),
            (
                "buy_ack",
                interval_seconds(self.buy_sent_ts, self.buy_ack_ts),
            ),
            ("fill", interval_seconds(self.buy_ack_ts, self.fill_ts)),
        ];

        for (name, seconds) in intervals {
            if let Some(seconds) = seconds {
                metrics.observe_latency(account_id, name, seconds);
            }
        }

        if let Some(seconds) = interval_seconds(self.buy_ack_ts, self.settle_ts) {
            metrics.observe_latency(account_id, "settle", seconds);
        }
    }
}
