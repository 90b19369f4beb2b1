// =============================================================================
// Regime feature snapshot — inputs to classification
// =============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub tick_count: u32,
    pub tick_direction_persistence: f64,
    pub volatility_ratio: f64,
    pub atr_slow: f64,
    pub std_dev: f64,
    pub rsi: f64,
    pub ema_slope_short: f64,
    pub ema_slope_long: f64,
    pub trend_strength: f64,
    pub mean_reversion_score: f64,
    pub spread_quality: f64,
    pub last_tick_age_ms: u64,
}

/// Linearly remap `value` from `[in_lo, in_hi]` to `[out_lo, out_hi]`, clamped
/// to the output range.
pub fn remap(value: f64, in_lo: f64, in_hi: f64, out_lo: f64, out_hi: f64) -> f64 {
    let t = if (in_hi - in_lo).abs() < f64::EPSILON {
        0.5
    } else {
        (value - in_lo) / (in_hi - in_lo)
    };
    let clamped = t.clamp(0.0, 1.0);
    out_lo + clamped * (out_hi - out_lo)
}
