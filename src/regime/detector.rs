// =============================================================================
// Market Regime Detector — spec §4.10, with hysteresis
// =============================================================================
//
// Per (accountId, symbol), scores a FeatureSnapshot against five regimes by
// summing weighted contributions, then requires the winning regime to beat
// the incumbent for HYSTERESIS_CYCLES consecutive evaluations before it
// actually replaces `current` (spec §4.10, tested by scenario 5).
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::regime::features::{remap, FeatureSnapshot};

const HYSTERESIS_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegime {
    Trend,
    Range,
    HighVol,
    LowLiquidity,
    Uncertain,
}

impl std::fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trend => write!(f, "TREND"),
            Self::Range => write!(f, "RANGE"),
            Self::HighVol => write!(f, "HIGH_VOL"),
            Self::LowLiquidity => write!(f, "LOW_LIQUIDITY"),
            Self::Uncertain => write!(f, "UNCERTAIN"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeState {
    pub current: MarketRegime,
    pub previous_regime: Option<MarketRegime>,
    pub stable_cycles: u32,
    pub pending_transition: Option<MarketRegime>,
    pub pending_cycles: u32,
    pub confidence: f64,
}

/// Weighted score vector for the five regimes against one feature snapshot.
/// Thresholds and weights are fixed constants, not configuration.
fn score(features: &FeatureSnapshot) -> HashMap<MarketRegime, f64> {
    let mut scores = HashMap::new();

    let trend = 0.45 * remap(features.trend_strength, 0.0, 1.0, 0.0, 1.0)
        + 0.30 * remap(features.ema_slope_short.abs(), 0.0, 0.05, 0.0, 1.0)
        + 0.25 * remap(features.ema_slope_long.abs(), 0.0, 0.03, 0.0, 1.0);
    scores.insert(MarketRegime::Trend, trend);

    let range = 0.5 * remap(features.mean_reversion_score, 0.0, 1.0, 0.0, 1.0)
        + 0.3 * remap(features.rsi, 70.0, 30.0, 0.0, 1.0)
        + 0.2 * (1.0 - remap(features.volatility_ratio, 0.5, 2.0, 0.0, 1.0));
    scores.insert(MarketRegime::Range, range);

    let high_vol = 0.6 * remap(features.volatility_ratio, 1.0, 3.0, 0.0, 1.0)
        + 0.4 * remap(features.std_dev / features.atr_slow.max(1e-9), 1.0, 4.0, 0.0, 1.0);
    scores.insert(MarketRegime::HighVol, high_vol);

    let low_liquidity = 0.5 * (1.0 - remap(features.spread_quality, 0.0, 1.0, 0.0, 1.0))
        + 0.5 * remap(features.last_tick_age_ms as f64, 500.0, 10_000.0, 0.0, 1.0);
    scores.insert(MarketRegime::LowLiquidity, low_liquidity);

    let uncertain = 0.5 * (1.0 - remap(features.tick_direction_persistence.abs(), 0.0, 1.0, 0.0, 1.0))
        + 0.5 * remap(features.tick_count as f64, 0.0, 20.0, 1.0, 0.0);
    scores.insert(MarketRegime::Uncertain, uncertain);

    scores
}

fn winner(scores: &HashMap<MarketRegime, f64>) -> (MarketRegime, f64) {
    scores
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(r, s)| (*r, *s))
        .unwrap_or((MarketRegime::Uncertain, 0.0))
}

pub struct RegimeDetector {
    states: RwLock<HashMap<String, RegimeState>>,
}

impl RegimeDetector {
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    fn key(account_id: &str, symbol: &str) -> String {
        format!("{account_id}:{symbol}")
    }

    pub fn current(&self, account_id: &str, symbol: &str) -> Option<RegimeState> {
        self.states.read().get(&Self::key(account_id, symbol)).cloned()
    }

    /// Evaluates one snapshot and applies the hysteresis state machine.
    pub fn evaluate(&self, account_id: &str, symbol: &str, features: &FeatureSnapshot) -> RegimeState {
        let scores = score(features);
        let (winning_regime, confidence) = winner(&scores);

        let key = Self::key(account_id, symbol);
        let mut states = self.states.write();
        let state = states.entry(key).or_insert_with(|| RegimeState {
            current: winning_regime,
            previous_regime: None,
            stable_cycles: 1,
            pending_transition: None,
            pending_cycles: 0,
            confidence,
        });

        state.confidence = confidence;

        if winning_regime == state.current {
            state.pending_transition = None;
            state.pending_cycles = 0;
            state.stable_cycles += 1;
            return state.clone();
        }

        match state.pending_transition {
            Some(pending) if pending == winning_regime => {
                state.pending_cycles += 1;
                if state.pending_cycles >= HYSTERESIS_CYCLES {
                    state.previous_regime = Some(state.current);
                    state.current = winning_regime;
                    state.stable_cycles = 1;
                    state.pending_transition = None;
                    state.pending_cycles = 0;
                }
            }
            _ => {
                state.pending_transition = Some(winning_regime);
                state.pending_cycles = 1;
            }
        }

        state.clone()
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_features() -> FeatureSnapshot {
        FeatureSnapshot {
            tick_count: 15,
            tick_direction_persistence: 0.1,
            volatility_ratio: 0.6,
            atr_slow: 1.0,
            std_dev: 0.5,
            rsi: 50.0,
            ema_slope_short: 0.001,
            ema_slope_long: 0.001,
            trend_strength: 0.1,
            mean_reversion_score: 0.9,
            spread_quality: 0.9,
            last_tick_age_ms: 200,
        }
    }

    fn trend_features() -> FeatureSnapshot {
        FeatureSnapshot {
            tick_count: 15,
            tick_direction_persistence: 0.8,
            volatility_ratio: 1.0,
            atr_slow: 1.0,
            std_dev: 1.0,
            rsi: 60.0,
            ema_slope_short: 0.05,
            ema_slope_long: 0.03,
            trend_strength: 0.9,
            mean_reversion_score: 0.1,
            spread_quality: 0.9,
            last_tick_age_ms: 200,
        }
    }

    #[test]
    fn requires_hysteresis_cycles_before_switching() {
        let detector = RegimeDetector::new();
        // Seed a stable RANGE state.
        for _ in 0..3 {
            detector.evaluate("A", "R_100", &range_features());
        }
        assert_eq!(detector.current("A", "R_100").unwrap().current, MarketRegime::Range);

        let s1 = detector.evaluate("A", "R_100", &trend_features());
        assert_eq!(s1.current, MarketRegime::Range);
        assert_eq!(s1.pending_transition, Some(MarketRegime::Trend));

        let s2 = detector.evaluate("A", "R_100", &trend_features());
        assert_eq!(s2.current, MarketRegime::Range);

        let s3 = detector.evaluate("A", "R_100", &trend_features());
        assert_eq!(s3.current, MarketRegime::Trend);
        assert_eq!(s3.previous_regime, Some(MarketRegime::Range));
        assert_eq!(s3.stable_cycles, 1);
    }

    #[test]
    fn a_break_cancels_the_pending_transition() {
        let detector = RegimeDetector::new();
        detector.evaluate("A", "R_100", &range_features());
        let s1 = detector.evaluate("A", "R_100", &trend_features());
        assert_eq!(s1.pending_transition, Some(MarketRegime::Trend));

        let s2 = detector.evaluate("A", "R_100", &range_features());
        assert_eq!(s2.pending_transition, None);
        assert_eq!(s2.current, MarketRegime::Range);
    }
}
