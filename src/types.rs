// =============================================================================
// Shared domain types — trade signal, account identity, broker enums
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;

/// Opaque broker account identifier (e.g. a Deriv-style account id string).
pub type AccountId = String;

/// Direction of a binary contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Call,
    Put,
}

impl Direction {
    pub fn as_contract_type(self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Put => "PUT",
        }
    }
}

/// Unit for contract duration, per the broker's `duration_unit` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Tick,
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
}

impl DurationUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tick => "t",
            Self::Second => "s",
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
        }
    }

    /// Convert `duration` in this unit to milliseconds, for outer timers.
    ///
    /// Tick duration has no fixed wall-clock length; per spec §9's resolved
    /// open question, ticks are modeled as 1s each for outer-timeout purposes
    /// only (the broker's own tick cadence governs actual settlement).
    pub fn to_millis(self, duration: u64) -> u64 {
        let per_unit_ms: u64 = match self {
            Self::Tick => 1_000,
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        };
        duration.saturating_mul(per_unit_ms)
    }
}

/// How an entry price is resolved at execution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    Market,
    HybridLimitMarket,
}

/// A trade signal submitted to the pre-trade gate. Validated by [`TradeSignal::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub direction: Direction,
    pub symbol: String,
    pub stake: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub duration: u64,
    pub duration_unit: DurationUnit,
    pub entry_mode: EntryMode,
    #[serde(default)]
    pub entry_target_price: Option<f64>,
    #[serde(default)]
    pub entry_slippage_pct: Option<f64>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub bot_run_id: Option<String>,
    pub correlation_id: String,
    #[serde(default)]
    pub entry_profile_id: Option<String>,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl TradeSignal {
    /// Validate stake (positive, finite), duration (≥1), and the enumerated
    /// unit/direction/entry-mode fields. Duration and direction are already
    /// constrained at the type level by the enums above; this only needs to
    /// check the runtime numeric fields.
    pub fn validate(&self) -> Result<(), ExecutionError> {
        if !self.stake.is_finite() || self.stake <= 0.0 {
            return Err(ExecutionError::risk_halt(format!(
                "invalid stake: {}",
                self.stake
            )));
        }
        if self.duration < 1 {
            return Err(ExecutionError::risk_halt("duration must be >= 1"));
        }
        if let Some(pct) = self.entry_slippage_pct {
            if !pct.is_finite() || pct < 0.0 {
                return Err(ExecutionError::risk_halt(format!(
                    "invalid entrySlippagePct: {pct}"
                )));
            }
        }
        Ok(())
    }
}

/// Currency code attached to execution calls; kept distinct from `Symbol`
/// because the broker bills in account currency, not the traded symbol.
pub type Currency = String;

/// Fully resolved parameters handed to the execution engine once the
/// pre-trade gate has approved a stake.
#[derive(Debug, Clone)]
pub struct ExecutionParams {
    pub account_id: AccountId,
    pub token: String,
    pub direction: Direction,
    pub symbol: String,
    pub stake: f64,
    pub duration: u64,
    pub duration_unit: DurationUnit,
    pub currency: Currency,
    pub entry_mode: EntryMode,
    pub entry_target_price: Option<f64>,
    pub entry_slippage_pct: Option<f64>,
    pub correlation_id: String,
}

/// Snapshot emitted by the pre-trade gate and threaded downstream to the
/// execution engine (e.g. stop-loss passthrough).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRiskConfig {
    pub account_id: AccountId,
    pub approved_stake: f64,
    pub stop_loss: Option<f64>,
    pub strategy_requires_stop_loss: bool,
    pub max_order_stake: f64,
    pub max_notional: f64,
}

