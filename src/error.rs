// =============================================================================
// Execution Error Taxonomy
// =============================================================================
//
// A single typed error surfaces from the execution/settlement/pre-trade path.
// Every variant carries a stable `code`, a human message, a `retryable` flag,
// and a free-form context map for structured logging and API responses.
// =============================================================================

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WsTimeout,
    WsNetwork,
    ProposalReject,
    BuyReject,
    SlippageExceeded,
    Throttle,
    DuplicateRejected,
    RiskHalt,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WsTimeout => "WS_TIMEOUT",
            Self::WsNetwork => "WS_NETWORK",
            Self::ProposalReject => "PROPOSAL_REJECT",
            Self::BuyReject => "BUY_REJECT",
            Self::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            Self::Throttle => "THROTTLE",
            Self::DuplicateRejected => "DUPLICATE_REJECTED",
            Self::RiskHalt => "RISK_HALT",
        }
    }
}

/// A typed execution error, as required by spec §7: stable code, message,
/// retryable flag, structured context.
#[derive(Debug, Error, Clone)]
#[error("{code}: {message}")]
pub struct ExecutionError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub context: Value,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ExecutionError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: matches!(code, ErrorCode::WsTimeout | ErrorCode::WsNetwork | ErrorCode::Throttle),
            context: json!({}),
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn ws_timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WsTimeout, message).retryable(true)
    }

    pub fn ws_network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WsNetwork, message).retryable(true)
    }

    pub fn proposal_reject(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProposalReject, message).retryable(false)
    }

    pub fn buy_reject(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BuyReject, message).retryable(false)
    }

    pub fn slippage_exceeded(message: impl Into<String>, context: Value) -> Self {
        Self::new(ErrorCode::SlippageExceeded, message)
            .retryable(false)
            .with_context(context)
    }

    pub fn throttle(message: impl Into<String>, retry_after_ms: u64) -> Self {
        Self::new(ErrorCode::Throttle, message)
            .retryable(true)
            .with_context(json!({ "retryAfterMs": retry_after_ms }))
    }

    pub fn duplicate_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DuplicateRejected, message).retryable(false)
    }

    /// Risk-halt errors preserve the exact legacy error strings from the
    /// deprecated slow path (spec §9 open question 3): "Daily loss limit
    /// reached", "Drawdown limit reached", "Kill switch active", "Maximum
    /// concurrent trades reached", "Cooldown active", "Loss cooldown active".
    pub fn risk_halt(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::RiskHalt, message).retryable(false)
    }
}
