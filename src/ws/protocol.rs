// =============================================================================
// Broker WebSocket protocol — envelope types
// =============================================================================
//
// JSON envelopes tagged by `msg_type`, correlated by `req_id`. Request and
// response shapes come directly from spec §6; this module only defines the
// wire format, it never speaks the socket itself (see `ws::session`).
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeRequest {
    pub authorize: String,
    pub req_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest {
    pub proposal: u8,
    pub amount: f64,
    pub basis: &'static str,
    pub contract_type: &'static str,
    pub currency: String,
    pub duration: u64,
    pub duration_unit: &'static str,
    pub symbol: String,
    pub req_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyRequest {
    pub buy: String,
    pub price: f64,
    pub req_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProposalOpenContractRequest {
    pub proposal_open_contract: u8,
    pub contract_id: i64,
    pub subscribe: u8,
    pub req_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

/// Broker error envelope, present on any response that failed.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposalResponse {
    pub id: String,
    pub ask_price: f64,
    pub payout: f64,
    #[serde(default)]
    pub spot: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyResponse {
    pub contract_id: i64,
    pub buy_price: f64,
    pub payout: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProposalOpenContractResponse {
    pub contract_id: i64,
    #[serde(default)]
    pub is_sold: bool,
    #[serde(default)]
    pub profit: f64,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub payout: f64,
    #[serde(default)]
    pub current_spot: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
}

/// A generic inbound frame: every field is optional because envelopes are
/// tagged unions keyed by `msg_type`, and the router only needs to pull out
/// `req_id` for correlation before handing the raw value to the typed
/// deserializer the caller asked for.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    pub msg_type: Option<String>,
    pub req_id: Option<u64>,
    pub error: Option<BrokerError>,
    #[serde(default)]
    pub proposal: Option<Value>,
    #[serde(default)]
    pub buy: Option<Value>,
    #[serde(default)]
    pub proposal_open_contract: Option<Value>,
    #[serde(default)]
    pub subscription: Option<SubscriptionInfo>,
}

impl InboundEnvelope {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Whether this frame is a reply to an outstanding request (has a
    /// `req_id`) versus an unsolicited streaming push.
    pub fn is_request_reply(&self) -> bool {
        self.req_id.is_some()
    }
}
