// =============================================================================
// Persistent Store — trait contract + sqlite implementation
// =============================================================================
//
// Mirrors the repository-per-aggregate pattern the source engine used for
// its own persistence layer, generalized to the operations spec §6 names.
// Any store satisfying this trait is acceptable; only one implementation
// (`SqliteStore`, backed by `sqlx`) ships here.
// =============================================================================

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatusEvent {
    ProposalRequested,
    ProposalReceived,
    BuySent,
    BuyConfirmed,
    SlippageReject,
    ContractSettled,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    OrderStatus,
    TradeResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    Pending,
    Settled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotRunStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRow {
    pub account_id: String,
    pub contract_id: i64,
    pub symbol: String,
    pub stake: f64,
    pub net_profit: f64,
    pub gross_profit: f64,
    pub fees: f64,
    pub opened_at: DateTime<Utc>,
    pub settled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusRow {
    pub account_id: String,
    pub contract_id: Option<i64>,
    pub event: OrderStatusEvent,
    pub detail: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRow {
    pub account_id: String,
    pub notification_type: NotificationType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub correlation_id: String,
    pub account_id: String,
    pub contract_id: Option<i64>,
    pub state: LedgerState,
    pub payload: Value,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotRunRow {
    pub id: String,
    pub account_id: String,
    pub bot_id: String,
    pub run_status: BotRunStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub config: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("invariant violated: {0}")]
    Invariant(String),
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_trade(&self, row: TradeRow) -> Result<(), StoreError>;
    async fn trade_exists(&self, account_id: &str, contract_id: i64) -> Result<bool, StoreError>;

    async fn append_order_status(&self, row: OrderStatusRow) -> Result<(), StoreError>;
    async fn append_notification(&self, row: NotificationRow) -> Result<(), StoreError>;

    async fn upsert_ledger_pending(
        &self,
        correlation_id: &str,
        account_id: &str,
        contract_id: Option<i64>,
        payload: Value,
    ) -> Result<(), StoreError>;
    async fn mark_ledger_settled(&self, correlation_id: &str) -> Result<(), StoreError>;
    async fn mark_ledger_failed(
        &self,
        correlation_id: &str,
        error_message: &str,
    ) -> Result<(), StoreError>;
    async fn non_settled_ledger_rows(&self) -> Result<Vec<LedgerRow>, StoreError>;

    async fn set_setting(&self, account_id: &str, key: &str, value: Value) -> Result<(), StoreError>;
    async fn get_setting(&self, account_id: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Inserts a bot run, enforcing "at most one running run per account".
    async fn start_bot_run(&self, row: BotRunRow) -> Result<(), StoreError>;
    async fn stop_bot_run(&self, id: &str, stopped_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn upsert_neural_weights(&self, account_id: &str, weights: Value) -> Result<(), StoreError>;
    async fn get_neural_weights(&self, account_id: &str) -> Result<Option<Value>, StoreError>;
}
