use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use super::{
    BotRunRow, LedgerRow, LedgerState, NotificationRow, OrderStatusRow, Store, StoreError,
    TradeRow,
};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                account_id TEXT NOT NULL,
                contract_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                stake REAL NOT NULL,
                net_profit REAL NOT NULL,
                gross_profit REAL NOT NULL,
                fees REAL NOT NULL,
                opened_at TEXT NOT NULL,
                settled_at TEXT NOT NULL,
                PRIMARY KEY (account_id, contract_id)
            );

            CREATE TABLE IF NOT EXISTS order_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                contract_id INTEGER,
                event TEXT NOT NULL,
                detail TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                notification_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS execution_ledger (
                correlation_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                contract_id INTEGER,
                state TEXT NOT NULL,
                payload TEXT NOT NULL,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                account_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (account_id, key)
            );

            CREATE TABLE IF NOT EXISTS bot_runs (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                bot_id TEXT NOT NULL,
                run_status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                stopped_at TEXT,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS neural_weights (
                account_id TEXT PRIMARY KEY,
                weights TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_trade(&self, row: TradeRow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO trades (account_id, contract_id, symbol, stake, net_profit, gross_profit, fees, opened_at, settled_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id, contract_id) DO UPDATE SET
                net_profit = excluded.net_profit,
                gross_profit = excluded.gross_profit,
                fees = excluded.fees,
                settled_at = excluded.settled_at
            "#,
        )
        .bind(&row.account_id)
        .bind(row.contract_id)
        .bind(&row.symbol)
        .bind(row.stake)
        .bind(row.net_profit)
        .bind(row.gross_profit)
        .bind(row.fees)
        .bind(row.opened_at.to_rfc3339())
        .bind(row.settled_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn trade_exists(&self, account_id: &str, contract_id: i64) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM trades WHERE account_id = ? AND contract_id = ?")
            .bind(account_id)
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn append_order_status(&self, row: OrderStatusRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO order_status (account_id, contract_id, event, detail, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&row.account_id)
        .bind(row.contract_id)
        .bind(serde_json::to_string(&row.event).unwrap_or_default())
        .bind(row.detail.to_string())
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn append_notification(&self, row: NotificationRow) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (account_id, notification_type, payload, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&row.account_id)
        .bind(serde_json::to_string(&row.notification_type).unwrap_or_default())
        .bind(row.payload.to_string())
        .bind(row.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn upsert_ledger_pending(
        &self,
        correlation_id: &str,
        account_id: &str,
        contract_id: Option<i64>,
        payload: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO execution_ledger (correlation_id, account_id, contract_id, state, payload, error_message, created_at, updated_at)
            VALUES (?, ?, ?, 'pending', ?, NULL, ?, ?)
            ON CONFLICT(correlation_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(correlation_id)
        .bind(account_id)
        .bind(contract_id)
        .bind(payload.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn mark_ledger_settled(&self, correlation_id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE execution_ledger SET state = 'settled', updated_at = ? WHERE correlation_id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(correlation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn mark_ledger_failed(
        &self,
        correlation_id: &str,
        error_message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE execution_ledger SET state = 'failed', error_message = ?, updated_at = ? WHERE correlation_id = ?",
        )
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(correlation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn non_settled_ledger_rows(&self) -> Result<Vec<LedgerRow>, StoreError> {
        let rows = sqlx::query(
            "SELECT correlation_id, account_id, contract_id, state, payload, error_message, created_at, updated_at FROM execution_ledger WHERE state != 'settled'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let state_str: String = r.try_get("state").map_err(|e| StoreError::Backend(e.to_string()))?;
            let state = match state_str.as_str() {
                "pending" => LedgerState::Pending,
                "failed" => LedgerState::Failed,
                _ => LedgerState::Settled,
            };
            let payload_str: String = r.try_get("payload").map_err(|e| StoreError::Backend(e.to_string()))?;
            let created_str: String = r.try_get("created_at").map_err(|e| StoreError::Backend(e.to_string()))?;
            let updated_str: String = r.try_get("updated_at").map_err(|e| StoreError::Backend(e.to_string()))?;
            out.push(LedgerRow {
                correlation_id: r.try_get("correlation_id").map_err(|e| StoreError::Backend(e.to_string()))?,
                account_id: r.try_get("account_id").map_err(|e| StoreError::Backend(e.to_string()))?,
                contract_id: r.try_get("contract_id").map_err(|e| StoreError::Backend(e.to_string()))?,
                state,
                payload: serde_json::from_str(&payload_str).unwrap_or(Value::Null),
                error_message: r.try_get("error_message").map_err(|e| StoreError::Backend(e.to_string()))?,
                created_at: DateTime::parse_from_rfc3339(&created_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                updated_at: DateTime::parse_from_rfc3339(&updated_str)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            });
        }
        Ok(out)
    }

    async fn set_setting(&self, account_id: &str, key: &str, value: Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (account_id, key, value) VALUES (?, ?, ?) ON CONFLICT(account_id, key) DO UPDATE SET value = excluded.value",
        )
        .bind(account_id)
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_setting(&self, account_id: &str, key: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE account_id = ? AND key = ?")
            .bind(account_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some(r) => {
                let value_str: String = r.try_get("value").map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(serde_json::from_str(&value_str).unwrap_or(Value::Null)))
            }
            None => Ok(None),
        }
    }

    async fn start_bot_run(&self, row: BotRunRow) -> Result<(), StoreError> {
        let existing_running = sqlx::query(
            "SELECT id FROM bot_runs WHERE account_id = ? AND run_status = 'running'",
        )
        .bind(&row.account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        if existing_running.is_some() {
            return Err(StoreError::Invariant(format!(
                "account {} already has a running bot run",
                row.account_id
            )));
        }

        sqlx::query(
            "INSERT INTO bot_runs (id, account_id, bot_id, run_status, started_at, stopped_at, config) VALUES (?, ?, ?, 'running', ?, NULL, ?)",
        )
        .bind(&row.id)
        .bind(&row.account_id)
        .bind(&row.bot_id)
        .bind(row.started_at.to_rfc3339())
        .bind(row.config.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn stop_bot_run(&self, id: &str, stopped_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE bot_runs SET run_status = 'stopped', stopped_at = ? WHERE id = ?")
            .bind(stopped_at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn upsert_neural_weights(&self, account_id: &str, weights: Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO neural_weights (account_id, weights, updated_at) VALUES (?, ?, ?) ON CONFLICT(account_id) DO UPDATE SET weights = excluded.weights, updated_at = excluded.updated_at",
        )
        .bind(account_id)
        .bind(weights.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_neural_weights(&self, account_id: &str) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query("SELECT weights FROM neural_weights WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        match row {
            Some(r) => {
                let weights_str: String = r.try_get("weights").map_err(|e| StoreError::Backend(e.to_string()))?;
                Ok(Some(serde_json::from_str(&weights_str).unwrap_or(Value::Null)))
            }
            None => Ok(None),
        }
    }
}
