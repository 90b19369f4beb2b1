// =============================================================================
// Execution Ledger Replay — spec §4.9
// =============================================================================
//
// On startup (and on demand), scan all non-SETTLED ledger rows. For each,
// check the trades table for a matching row; if present, treat as settled.
// Otherwise re-invoke the trade-persistence path from the stored payload.
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};

use crate::store::{Store, TradeRow};

pub async fn recover_unsettled_execution_ledger(store: &Arc<dyn Store>) -> Result<u32, String> {
    let rows = store.non_settled_ledger_rows().await.map_err(|e| e.to_string())?;
    let mut processed = 0u32;

    for row in rows {
        let contract_id = match row.contract_id {
            Some(id) => id,
            None => continue,
        };

        let exists = store
            .trade_exists(&row.account_id, contract_id)
            .await
            .map_err(|e| e.to_string())?;

        if exists {
            store
                .mark_ledger_settled(&row.correlation_id)
                .await
                .map_err(|e| e.to_string())?;
            continue;
        }

        let stake = row.payload.get("stake").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let net_profit = row.payload.get("netProfit").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let symbol = row
            .payload
            .get("symbol")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let result = store
            .upsert_trade(TradeRow {
                account_id: row.account_id.clone(),
                contract_id,
                symbol,
                stake,
                net_profit,
                gross_profit: net_profit,
                fees: 0.0,
                opened_at: row.created_at,
                settled_at: chrono::Utc::now(),
            })
            .await;

        match result {
            Ok(()) => {
                store
                    .mark_ledger_settled(&row.correlation_id)
                    .await
                    .map_err(|e| e.to_string())?;
                processed += 1;
                info!(correlation_id = %row.correlation_id, contract_id, "ledger row replayed");
            }
            Err(e) => {
                warn!(correlation_id = %row.correlation_id, error = %e, "ledger replay failed to persist trade");
            }
        }
    }

    Ok(processed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;
    use serde_json::json;

    #[tokio::test]
    async fn replay_is_idempotent() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());
        store
            .upsert_ledger_pending("settlement:A:99", "A", Some(99), json!({ "stake": 2.0, "netProfit": 1.5 }))
            .await
            .unwrap();

        let processed_first = recover_unsettled_execution_ledger(&store).await.unwrap();
        assert_eq!(processed_first, 1);
        assert!(store.trade_exists("A", 99).await.unwrap());

        let processed_second = recover_unsettled_execution_ledger(&store).await.unwrap();
        assert_eq!(processed_second, 0);
    }
}
