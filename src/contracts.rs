// =============================================================================
// Open-Contracts Index — in-memory registry of live positions per account
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Direction};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenContract {
    pub account_id: AccountId,
    pub contract_id: i64,
    pub symbol: String,
    pub direction: Direction,
    pub stake: f64,
    pub buy_price: f64,
    pub payout: f64,
    pub opened_at: u64,
    pub marked_profit: f64,
}

pub struct OpenContractsIndex {
    by_account: RwLock<HashMap<AccountId, HashMap<i64, OpenContract>>>,
}

impl OpenContractsIndex {
    pub fn new() -> Self {
        Self {
            by_account: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, account_id: &str, symbol: &str, direction: Direction, contract_id: i64, stake: f64, buy_price: f64, payout: f64) {
        let mut map = self.by_account.write();
        map.entry(account_id.to_string()).or_default().insert(
            contract_id,
            OpenContract {
                account_id: account_id.to_string(),
                contract_id,
                symbol: symbol.to_string(),
                direction,
                stake,
                buy_price,
                payout,
                opened_at: now_ms(),
                marked_profit: 0.0,
            },
        );
    }

    /// Mark-to-market for a streaming update that hasn't settled yet.
    pub fn mark_position(&self, account_id: &str, contract_id: i64, profit: f64) {
        let mut map = self.by_account.write();
        if let Some(account_contracts) = map.get_mut(account_id) {
            if let Some(contract) = account_contracts.get_mut(&contract_id) {
                contract.marked_profit = profit;
            }
        }
    }

    pub fn remove(&self, account_id: &str, contract_id: i64) -> Option<OpenContract> {
        let mut map = self.by_account.write();
        map.get_mut(account_id).and_then(|c| c.remove(&contract_id))
    }

    pub fn get(&self, account_id: &str, contract_id: i64) -> Option<OpenContract> {
        self.by_account
            .read()
            .get(account_id)
            .and_then(|c| c.get(&contract_id))
            .cloned()
    }

    pub fn open_for_account(&self, account_id: &str) -> Vec<OpenContract> {
        self.by_account
            .read()
            .get(account_id)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count_for_account(&self, account_id: &str) -> usize {
        self.by_account
            .read()
            .get(account_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

impl Default for OpenContractsIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_mark_and_remove() {
        let index = OpenContractsIndex::new();
        index.insert("A", "R_100", Direction::Call, 42, 1.0, 1.0, 1.95);
        assert_eq!(index.count_for_account("A"), 1);
        index.mark_position("A", 42, 0.5);
        assert_eq!(index.get("A", 42).unwrap().marked_profit, 0.5);
        let removed = index.remove("A", 42);
        assert!(removed.is_some());
        assert_eq!(index.count_for_account("A"), 0);
    }
}
