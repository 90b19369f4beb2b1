// =============================================================================
// P&L Tracker — per-account realized/unrealized aggregation + SSE snapshots
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::contracts::OpenContract;
use crate::types::AccountId;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionView {
    pub contract_id: i64,
    pub symbol: String,
    pub stake: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlSnapshot {
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub net_pnl: f64,
    pub open_position_count: u32,
    pub open_exposure: f64,
    pub win_count: u32,
    pub loss_count: u32,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub balance_drift: Option<f64>,
    pub last_known_balance: Option<f64>,
    pub positions: Vec<PositionView>,
    pub last_updated: u64,
}

struct AccountPnl {
    realized_total: f64,
    open_exposure: f64,
    win_count: u32,
    loss_count: u32,
    sum_wins: f64,
    sum_losses: f64,
    last_known_balance: Option<f64>,
    positions: HashMap<i64, PositionView>,
    tx: broadcast::Sender<PnlSnapshot>,
}

impl AccountPnl {
    fn fresh() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self {
            realized_total: 0.0,
            open_exposure: 0.0,
            win_count: 0,
            loss_count: 0,
            sum_wins: 0.0,
            sum_losses: 0.0,
            last_known_balance: None,
            positions: HashMap::new(),
            tx,
        }
    }

    fn snapshot(&self) -> PnlSnapshot {
        let unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let avg_win = if self.win_count > 0 {
            self.sum_wins / self.win_count as f64
        } else {
            0.0
        };
        let avg_loss = if self.loss_count > 0 {
            self.sum_losses / self.loss_count as f64
        } else {
            0.0
        };
        PnlSnapshot {
            realized_pnl: self.realized_total,
            unrealized_pnl: unrealized,
            net_pnl: self.realized_total + unrealized,
            open_position_count: self.positions.len() as u32,
            open_exposure: self.open_exposure,
            win_count: self.win_count,
            loss_count: self.loss_count,
            avg_win,
            avg_loss,
            balance_drift: None,
            last_known_balance: self.last_known_balance,
            positions: self.positions.values().cloned().collect(),
            last_updated: now_ms(),
        }
    }

    fn publish(&self) {
        let _ = self.tx.send(self.snapshot());
    }
}

pub struct PnlTracker {
    accounts: RwLock<HashMap<AccountId, AccountPnl>>,
}

impl PnlTracker {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, account_id: &str) -> broadcast::Receiver<PnlSnapshot> {
        let mut accounts = self.accounts.write();
        accounts
            .entry(account_id.to_string())
            .or_insert_with(AccountPnl::fresh)
            .tx
            .subscribe()
    }

    pub fn register_open(&self, account_id: &str, contract: &OpenContract) {
        let mut accounts = self.accounts.write();
        let entry = accounts.entry(account_id.to_string()).or_insert_with(AccountPnl::fresh);
        entry.open_exposure += contract.stake;
        entry.positions.insert(
            contract.contract_id,
            PositionView {
                contract_id: contract.contract_id,
                symbol: contract.symbol.clone(),
                stake: contract.stake,
                unrealized_pnl: 0.0,
            },
        );
        entry.publish();
    }

    pub fn mark_to_market(&self, account_id: &str, contract_id: i64, unrealized_pnl: f64) {
        let mut accounts = self.accounts.write();
        if let Some(entry) = accounts.get_mut(account_id) {
            if let Some(position) = entry.positions.get_mut(&contract_id) {
                position.unrealized_pnl = unrealized_pnl;
            }
            entry.publish();
        }
    }

    pub fn settle(&self, account_id: &str, contract_id: i64, stake: f64, net_profit: f64) {
        let mut accounts = self.accounts.write();
        let entry = accounts.entry(account_id.to_string()).or_insert_with(AccountPnl::fresh);
        entry.positions.remove(&contract_id);
        entry.open_exposure = (entry.open_exposure - stake).max(0.0);
        entry.realized_total += net_profit;
        if net_profit >= 0.0 {
            entry.win_count += 1;
            entry.sum_wins += net_profit;
        } else {
            entry.loss_count += 1;
            entry.sum_losses += net_profit.abs();
        }
        entry.publish();
    }

    pub fn release_failed(&self, account_id: &str, contract_id: i64, stake: f64) {
        let mut accounts = self.accounts.write();
        if let Some(entry) = accounts.get_mut(account_id) {
            entry.positions.remove(&contract_id);
            entry.open_exposure = (entry.open_exposure - stake).max(0.0);
            entry.publish();
        }
    }

    pub fn update_balance(&self, account_id: &str, balance: f64) {
        let mut accounts = self.accounts.write();
        let entry = accounts.entry(account_id.to_string()).or_insert_with(AccountPnl::fresh);
        entry.last_known_balance = Some(balance);
        entry.publish();
    }

    pub fn snapshot(&self, account_id: &str) -> Option<PnlSnapshot> {
        self.accounts.read().get(account_id).map(|e| e.snapshot())
    }
}

impl Default for PnlTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    #[test]
    fn settle_moves_exposure_to_realized() {
        let tracker = PnlTracker::new();
        let contract = OpenContract {
            account_id: "A".into(),
            contract_id: 1,
            symbol: "R_100".into(),
            direction: Direction::Call,
            stake: 10.0,
            buy_price: 10.0,
            payout: 19.5,
            opened_at: 0,
            marked_profit: 0.0,
        };
        tracker.register_open("A", &contract);
        assert_eq!(tracker.snapshot("A").unwrap().open_exposure, 10.0);
        tracker.settle("A", 1, 10.0, 9.5);
        let snap = tracker.snapshot("A").unwrap();
        assert_eq!(snap.open_exposure, 0.0);
        assert_eq!(snap.realized_pnl, 9.5);
        assert_eq!(snap.win_count, 1);
    }
}
