// =============================================================================
// Finalization State — unifies the two settled-contract histories (§9)
// =============================================================================
//
// The source partially tracked two histories of settled contracts (a TTL map
// and a finalization-state map); this treats them as one structure per spec
// §4.8/§9, pruned by both a 6h TTL and a 10k-entry oldest-first overflow.
// =============================================================================

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const TTL_MS: u64 = 6 * 60 * 60 * 1000;
const MAX_ENTRIES: usize = 10_000;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

struct Entry {
    pnl_applied: bool,
    recorded_at: u64,
}

pub struct FinalizationState {
    entries: Mutex<HashMap<String, Entry>>,
}

impl FinalizationState {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(account_id: &str, contract_id: i64) -> String {
        format!("{account_id}:{contract_id}")
    }

    /// Applies P&L exactly once for `(accountId, contractId)`. Returns
    /// `true` if this call is the one that applies it, `false` if it was
    /// already applied (idempotent replay).
    pub fn record_trade_settled_once(&self, account_id: &str, contract_id: i64) -> bool {
        let key = Self::key(account_id, contract_id);
        let mut entries = self.entries.lock();
        self.prune(&mut entries);

        match entries.get_mut(&key) {
            Some(entry) if entry.pnl_applied => false,
            Some(entry) => {
                entry.pnl_applied = true;
                true
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        pnl_applied: true,
                        recorded_at: now_ms(),
                    },
                );
                true
            }
        }
    }

    fn prune(&self, entries: &mut HashMap<String, Entry>) {
        let now = now_ms();
        entries.retain(|_, e| now.saturating_sub(e.recorded_at) < TTL_MS);

        if entries.len() > MAX_ENTRIES {
            let mut by_age: Vec<(String, u64)> =
                entries.iter().map(|(k, v)| (k.clone(), v.recorded_at)).collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            let overflow = entries.len() - MAX_ENTRIES;
            for (key, _) in by_age.into_iter().take(overflow) {
                entries.remove(&key);
            }
        }
    }
}

impl Default for FinalizationState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pnl_applies_exactly_once() {
        let state = FinalizationState::new();
        assert!(state.record_trade_settled_once("A", 1));
        assert!(!state.record_trade_settled_once("A", 1));
    }

    #[test]
    fn distinct_contracts_are_independent() {
        let state = FinalizationState::new();
        assert!(state.record_trade_settled_once("A", 1));
        assert!(state.record_trade_settled_once("A", 2));
    }
}
