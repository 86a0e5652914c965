//! Persistence collaborator.
//!
//! The core only appends ledger entries and asks for the latest limits push;
//! schema and transport live behind [`LedgerStore`].

use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::core::{Error, LedgerEntry, Result};
use crate::strategy_cache::StratLimits;

pub trait LedgerStore: Send + Sync {
    fn create_ledger_entry(&self, entry: LedgerEntry) -> Result<()>;

    /// Most recent limits stored for a strategy key, if any.
    fn latest_limits(&self, strat_key: &str) -> Result<Option<StratLimits>>;
}

/// Process-local store used by tests and the demo binary.
#[derive(Default)]
pub struct InMemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
    limits: Mutex<HashMap<String, StratLimits>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_for(&self, order_id: &str) -> Vec<LedgerEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.order_id == order_id)
            .cloned()
            .collect()
    }

    /// Keeps whichever of the stored and offered limits has the higher seq.
    pub fn put_limits(&self, strat_key: &str, limits: StratLimits) {
        let mut map = self.limits.lock();
        match map.get(strat_key) {
            Some(existing) if existing.seq >= limits.seq => {
                debug!("ignoring limits seq {} for {}, have {}", limits.seq, strat_key, existing.seq);
            }
            _ => {
                map.insert(strat_key.to_string(), limits);
            }
        }
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn create_ledger_entry(&self, entry: LedgerEntry) -> Result<()> {
        if entry.order_id.is_empty() {
            return Err(Error::Ledger(format!("{} entry without an order id", entry.event)));
        }
        debug!("ledger {} {}", entry.event, entry.order_id);
        self.entries.lock().push(entry);
        Ok(())
    }

    fn latest_limits(&self, strat_key: &str) -> Result<Option<StratLimits>> {
        Ok(self.limits.lock().get(strat_key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OrderEventType, OrderLimits};
    use chrono::Utc;

    fn entry(order_id: &str, event: OrderEventType) -> LedgerEntry {
        LedgerEntry {
            order_id: order_id.to_string(),
            event,
            security: None,
            side: None,
            px: None,
            qty: None,
            text: None,
            event_time: Utc::now(),
        }
    }

    #[test]
    fn test_entries_filtered_by_order() {
        let store = InMemoryLedgerStore::new();
        store.create_ledger_entry(entry("a", OrderEventType::New)).unwrap();
        store.create_ledger_entry(entry("b", OrderEventType::IntReject)).unwrap();
        store.create_ledger_entry(entry("a", OrderEventType::Ack)).unwrap();
        let a = store.entries_for("a");
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].event, OrderEventType::Ack);
        assert_eq!(store.entries().len(), 3);
    }

    #[test]
    fn test_entry_without_order_id_refused() {
        let store = InMemoryLedgerStore::new();
        let err = store.create_ledger_entry(entry("", OrderEventType::IntReject)).unwrap_err();
        assert!(matches!(err, Error::Ledger(_)));
        assert!(!err.is_contract_violation());
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_latest_limits_keeps_highest_seq() {
        let store = InMemoryLedgerStore::new();
        assert!(store.latest_limits("k").unwrap().is_none());
        let limits = |seq, max_qty| StratLimits {
            seq,
            order_limits: OrderLimits {
                max_chore_qty: max_qty,
                ..OrderLimits::default()
            },
            brokers: vec![],
        };
        store.put_limits("k", limits(2, 500));
        store.put_limits("k", limits(1, 900));
        let latest = store.latest_limits("k").unwrap().unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(latest.order_limits.max_chore_qty, 500);
    }
}
