//! Deduplication ledger.
//!
//! Both detection channels claim an execution here before dispatching a
//! sell, so a fill seen by the stream and again by a poll cycle sells at
//! most once. A failed submission releases its claim; entries are
//! persisted with the registry snapshot and restored at startup.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

use crate::order::{ExecutionId, OrderId};

/// Identity of a single execution: order number plus execution number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub order_id: OrderId,
    pub execution_id: ExecutionId,
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.order_id, self.execution_id)
    }
}

/// In-memory set of already-dispatched executions.
#[derive(Debug, Default)]
pub struct DedupLedger {
    entries: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Whether any execution of this order has been dispatched. The
    /// discovery scan keys on order number alone.
    pub fn contains_order(&self, order_id: &OrderId) -> bool {
        self.entries
            .lock()
            .keys()
            .any(|k| &k.order_id == order_id)
    }

    /// Claim an execution for dispatch. Returns false if it was already
    /// claimed; the single lock acquisition makes the check-and-claim
    /// atomic across concurrent dispatchers.
    pub fn mark_at(&self, key: DedupKey, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, now);
        true
    }

    pub fn mark(&self, key: DedupKey) -> bool {
        self.mark_at(key, Utc::now())
    }

    /// Release a claim after a failed submission, so the fallback path
    /// may dispatch the execution later.
    pub fn unmark(&self, key: &DedupKey) {
        self.entries.lock().remove(key);
    }

    /// Snapshot view of the entries, for persistence.
    pub fn entries(&self) -> Vec<(DedupKey, DateTime<Utc>)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// Replace the entire contents, used when restoring a snapshot at
    /// startup.
    pub fn restore(&self, entries: Vec<(DedupKey, DateTime<Utc>)>) {
        let mut map = self.entries.lock();
        map.clear();
        map.extend(entries);
    }

    /// Drop entries older than `retention`. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, marked_at| *marked_at >= cutoff);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "Swept dedup ledger");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, min, 0).unwrap()
    }

    fn key(order: &str, exec: &str) -> DedupKey {
        DedupKey {
            order_id: OrderId::new(order),
            execution_id: ExecutionId::new(exec),
        }
    }

    #[test]
    fn test_mark_once() {
        let ledger = DedupLedger::new();
        assert!(ledger.mark_at(key("O1", "E1"), utc(1, 0)));
        assert!(!ledger.mark_at(key("O1", "E1"), utc(1, 1)));
        assert!(ledger.contains(&key("O1", "E1")));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_distinct_executions_of_same_order() {
        let ledger = DedupLedger::new();
        assert!(ledger.mark_at(key("O1", "E1"), utc(1, 0)));
        assert!(ledger.mark_at(key("O1", "E2"), utc(1, 0)));
        assert!(ledger.contains_order(&OrderId::new("O1")));
        assert!(!ledger.contains_order(&OrderId::new("O2")));
    }

    #[test]
    fn test_unmark_releases_claim() {
        let ledger = DedupLedger::new();
        assert!(ledger.mark_at(key("O1", "E1"), utc(1, 0)));
        ledger.unmark(&key("O1", "E1"));
        assert!(ledger.is_empty());
        // The released key can be claimed again.
        assert!(ledger.mark_at(key("O1", "E1"), utc(1, 1)));
    }

    #[test]
    fn test_restore_replaces_contents() {
        let ledger = DedupLedger::new();
        ledger.mark_at(key("O1", "E1"), utc(1, 0));

        ledger.restore(vec![(key("O2", "E1"), utc(2, 0)), (key("O3", "E1"), utc(2, 5))]);
        assert!(!ledger.contains(&key("O1", "E1")));
        assert!(ledger.contains(&key("O2", "E1")));
        assert_eq!(ledger.entries().len(), 2);
    }

    #[test]
    fn test_sweep_drops_old_entries() {
        let ledger = DedupLedger::new();
        ledger.mark_at(key("O1", "E1"), utc(1, 0));
        ledger.mark_at(key("O2", "E1"), utc(2, 30));

        let removed = ledger.sweep(utc(3, 0), Duration::hours(1));
        assert_eq!(removed, 1);
        assert!(!ledger.contains(&key("O1", "E1")));
        assert!(ledger.contains(&key("O2", "E1")));
    }
}
