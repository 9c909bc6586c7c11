//! Shared registry of tracked buy orders.

use autosell_core::{OrderId, OrderRecord};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Thread-safe map of tracked orders, shared between the streaming
/// handler, the polling supervisor, and the dispatcher. Clones share
/// the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct OrderRegistry {
    inner: Arc<Mutex<HashMap<OrderId, OrderRecord>>>,
}

impl OrderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an order. Refuses duplicates: returns false and leaves
    /// the existing record untouched if the order is already tracked.
    pub fn insert(&self, record: OrderRecord) -> bool {
        let mut orders = self.inner.lock();
        if orders.contains_key(&record.order_id) {
            warn!(order_id = %record.order_id, "Order already tracked, ignoring duplicate registration");
            return false;
        }
        debug!(order_id = %record.order_id, ticker = %record.ticker, "Tracking order");
        orders.insert(record.order_id.clone(), record);
        true
    }

    pub fn remove(&self, order_id: &OrderId) -> Option<OrderRecord> {
        self.inner.lock().remove(order_id)
    }

    pub fn get(&self, order_id: &OrderId) -> Option<OrderRecord> {
        self.inner.lock().get(order_id).cloned()
    }

    pub fn contains(&self, order_id: &OrderId) -> bool {
        self.inner.lock().contains_key(order_id)
    }

    /// Apply a mutation to a tracked record. Returns false if the order
    /// is no longer tracked.
    pub fn update<F>(&self, order_id: &OrderId, f: F) -> bool
    where
        F: FnOnce(&mut OrderRecord),
    {
        let mut orders = self.inner.lock();
        match orders.get_mut(order_id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    pub fn order_ids(&self) -> Vec<OrderId> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn records(&self) -> Vec<OrderRecord> {
        self.inner.lock().values().cloned().collect()
    }

    /// Replace the entire contents, used when restoring a snapshot at
    /// startup.
    pub fn restore(&self, records: Vec<OrderRecord>) {
        let mut orders = self.inner.lock();
        orders.clear();
        for record in records {
            orders.insert(record.order_id.clone(), record);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
