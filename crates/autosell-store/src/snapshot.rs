//! Atomic JSON snapshots of the order registry and dedup ledger.
//!
//! Snapshots are written to a temp file in the same directory and
//! renamed over the target, so a crash mid-write leaves the previous
//! snapshot intact. Restore filters out records and dispatched keys
//! older than the retention window and treats a corrupt file as an
//! empty one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use autosell_core::{DedupKey, DedupLedger, ExecutionId, OrderId, OrderRecord};

use crate::error::StoreResult;
use crate::registry::OrderRegistry;

#[derive(Debug, Serialize, Deserialize)]
struct DispatchedRow {
    order_id: OrderId,
    execution_id: ExecutionId,
    marked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    saved_at: DateTime<Utc>,
    orders: HashMap<OrderId, OrderRecord>,
    /// Already-dispatched executions. Absent in older snapshots.
    #[serde(default)]
    dispatched: Vec<DispatchedRow>,
}

/// Snapshot contents that survived the retention cutoff.
#[derive(Debug, Default)]
pub struct RestoredState {
    pub orders: Vec<OrderRecord>,
    pub dispatched: Vec<(DedupKey, DateTime<Utc>)>,
}

/// File-backed snapshot store for the order registry and dedup ledger.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist the registry and ledger contents atomically.
    pub fn save(&self, registry: &OrderRegistry, ledger: &DedupLedger) -> StoreResult<()> {
        self.save_at(registry, ledger, Utc::now())
    }

    pub fn save_at(
        &self,
        registry: &OrderRegistry,
        ledger: &DedupLedger,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let doc = SnapshotDocument {
            saved_at: now,
            orders: registry
                .records()
                .into_iter()
                .map(|r| (r.order_id.clone(), r))
                .collect(),
            dispatched: ledger
                .entries()
                .into_iter()
                .map(|(key, marked_at)| DispatchedRow {
                    order_id: key.order_id,
                    execution_id: key.execution_id,
                    marked_at,
                })
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&doc)?)?;
        fs::rename(&tmp, &self.path)?;

        debug!(
            path = %self.path.display(),
            orders = doc.orders.len(),
            dispatched = doc.dispatched.len(),
            "Saved snapshot"
        );
        Ok(())
    }

    /// Load persisted state newer than `retention`.
    ///
    /// A missing or corrupt snapshot yields empty state; the engine
    /// must start regardless of snapshot health.
    pub fn load(&self, now: DateTime<Utc>, retention: Duration) -> StoreResult<RestoredState> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot to restore");
                return Ok(RestoredState::default());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: SnapshotDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Snapshot is corrupt, starting empty");
                return Ok(RestoredState::default());
            }
        };

        let cutoff = now - retention;
        let total_orders = doc.orders.len();
        let orders: Vec<OrderRecord> = doc
            .orders
            .into_values()
            .filter(|r| r.created_at >= cutoff)
            .collect();
        let dispatched: Vec<(DedupKey, DateTime<Utc>)> = doc
            .dispatched
            .into_iter()
            .filter(|row| row.marked_at >= cutoff)
            .map(|row| {
                (
                    DedupKey {
                        order_id: row.order_id,
                        execution_id: row.execution_id,
                    },
                    row.marked_at,
                )
            })
            .collect();

        let discarded = total_orders - orders.len();
        info!(
            restored = orders.len(),
            discarded,
            dispatched = dispatched.len(),
            saved_at = %doc.saved_at,
            "Restored state snapshot"
        );
        Ok(RestoredState { orders, dispatched })
    }
}
