//! Order registry and crash-resilient snapshot persistence.

pub mod error;
pub mod registry;
pub mod snapshot;

pub use error::{StoreError, StoreResult};
pub use registry::OrderRegistry;
pub use snapshot::{RestoredState, SnapshotStore};
