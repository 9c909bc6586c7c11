//! Core domain types for the auto-sell engine.
//!
//! This crate provides the fundamental types used throughout the system:
//! - `OrderId`, `ExecutionId`: brokerage identifiers
//! - `FillEvent`, `OrderRecord`: detected fills and tracked buy orders
//! - `TradingMode`, `ModeScheduler`: time-of-day operating modes
//! - `DedupLedger`: at-most-once sell protection across detection channels
//! - `Notifier`: operator notification boundary

pub mod dedup;
pub mod error;
pub mod mode;
pub mod notify;
pub mod order;
pub mod token;

pub use dedup::{DedupKey, DedupLedger};
pub use error::{CoreError, Result};
pub use mode::{mode_at, ModeSchedule, ModeScheduler, ModeTransition, TimeWindow, TradingMode};
pub use notify::{LogNotifier, Notifier};
pub use order::{ExecutionId, FillEvent, FillSource, OrderId, OrderRecord};
pub use token::{AuthError, TokenProvider};
