//! Auto-sell dispatch.

pub mod dispatcher;

pub use dispatcher::{DispatchOutcome, MarginTable, SellDispatcher};
