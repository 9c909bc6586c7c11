//! Streaming fill detection.
//!
//! Maintains one persistent WebSocket subscription to the brokerage
//! execution feed, parses the field-delimited execution notices, and
//! hands buy-side fills to an [`ExecutionHandler`] one message at a
//! time.

pub mod connection;
pub mod error;
pub mod keepalive;
pub mod parser;

pub use connection::{ExecutionHandler, StreamConfig, StreamConnection, StreamState};
pub use error::{StreamError, StreamResult};
pub use parser::{ExecutionParser, StreamFrame, EXECUTION_TR_ID};
