//! Telemetry error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Logging initialization error: {0}")]
    Init(String),
}

pub type TelemetryResult<T> = Result<T, TelemetryError>;
