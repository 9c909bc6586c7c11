//! Application error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(#[from] autosell_broker::BrokerError),

    #[error("Stream error: {0}")]
    Stream(#[from] autosell_stream::StreamError),

    #[error("Store error: {0}")]
    Store(#[from] autosell_store::StoreError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] autosell_telemetry::TelemetryError),

    #[error("Core error: {0}")]
    Core(#[from] autosell_core::CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
