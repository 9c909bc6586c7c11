//! Auto-sell engine application: configuration, wiring, run loop.

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::{AppConfig, PersistenceConfig, Secrets};
pub use error::{AppError, AppResult};
