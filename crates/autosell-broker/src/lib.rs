//! Brokerage REST access.
//!
//! [`BrokerApi`] is the seam the rest of the engine talks through;
//! [`KisBrokerClient`] is the production implementation against the KIS
//! overseas-stock REST API.

pub mod api;
pub mod error;
pub mod kis;
pub mod token;

pub use api::{BrokerApi, OrderFillStatus};
pub use error::{BrokerError, BrokerResult};
pub use kis::{AccountCredentials, KisApiConfig, KisBrokerClient};
pub use token::StaticTokenProvider;
