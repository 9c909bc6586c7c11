//! The brokerage seam.

use async_trait::async_trait;
use autosell_core::{FillEvent, OrderId};
use rust_decimal::Decimal;

use crate::error::BrokerResult;

/// Status of a tracked order as reported by the brokerage.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFillStatus {
    /// Broker-reported status string, e.g. a Korean fill-state label.
    pub status: String,
    pub filled_quantity: u32,
    pub filled_price: Decimal,
}

/// Brokerage operations the engine needs. Production talks to KIS;
/// tests substitute a mock.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Look up the current fill status of a single order. `None` means
    /// the brokerage has no record of it in today's order book.
    async fn query_order_status(&self, order_id: &OrderId) -> BrokerResult<Option<OrderFillStatus>>;

    /// Fetch today's completed buy-side executions, for the discovery
    /// scan that catches fills the stream missed.
    async fn fetch_today_buy_executions(&self) -> BrokerResult<Vec<FillEvent>>;

    /// Submit a limit sell order. Returns the new sell order's number.
    async fn submit_sell_order(
        &self,
        ticker: &str,
        quantity: u32,
        price: Decimal,
    ) -> BrokerResult<OrderId>;
}
