//! Sell-order dispatch.
//!
//! Terminal point of both detection channels. Claims the execution in
//! the dedup ledger before submitting, so two concurrent dispatches of
//! the same execution cannot both reach the broker; a failed submission
//! releases the claim. State is snapshotted after every dispatch
//! attempt. The dispatcher never retries a submission itself; a failed
//! dispatch is retried by the polling fallback path through the
//! registry.

use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use autosell_broker::BrokerApi;
use autosell_core::{DedupLedger, FillEvent, Notifier, OrderId, TradingMode};
use autosell_store::{OrderRegistry, SnapshotStore};

/// Profit margin per mode, fully configured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MarginTable {
    #[serde(default = "default_aggressive_margin")]
    pub aggressive: Decimal,
    #[serde(default = "default_streaming_margin")]
    pub streaming: Decimal,
    #[serde(default = "default_smart_margin")]
    pub smart: Decimal,
}

fn default_aggressive_margin() -> Decimal {
    Decimal::new(3, 2) // 0.03
}
fn default_streaming_margin() -> Decimal {
    Decimal::new(3, 2) // 0.03
}
fn default_smart_margin() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

impl Default for MarginTable {
    fn default() -> Self {
        Self {
            aggressive: default_aggressive_margin(),
            streaming: default_streaming_margin(),
            smart: default_smart_margin(),
        }
    }
}

impl MarginTable {
    /// `Off` can still be asked to dispatch when a fill straddles a
    /// window boundary; it uses the conservative smart margin.
    pub fn for_mode(&self, mode: TradingMode) -> Decimal {
        match mode {
            TradingMode::Aggressive => self.aggressive,
            TradingMode::Streaming => self.streaming,
            TradingMode::Smart | TradingMode::Off => self.smart,
        }
    }
}

/// Outcome of a dispatch attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Submitted {
        sell_order_id: OrderId,
        sell_price: Decimal,
        margin: Decimal,
    },
    /// This execution was already dispatched; nothing was submitted.
    Duplicate,
    /// Submission failed; caller decides whether to register a fallback
    /// tracking record.
    Failed,
}

/// Computes the profit-target price and submits the sell order.
pub struct SellDispatcher {
    broker: Arc<dyn BrokerApi>,
    registry: OrderRegistry,
    ledger: Arc<DedupLedger>,
    snapshots: SnapshotStore,
    notifier: Arc<dyn Notifier>,
    margins: MarginTable,
}

impl SellDispatcher {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        registry: OrderRegistry,
        ledger: Arc<DedupLedger>,
        snapshots: SnapshotStore,
        notifier: Arc<dyn Notifier>,
        margins: MarginTable,
    ) -> Self {
        Self {
            broker,
            registry,
            ledger,
            snapshots,
            notifier,
            margins,
        }
    }

    pub async fn dispatch(&self, fill: &FillEvent, mode: TradingMode) -> DispatchOutcome {
        // Claim the key before the submission await point. A concurrent
        // dispatch of the same execution fails the claim and reports a
        // duplicate instead of racing the in-flight submission.
        let key = fill.dedup_key();
        if !self.ledger.mark_at(key.clone(), Utc::now()) {
            debug!(%key, "Execution already dispatched, skipping");
            return DispatchOutcome::Duplicate;
        }

        let margin = self.margins.for_mode(mode);
        // Round half away from zero: a midpoint target rounds up, never
        // below the configured margin.
        let sell_price = (fill.price * (Decimal::ONE + margin))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

        info!(
            order_id = %fill.order_id,
            ticker = %fill.ticker,
            quantity = fill.quantity,
            fill_price = %fill.price,
            %sell_price,
            %margin,
            %mode,
            source = %fill.source,
            "Dispatching auto-sell"
        );

        match self
            .broker
            .submit_sell_order(&fill.ticker, fill.quantity, sell_price)
            .await
        {
            Ok(sell_order_id) => {
                self.registry.remove(&fill.order_id);
                self.save_snapshot();

                self.notifier
                    .notify(&format!(
                        "Auto-sell submitted: {} x{} filled at {} -> sell at {} (margin {})",
                        fill.ticker, fill.quantity, fill.price, sell_price, margin
                    ))
                    .await;

                DispatchOutcome::Submitted {
                    sell_order_id,
                    sell_price,
                    margin,
                }
            }
            Err(e) => {
                // Release the claim so the polling fallback can retry.
                self.ledger.unmark(&key);
                warn!(
                    order_id = %fill.order_id,
                    ticker = %fill.ticker,
                    error = %e,
                    "Auto-sell submission failed"
                );
                self.save_snapshot();
                self.notifier
                    .notify(&format!(
                        "Auto-sell FAILED for {} order {}: {}",
                        fill.ticker, fill.order_id, e
                    ))
                    .await;
                DispatchOutcome::Failed
            }
        }
    }

    fn save_snapshot(&self) {
        if let Err(e) = self.snapshots.save(&self.registry, &self.ledger) {
            warn!(error = %e, "Failed to save state snapshot after dispatch");
        }
    }
}
