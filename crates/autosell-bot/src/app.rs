//! Application wiring and run loop.
//!
//! Builds the shared state (registry, ledger, snapshot store), wires
//! both detection channels to the dispatcher, and supervises them until
//! shutdown. The streaming channel and the polling supervisor run as
//! independent tasks; a failure in one never takes the other down.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autosell_broker::{BrokerApi, KisBrokerClient, StaticTokenProvider};
use autosell_core::{
    mode_at, DedupLedger, FillEvent, LogNotifier, ModeSchedule, ModeScheduler, Notifier,
    OrderRecord, TokenProvider,
};
use autosell_dispatch::{DispatchOutcome, SellDispatcher};
use autosell_poller::{PollingSupervisor, RateLimiter};
use autosell_store::{OrderRegistry, SnapshotStore};
use autosell_stream::{ExecutionHandler, StreamConnection};

use crate::config::{AppConfig, Secrets};
use crate::error::AppResult;

const HOUSEKEEPING_INTERVAL_SECS: u64 = 30;

/// Routes streaming fills into the dispatcher.
///
/// Fills are delivered one at a time in feed order; each is dispatched
/// to completion before the connection reads the next message. A failed
/// submission registers the order for the polling fallback instead of
/// dropping the fill.
struct StreamFillHandler {
    dispatcher: Arc<SellDispatcher>,
    registry: OrderRegistry,
    ledger: Arc<DedupLedger>,
    snapshots: SnapshotStore,
    notifier: Arc<dyn Notifier>,
    schedule: ModeSchedule,
}

#[async_trait]
impl ExecutionHandler for StreamFillHandler {
    async fn on_fill(&self, fill: FillEvent) {
        let mode = mode_at(&self.schedule, Utc::now());

        match self.dispatcher.dispatch(&fill, mode).await {
            DispatchOutcome::Submitted { sell_order_id, .. } => {
                info!(
                    order_id = %fill.order_id,
                    %sell_order_id,
                    "Streaming fill auto-sold"
                );
            }
            DispatchOutcome::Duplicate => {
                debug!(order_id = %fill.order_id, "Streaming fill already handled");
            }
            DispatchOutcome::Failed => {
                // Hand the order to the polling fallback.
                let record = OrderRecord::from_fill(&fill, mode);
                if self.registry.insert(record) {
                    warn!(
                        order_id = %fill.order_id,
                        "Sell submission failed; order registered for polling fallback"
                    );
                    if let Err(e) = self.snapshots.save(&self.registry, &self.ledger) {
                        warn!(error = %e, "Failed to snapshot state after fallback registration");
                    }
                    self.notifier
                        .notify(&format!(
                            "Streaming sell failed for {} order {}; polling will retry",
                            fill.ticker, fill.order_id
                        ))
                        .await;
                }
            }
        }
    }
}

/// Top-level application.
pub struct Application {
    config: AppConfig,
    secrets: Secrets,
}

impl Application {
    pub fn new(config: AppConfig, secrets: Secrets) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config, secrets })
    }

    /// Run until Ctrl-C, then drain both channels and persist state.
    pub async fn run(self) -> AppResult<()> {
        let shutdown = CancellationToken::new();
        let now = Utc::now();

        // Shared state, restored from the last snapshot. The dispatched
        // keys come back too, so a restart within the retention window
        // does not re-sell an already-handled execution.
        let snapshots = SnapshotStore::new(self.config.persistence.state_file.clone());
        let registry = OrderRegistry::new();
        let ledger = Arc::new(DedupLedger::new());
        let retention = ChronoDuration::minutes(self.config.persistence.retention_minutes);
        let restored = snapshots.load(now, retention)?;
        if !restored.orders.is_empty() || !restored.dispatched.is_empty() {
            info!(
                orders = restored.orders.len(),
                dispatched = restored.dispatched.len(),
                "Resuming persisted state from snapshot"
            );
        }
        registry.restore(restored.orders);
        ledger.restore(restored.dispatched);
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);

        let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(
            self.secrets.access_token.clone(),
            self.secrets.approval_key.clone(),
        ));
        let broker: Arc<dyn BrokerApi> = Arc::new(KisBrokerClient::new(
            self.config.api.clone(),
            self.secrets.credentials.clone(),
            tokens.clone(),
        )?);

        let dispatcher = Arc::new(SellDispatcher::new(
            broker.clone(),
            registry.clone(),
            ledger.clone(),
            snapshots.clone(),
            notifier.clone(),
            self.config.strategy,
        ));
        let limiter = Arc::new(RateLimiter::new(self.config.rate_limit.clone()));
        let mut scheduler = ModeScheduler::new(self.config.schedule.clone(), now);
        info!(mode = %scheduler.last_mode(), "Engine starting");

        // Streaming channel.
        let mut stream_config = self.config.stream.clone();
        if stream_config.account_key.is_empty() {
            stream_config.account_key = self.secrets.credentials.cano.clone();
        }
        let handler = Arc::new(StreamFillHandler {
            dispatcher: dispatcher.clone(),
            registry: registry.clone(),
            ledger: ledger.clone(),
            snapshots: snapshots.clone(),
            notifier: notifier.clone(),
            schedule: self.config.schedule.clone(),
        });
        let stream = Arc::new(StreamConnection::new(
            stream_config,
            tokens.clone(),
            handler,
            shutdown.clone(),
        ));
        let stream_task = {
            let stream = stream.clone();
            tokio::spawn(async move {
                if let Err(e) = stream.run().await {
                    error!(error = %e, "Streaming channel terminated");
                }
            })
        };

        // Polling channel.
        let supervisor = PollingSupervisor::new(
            self.config.polling.clone(),
            self.config.schedule.clone(),
            broker,
            registry.clone(),
            ledger.clone(),
            dispatcher,
            limiter.clone(),
            snapshots.clone(),
            notifier.clone(),
            shutdown.clone(),
        );
        let polling_task = tokio::spawn(supervisor.run());

        // Housekeeping: mode transitions, ledger sweep, periodic stats.
        let dedup_retention =
            ChronoDuration::minutes(self.config.persistence.dedup_retention_minutes);
        let mut housekeeping =
            tokio::time::interval(Duration::from_secs(HOUSEKEEPING_INTERVAL_SECS));
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut mode_switches: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = housekeeping.tick() => {
                    let now = Utc::now();

                    if let Some(t) = scheduler.observe(now) {
                        mode_switches += 1;
                        info!(from = %t.from, to = %t.to, "Mode transition");
                        notifier
                            .notify(&format!("Mode changed: {} -> {}", t.from, t.to))
                            .await;
                        if let Err(e) = snapshots.save(&registry, &ledger) {
                            warn!(error = %e, "Failed to snapshot state on mode transition");
                        }
                    }

                    let swept = ledger.sweep(now, dedup_retention);
                    if swept > 0 {
                        debug!(swept, "Swept expired dedup entries");
                    }

                    let stats = limiter.stats();
                    debug!(
                        mode = %scheduler.last_mode(),
                        stream_connected = stream.is_connected(),
                        tracked_orders = registry.len(),
                        dedup_entries = ledger.len(),
                        daily_requests = stats.daily,
                        hourly_requests = stats.hourly,
                        rate_violations = stats.violations,
                        "Engine status"
                    );
                }
            }
        }

        shutdown.cancel();
        if let Err(e) = stream_task.await {
            warn!(error = %e, "Streaming task join error");
        }
        if let Err(e) = polling_task.await {
            warn!(error = %e, "Polling task join error");
        }

        snapshots.save(&registry, &ledger)?;
        let stats = limiter.stats();
        info!(
            tracked_orders = registry.len(),
            dedup_entries = ledger.len(),
            total_requests = stats.daily,
            aggressive_calls = stats.aggressive_calls,
            smart_calls = stats.smart_calls,
            mode_switches,
            rate_violations = stats.violations,
            "Shutdown complete, state persisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autosell_broker::{BrokerError, BrokerResult, OrderFillStatus};
    use autosell_core::{ExecutionId, OrderId};
    use autosell_dispatch::MarginTable;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    /// Broker scripted to accept or reject every sell submission.
    struct ScriptedBroker {
        accept: bool,
    }

    #[async_trait]
    impl BrokerApi for ScriptedBroker {
        async fn query_order_status(
            &self,
            _order_id: &OrderId,
        ) -> BrokerResult<Option<OrderFillStatus>> {
            Ok(None)
        }

        async fn fetch_today_buy_executions(&self) -> BrokerResult<Vec<FillEvent>> {
            Ok(Vec::new())
        }

        async fn submit_sell_order(
            &self,
            _ticker: &str,
            _quantity: u32,
            _price: Decimal,
        ) -> BrokerResult<OrderId> {
            if self.accept {
                Ok(OrderId::new("sell-1"))
            } else {
                Err(BrokerError::Transient("timeout".to_string()))
            }
        }
    }

    fn fill() -> FillEvent {
        FillEvent {
            order_id: OrderId::new("O1"),
            execution_id: ExecutionId::new("E1"),
            ticker: "AAPL".to_string(),
            quantity: 5,
            price: dec!(10.00),
            source: autosell_core::FillSource::Streaming,
            observed_at: Utc::now(),
        }
    }

    struct Fixture {
        handler: StreamFillHandler,
        registry: OrderRegistry,
        ledger: Arc<DedupLedger>,
        _dir: tempfile::TempDir,
    }

    fn fixture(accept: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = OrderRegistry::new();
        let ledger = Arc::new(DedupLedger::new());
        let snapshots = SnapshotStore::new(dir.path().join("state.json"));
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let dispatcher = Arc::new(SellDispatcher::new(
            Arc::new(ScriptedBroker { accept }),
            registry.clone(),
            ledger.clone(),
            snapshots.clone(),
            notifier.clone(),
            MarginTable::default(),
        ));

        let handler = StreamFillHandler {
            dispatcher,
            registry: registry.clone(),
            ledger: ledger.clone(),
            snapshots,
            notifier,
            schedule: ModeSchedule::default(),
        };

        Fixture {
            handler,
            registry,
            ledger,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_failed_stream_dispatch_registers_fallback() {
        let f = fixture(false);

        f.handler.on_fill(fill()).await;

        // The fill is not lost: tracked for polling, ledger unclaimed.
        assert!(f.registry.contains(&OrderId::new("O1")));
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_successful_stream_dispatch_marks_ledger() {
        let f = fixture(true);

        f.handler.on_fill(fill()).await;

        assert!(f.registry.is_empty());
        assert_eq!(f.ledger.len(), 1);

        // A replay of the same execution stays deduplicated.
        f.handler.on_fill(fill()).await;
        assert_eq!(f.ledger.len(), 1);
        assert!(f.registry.is_empty());
    }
}
