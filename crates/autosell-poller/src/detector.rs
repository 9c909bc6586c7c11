//! Polling supervisor.
//!
//! On each tick: expire stale records, run a discovery scan for fills
//! the stream missed, then walk the tracked orders whose per-order
//! interval has elapsed. Every outbound request is gated by the rate
//! limiter; a denied request skips the cycle. No single request
//! failure terminates the loop.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use autosell_broker::{BrokerApi, BrokerError, OrderFillStatus};
use autosell_core::{
    mode_at, DedupLedger, ExecutionId, FillEvent, FillSource, ModeSchedule, Notifier, OrderRecord,
    TradingMode,
};
use autosell_dispatch::{DispatchOutcome, SellDispatcher};
use autosell_store::{OrderRegistry, SnapshotStore};

use crate::interval::{max_age_for, polling_interval, AggressiveConfig, SmartConfig};
use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Supervisor tick while a polling mode is active.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Supervisor tick while streaming is primary or everything is off.
    #[serde(default = "default_idle_tick_secs")]
    pub idle_tick_secs: u64,
    /// Pause between individual order checks within one pass.
    #[serde(default = "default_inter_check_delay_ms")]
    pub inter_check_delay_ms: u64,
    /// Snapshot the registry every N processed checks.
    #[serde(default = "default_snapshot_every_checks")]
    pub snapshot_every_checks: u32,
    /// Broker status strings that mean "completely filled".
    #[serde(default = "default_filled_statuses")]
    pub filled_statuses: Vec<String>,
    #[serde(default)]
    pub aggressive: AggressiveConfig,
    #[serde(default)]
    pub smart: SmartConfig,
}

fn default_tick_secs() -> u64 {
    5
}
fn default_idle_tick_secs() -> u64 {
    30
}
fn default_inter_check_delay_ms() -> u64 {
    500
}
fn default_snapshot_every_checks() -> u32 {
    10
}
fn default_filled_statuses() -> Vec<String> {
    vec!["체결완료".to_string(), "완전체결".to_string()]
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            idle_tick_secs: default_idle_tick_secs(),
            inter_check_delay_ms: default_inter_check_delay_ms(),
            snapshot_every_checks: default_snapshot_every_checks(),
            filled_statuses: default_filled_statuses(),
            aggressive: AggressiveConfig::default(),
            smart: SmartConfig::default(),
        }
    }
}

/// Polling fill detector: discovery scan plus tracking loop.
pub struct PollingSupervisor {
    config: PollingConfig,
    schedule: ModeSchedule,
    broker: Arc<dyn BrokerApi>,
    registry: OrderRegistry,
    ledger: Arc<DedupLedger>,
    dispatcher: Arc<SellDispatcher>,
    limiter: Arc<RateLimiter>,
    snapshots: SnapshotStore,
    notifier: Arc<dyn Notifier>,
    shutdown: CancellationToken,
    checks_since_snapshot: u32,
}

impl PollingSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PollingConfig,
        schedule: ModeSchedule,
        broker: Arc<dyn BrokerApi>,
        registry: OrderRegistry,
        ledger: Arc<DedupLedger>,
        dispatcher: Arc<SellDispatcher>,
        limiter: Arc<RateLimiter>,
        snapshots: SnapshotStore,
        notifier: Arc<dyn Notifier>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            schedule,
            broker,
            registry,
            ledger,
            dispatcher,
            limiter,
            snapshots,
            notifier,
            shutdown,
            checks_since_snapshot: 0,
        }
    }

    /// Run until shutdown. The current iteration always completes
    /// before the loop exits.
    pub async fn run(mut self) {
        info!("Polling supervisor started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let now = Utc::now();
            let mode = mode_at(&self.schedule, now);

            self.cleanup_expired(mode);

            let tick = if matches!(mode, TradingMode::Aggressive | TradingMode::Smart) {
                self.discovery_scan(mode).await;
                self.tracking_pass(mode).await;
                self.config.tick_secs
            } else {
                self.config.idle_tick_secs
            };

            tokio::select! {
                () = tokio::time::sleep(Duration::from_secs(tick)) => {}
                () = self.shutdown.cancelled() => break,
            }
        }

        info!("Polling supervisor stopped");
    }

    /// Drop records past the mode-dependent maximum age, without any
    /// dispatch attempt. Expiry is abandonment, not an error.
    fn cleanup_expired(&mut self, mode: TradingMode) {
        let now = Utc::now();
        let max_age = max_age_for(mode, &self.config.aggressive, &self.config.smart);

        let mut expired = 0;
        for record in self.registry.records() {
            if record.age(now) > max_age {
                warn!(
                    order_id = %record.order_id,
                    ticker = %record.ticker,
                    age_minutes = record.age(now).num_minutes(),
                    "Expiring stale tracked order"
                );
                self.registry.remove(&record.order_id);
                expired += 1;
            }
        }

        if expired > 0 {
            self.save_snapshot();
        }
    }

    /// Look for completed buy fills the engine does not know yet.
    async fn discovery_scan(&mut self, mode: TradingMode) {
        if !self.limiter.can_request(mode) {
            return;
        }
        self.limiter.record_request(mode);

        let fills = match self.broker.fetch_today_buy_executions().await {
            Ok(fills) => fills,
            Err(e) => {
                self.handle_broker_error("discovery scan", &e).await;
                return;
            }
        };

        for fill in fills {
            if self.registry.contains(&fill.order_id)
                || self.ledger.contains_order(&fill.order_id)
            {
                debug!(order_id = %fill.order_id, "Discovered fill already known");
                continue;
            }

            info!(
                order_id = %fill.order_id,
                ticker = %fill.ticker,
                quantity = fill.quantity,
                price = %fill.price,
                "Discovered untracked buy fill"
            );

            match self.dispatcher.dispatch(&fill, mode).await {
                DispatchOutcome::Submitted { .. } | DispatchOutcome::Duplicate => {}
                DispatchOutcome::Failed => {
                    // Keep the fill alive for the tracking loop to retry.
                    if self.registry.insert(OrderRecord::from_fill(&fill, mode)) {
                        self.save_snapshot();
                        self.notifier
                            .notify(&format!(
                                "Tracking {} order {} after failed auto-sell",
                                fill.ticker, fill.order_id
                            ))
                            .await;
                    }
                }
            }
        }
    }

    /// Check tracked orders whose per-order interval has elapsed.
    async fn tracking_pass(&mut self, mode: TradingMode) {
        for order_id in self.registry.order_ids() {
            if self.shutdown.is_cancelled() {
                return;
            }

            let Some(record) = self.registry.get(&order_id) else {
                continue;
            };

            let now = Utc::now();
            let interval = polling_interval(
                mode,
                &record,
                now,
                &self.config.aggressive,
                &self.config.smart,
            );
            if !record.due_for_check(now, interval) {
                continue;
            }

            if !self.limiter.can_request(mode) {
                continue;
            }
            self.limiter.record_request(mode);

            match self.broker.query_order_status(&order_id).await {
                Ok(Some(status)) => {
                    let still_tracked = self.registry.update(&order_id, |r| {
                        r.record_status(&status.status, now);
                    });
                    if !still_tracked {
                        continue;
                    }
                    if self.is_filled(&status) {
                        self.dispatch_tracked(&order_id, &record, &status, mode).await;
                    }
                }
                Ok(None) => {
                    debug!(%order_id, "Order not in today's book, counting as inconclusive");
                    self.registry.update(&order_id, |r| r.record_check_failure(now));
                }
                Err(e) => {
                    self.registry.update(&order_id, |r| r.record_check_failure(now));
                    self.handle_broker_error("status check", &e).await;
                }
            }

            self.checks_since_snapshot += 1;
            if self.checks_since_snapshot >= self.config.snapshot_every_checks {
                self.save_snapshot();
                self.checks_since_snapshot = 0;
            }

            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(self.config.inter_check_delay_ms)) => {}
                () = self.shutdown.cancelled() => return,
            }
        }
    }

    async fn dispatch_tracked(
        &self,
        order_id: &autosell_core::OrderId,
        record: &OrderRecord,
        status: &OrderFillStatus,
        mode: TradingMode,
    ) {
        let price = if status.filled_price > rust_decimal::Decimal::ZERO {
            status.filled_price
        } else {
            record.buy_price
        };

        let fill = FillEvent {
            order_id: order_id.clone(),
            // Terminal fill of a tracked order; the order number is the
            // execution identity on this path.
            execution_id: ExecutionId::new(order_id.as_str()),
            ticker: record.ticker.clone(),
            quantity: record.quantity,
            price,
            source: FillSource::Polling,
            observed_at: Utc::now(),
        };

        info!(
            %order_id,
            ticker = %record.ticker,
            status = %status.status,
            filled_quantity = status.filled_quantity,
            "Tracked order filled"
        );

        // On success the dispatcher removes the record and snapshots;
        // on failure the record stays for the next pass.
        self.dispatcher.dispatch(&fill, mode).await;
    }

    async fn handle_broker_error(&self, context: &str, e: &BrokerError) {
        if e.is_rate_limited() {
            self.limiter.penalize();
            self.notifier
                .notify(&format!("Broker rate limit hit during {context}, cooling down"))
                .await;
        } else {
            warn!(context, error = %e, "Broker request failed");
        }
    }

    fn is_filled(&self, status: &OrderFillStatus) -> bool {
        status.filled_quantity > 0
            && self
                .config
                .filled_statuses
                .iter()
                .any(|s| s == &status.status)
    }

    fn save_snapshot(&self) {
        if let Err(e) = self.snapshots.save(&self.registry, &self.ledger) {
            warn!(error = %e, "Failed to save state snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use autosell_broker::BrokerResult;
    use autosell_core::{OrderId, TimeWindow};
    use autosell_dispatch::MarginTable;
    use chrono::Duration as ChronoDuration;
    use mockall::mock;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    mock! {
        Broker {}

        #[async_trait]
        impl BrokerApi for Broker {
            async fn query_order_status(
                &self,
                order_id: &OrderId,
            ) -> BrokerResult<Option<OrderFillStatus>>;
            async fn fetch_today_buy_executions(&self) -> BrokerResult<Vec<FillEvent>>;
            async fn submit_sell_order(
                &self,
                ticker: &str,
                quantity: u32,
                price: Decimal,
            ) -> BrokerResult<OrderId>;
        }
    }

    struct SilentNotifier;

    #[async_trait]
    impl Notifier for SilentNotifier {
        async fn notify(&self, _text: &str) {}
    }

    fn schedule() -> ModeSchedule {
        ModeSchedule {
            utc_offset_hours: 0,
            streaming: vec![],
            aggressive: vec![TimeWindow::parse("00:00", "12:00").unwrap()],
            smart: vec![TimeWindow::parse("12:00", "23:59").unwrap()],
        }
    }

    fn permissive_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(crate::rate_limiter::RateLimitConfig {
            min_interval_secs: 0,
            consecutive_limit: 1000,
            cooldown_secs: 1,
            daily_limit: 10_000,
            hourly_limit: 10_000,
            aggressive_mode_limit: 10_000,
            smart_mode_limit: 10_000,
        }))
    }

    struct Fixture {
        supervisor: PollingSupervisor,
        registry: OrderRegistry,
        ledger: Arc<DedupLedger>,
        _dir: tempfile::TempDir,
    }

    fn fixture(broker: MockBroker) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let broker: Arc<dyn BrokerApi> = Arc::new(broker);
        let registry = OrderRegistry::new();
        let ledger = Arc::new(DedupLedger::new());
        let snapshots = SnapshotStore::new(dir.path().join("state.json"));
        let notifier: Arc<dyn Notifier> = Arc::new(SilentNotifier);
        let dispatcher = Arc::new(SellDispatcher::new(
            broker.clone(),
            registry.clone(),
            ledger.clone(),
            snapshots.clone(),
            notifier.clone(),
            MarginTable::default(),
        ));

        let config = PollingConfig {
            inter_check_delay_ms: 0,
            ..Default::default()
        };

        let supervisor = PollingSupervisor::new(
            config,
            schedule(),
            broker,
            registry.clone(),
            ledger.clone(),
            dispatcher,
            permissive_limiter(),
            snapshots,
            notifier,
            CancellationToken::new(),
        );

        Fixture {
            supervisor,
            registry,
            ledger,
            _dir: dir,
        }
    }

    fn tracked(id: &str, age_minutes: i64, mode: TradingMode) -> OrderRecord {
        OrderRecord::new(
            OrderId::new(id),
            "AAPL",
            5,
            dec!(10.00),
            mode,
            Utc::now() - ChronoDuration::minutes(age_minutes),
        )
    }

    #[tokio::test]
    async fn test_expired_aggressive_record_dropped_without_dispatch() {
        // No expectations on the mock: any broker call would panic.
        let broker = MockBroker::new();
        let mut f = fixture(broker);

        f.registry.insert(tracked("O1", 31, TradingMode::Aggressive));
        f.supervisor.cleanup_expired(TradingMode::Aggressive);

        assert!(f.registry.is_empty());
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_record_survives_cleanup() {
        let broker = MockBroker::new();
        let mut f = fixture(broker);

        f.registry.insert(tracked("O1", 29, TradingMode::Aggressive));
        f.supervisor.cleanup_expired(TradingMode::Aggressive);
        assert_eq!(f.registry.len(), 1);

        // The same age survives under smart mode's longer window too.
        f.registry.insert(tracked("O2", 100, TradingMode::Smart));
        f.supervisor.cleanup_expired(TradingMode::Smart);
        assert_eq!(f.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_tracked_fill_dispatches_and_removes() {
        let mut broker = MockBroker::new();
        broker.expect_query_order_status().times(1).returning(|_| {
            Ok(Some(OrderFillStatus {
                status: "체결완료".to_string(),
                filled_quantity: 5,
                filled_price: dec!(10.00),
            }))
        });
        broker
            .expect_submit_sell_order()
            .times(1)
            .returning(|_, _, _| Ok(OrderId::new("sell-1")));

        let mut f = fixture(broker);
        f.registry.insert(tracked("O1", 1, TradingMode::Aggressive));

        f.supervisor.tracking_pass(TradingMode::Aggressive).await;

        assert!(f.registry.is_empty());
        assert!(f.ledger.contains_order(&OrderId::new("O1")));
    }

    #[tokio::test]
    async fn test_pending_status_keeps_record() {
        let mut broker = MockBroker::new();
        broker.expect_query_order_status().times(1).returning(|_| {
            Ok(Some(OrderFillStatus {
                status: "접수".to_string(),
                filled_quantity: 0,
                filled_price: Decimal::ZERO,
            }))
        });

        let mut f = fixture(broker);
        f.registry.insert(tracked("O1", 1, TradingMode::Aggressive));

        f.supervisor.tracking_pass(TradingMode::Aggressive).await;

        let record = f.registry.get(&OrderId::new("O1")).unwrap();
        assert_eq!(record.last_status.as_deref(), Some("접수"));
        assert_eq!(record.check_count, 1);
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_query_failure_counts_and_continues() {
        let mut broker = MockBroker::new();
        broker
            .expect_query_order_status()
            .times(1)
            .returning(|_| Err(BrokerError::Transient("timeout".to_string())));

        let mut f = fixture(broker);
        f.registry.insert(tracked("O1", 1, TradingMode::Aggressive));

        f.supervisor.tracking_pass(TradingMode::Aggressive).await;

        let record = f.registry.get(&OrderId::new("O1")).unwrap();
        assert_eq!(record.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_discovery_registers_fallback_on_failed_dispatch() {
        let fill = FillEvent {
            order_id: OrderId::new("O9"),
            execution_id: ExecutionId::new("O9"),
            ticker: "NVDA".to_string(),
            quantity: 2,
            price: dec!(120.00),
            source: FillSource::Polling,
            observed_at: Utc::now(),
        };

        let mut broker = MockBroker::new();
        let fetched = vec![fill.clone()];
        broker
            .expect_fetch_today_buy_executions()
            .times(1)
            .returning(move || Ok(fetched.clone()));
        broker
            .expect_submit_sell_order()
            .times(1)
            .returning(|_, _, _| Err(BrokerError::Transient("timeout".to_string())));

        let mut f = fixture(broker);
        f.supervisor.discovery_scan(TradingMode::Smart).await;

        // Failed dispatch leaves no ledger mark but a tracking record.
        assert!(f.ledger.is_empty());
        assert!(f.registry.contains(&OrderId::new("O9")));
    }

    #[tokio::test]
    async fn test_discovery_skips_known_orders() {
        let known = FillEvent {
            order_id: OrderId::new("O1"),
            execution_id: ExecutionId::new("O1"),
            ticker: "AAPL".to_string(),
            quantity: 5,
            price: dec!(10.00),
            source: FillSource::Polling,
            observed_at: Utc::now(),
        };
        let dispatched = FillEvent {
            order_id: OrderId::new("O2"),
            execution_id: ExecutionId::new("E7"),
            ticker: "TSLA".to_string(),
            quantity: 1,
            price: dec!(250.00),
            source: FillSource::Polling,
            observed_at: Utc::now(),
        };

        let mut broker = MockBroker::new();
        let fetched = vec![known.clone(), dispatched.clone()];
        broker
            .expect_fetch_today_buy_executions()
            .times(1)
            .returning(move || Ok(fetched.clone()));
        // No submit expectation: both fills must be skipped.

        let mut f = fixture(broker);
        f.registry.insert(tracked("O1", 1, TradingMode::Smart));
        f.ledger.mark(autosell_core::DedupKey {
            order_id: OrderId::new("O2"),
            execution_id: ExecutionId::new("E1"),
        });

        f.supervisor.discovery_scan(TradingMode::Smart).await;

        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_does_not_resell_discovered_fill() {
        // Sold before the restart; still reported by today's executions.
        let sold = FillEvent {
            order_id: OrderId::new("O1"),
            execution_id: ExecutionId::new("E1"),
            ticker: "AAPL".to_string(),
            quantity: 5,
            price: dec!(10.00),
            source: FillSource::Polling,
            observed_at: Utc::now(),
        };

        let mut broker = MockBroker::new();
        let fetched = vec![sold.clone()];
        broker
            .expect_fetch_today_buy_executions()
            .times(1)
            .returning(move || Ok(fetched.clone()));
        // No submit expectation: a second sell would panic the mock.

        let mut f = fixture(broker);

        // First process dispatched the fill and snapshotted its ledger;
        // only the snapshot file survives the restart.
        let before_restart = DedupLedger::new();
        before_restart.mark(sold.dedup_key());
        let store = SnapshotStore::new(f._dir.path().join("state.json"));
        store.save(&OrderRegistry::new(), &before_restart).unwrap();

        let restored = store
            .load(Utc::now(), ChronoDuration::hours(1))
            .unwrap();
        f.ledger.restore(restored.dispatched);

        f.supervisor.discovery_scan(TradingMode::Smart).await;
        assert_eq!(f.ledger.len(), 1);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_rate_limited_discovery_penalizes() {
        let mut broker = MockBroker::new();
        broker
            .expect_fetch_today_buy_executions()
            .times(1)
            .returning(|| {
                Err(BrokerError::RateLimited {
                    code: "EGW00101".to_string(),
                })
            });

        let mut f = fixture(broker);
        f.supervisor.discovery_scan(TradingMode::Smart).await;

        // Cooldown armed: next scan is denied locally, no broker call.
        f.supervisor.discovery_scan(TradingMode::Smart).await;
    }
}
