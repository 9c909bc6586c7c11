//! Order and fill types.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::dedup::DedupKey;
use crate::mode::TradingMode;

/// Brokerage order number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Brokerage execution (fill) number. A single order may produce several.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which detection channel observed a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillSource {
    Streaming,
    Polling,
}

impl std::fmt::Display for FillSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Polling => write!(f, "polling"),
        }
    }
}

/// A detected buy-side fill, normalized across detection channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillEvent {
    pub order_id: OrderId,
    pub execution_id: ExecutionId,
    pub ticker: String,
    pub quantity: u32,
    pub price: Decimal,
    pub source: FillSource,
    pub observed_at: DateTime<Utc>,
}

impl FillEvent {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            order_id: self.order_id.clone(),
            execution_id: self.execution_id.clone(),
        }
    }
}

/// A buy order being tracked for fill detection.
///
/// Carries the adaptive-polling counters that drive per-order check
/// intervals: no-change streak, consecutive successes, and consecutive
/// failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: OrderId,
    pub ticker: String,
    pub quantity: u32,
    pub buy_price: Decimal,
    /// Mode active when the order was registered; determines expiry.
    pub registered_mode: TradingMode,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub check_count: u32,
    pub consecutive_failures: u32,
    pub no_change_count: u32,
    pub consecutive_successes: u32,
    pub last_status: Option<String>,
}

impl OrderRecord {
    pub fn new(
        order_id: OrderId,
        ticker: impl Into<String>,
        quantity: u32,
        buy_price: Decimal,
        registered_mode: TradingMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            order_id,
            ticker: ticker.into(),
            quantity,
            buy_price,
            registered_mode,
            created_at: now,
            last_checked_at: None,
            check_count: 0,
            consecutive_failures: 0,
            no_change_count: 0,
            consecutive_successes: 0,
            last_status: None,
        }
    }

    /// Build a tracking record from a fill whose sell dispatch failed,
    /// so the polling channel can retry it later.
    pub fn from_fill(fill: &FillEvent, mode: TradingMode) -> Self {
        Self::new(
            fill.order_id.clone(),
            fill.ticker.clone(),
            fill.quantity,
            fill.price,
            mode,
            fill.observed_at,
        )
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }

    /// Whether enough time has passed since the last check.
    pub fn due_for_check(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        match self.last_checked_at {
            None => true,
            Some(last) => now - last >= interval,
        }
    }

    /// Record a failed or inconclusive status check.
    pub fn record_check_failure(&mut self, now: DateTime<Utc>) {
        self.last_checked_at = Some(now);
        self.check_count += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }

    /// Record a successful status check. Returns true if the reported
    /// status differs from the previous one.
    pub fn record_status(&mut self, status: &str, now: DateTime<Utc>) -> bool {
        self.last_checked_at = Some(now);
        self.check_count += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;

        let changed = self.last_status.as_deref() != Some(status);
        if changed {
            self.no_change_count = 0;
            self.last_status = Some(status.to_string());
        } else {
            self.no_change_count += 1;
        }
        changed
    }
}
