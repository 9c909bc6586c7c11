//! Per-order polling intervals.
//!
//! Aggressive mode checks every order at a fixed short interval. Smart
//! mode adapts: the base interval escalates with order age, backs off
//! exponentially while the broker keeps reporting the same status, and
//! optionally speeds back up after a streak of successful checks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use autosell_core::{OrderRecord, TradingMode};

/// One step of the age-based base-interval table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgeStep {
    /// Applies once the order is at least this old.
    pub after_minutes: i64,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggressiveConfig {
    #[serde(default = "default_aggressive_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_aggressive_max_age_minutes")]
    pub max_order_age_minutes: i64,
}

fn default_aggressive_interval_secs() -> u64 {
    10
}
fn default_aggressive_max_age_minutes() -> i64 {
    30
}

impl Default for AggressiveConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_aggressive_interval_secs(),
            max_order_age_minutes: default_aggressive_max_age_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartConfig {
    #[serde(default = "default_initial_interval_secs")]
    pub initial_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Backoff multiplier applied per unchanged check beyond the
    /// threshold.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Exponent cap for the no-change backoff.
    #[serde(default = "default_backoff_exponent_cap")]
    pub backoff_exponent_cap: u32,
    /// Unchanged checks tolerated before backoff kicks in.
    #[serde(default = "default_no_change_threshold")]
    pub no_change_threshold: u32,
    /// Age-based base intervals, ascending by age.
    #[serde(default = "default_age_steps")]
    pub age_steps: Vec<AgeStep>,
    #[serde(default = "default_speedup_enabled")]
    pub speedup_enabled: bool,
    /// Successful checks in a row before the speedup applies.
    #[serde(default = "default_speedup_threshold")]
    pub speedup_threshold: u32,
    #[serde(default = "default_speedup_factor")]
    pub speedup_factor: f64,
    #[serde(default = "default_min_interval_floor_secs")]
    pub min_interval_floor_secs: u64,
    #[serde(default = "default_smart_max_age_minutes")]
    pub max_order_age_minutes: i64,
}

fn default_initial_interval_secs() -> u64 {
    30
}
fn default_max_interval_secs() -> u64 {
    600
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_backoff_exponent_cap() -> u32 {
    4
}
fn default_no_change_threshold() -> u32 {
    3
}
fn default_age_steps() -> Vec<AgeStep> {
    vec![
        AgeStep {
            after_minutes: 5,
            interval_secs: 60,
        },
        AgeStep {
            after_minutes: 15,
            interval_secs: 120,
        },
        AgeStep {
            after_minutes: 30,
            interval_secs: 300,
        },
    ]
}
fn default_speedup_enabled() -> bool {
    true
}
fn default_speedup_threshold() -> u32 {
    3
}
fn default_speedup_factor() -> f64 {
    0.9
}
fn default_min_interval_floor_secs() -> u64 {
    5
}
fn default_smart_max_age_minutes() -> i64 {
    120
}

impl Default for SmartConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: default_initial_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_exponent_cap: default_backoff_exponent_cap(),
            no_change_threshold: default_no_change_threshold(),
            age_steps: default_age_steps(),
            speedup_enabled: default_speedup_enabled(),
            speedup_threshold: default_speedup_threshold(),
            speedup_factor: default_speedup_factor(),
            min_interval_floor_secs: default_min_interval_floor_secs(),
            max_order_age_minutes: default_smart_max_age_minutes(),
        }
    }
}

/// Interval before the next status check of `record` under `mode`.
#[must_use]
pub fn polling_interval(
    mode: TradingMode,
    record: &OrderRecord,
    now: DateTime<Utc>,
    aggressive: &AggressiveConfig,
    smart: &SmartConfig,
) -> Duration {
    match mode {
        TradingMode::Aggressive => Duration::seconds(aggressive.interval_secs as i64),
        TradingMode::Smart => smart_interval(record, now, smart),
        // No polling happens in these modes; park the order.
        TradingMode::Streaming | TradingMode::Off => Duration::seconds(3600),
    }
}

fn smart_interval(record: &OrderRecord, now: DateTime<Utc>, cfg: &SmartConfig) -> Duration {
    let age_minutes = record.age(now).num_minutes();

    let mut base = cfg.initial_interval_secs;
    for step in &cfg.age_steps {
        if age_minutes >= step.after_minutes {
            base = step.interval_secs;
        }
    }

    let mut secs = base as f64;

    if record.no_change_count > cfg.no_change_threshold {
        let excess = record.no_change_count - cfg.no_change_threshold;
        let exponent = excess.min(cfg.backoff_exponent_cap);
        secs = (secs * cfg.backoff_multiplier.powi(exponent as i32))
            .min(cfg.max_interval_secs as f64);
    }

    if cfg.speedup_enabled && record.consecutive_successes > cfg.speedup_threshold {
        secs = (secs * cfg.speedup_factor).max(cfg.min_interval_floor_secs as f64);
    }

    Duration::seconds(secs.round() as i64)
}

/// Maximum tracked-order age under `mode`; older records are expired.
#[must_use]
pub fn max_age_for(
    mode: TradingMode,
    aggressive: &AggressiveConfig,
    smart: &SmartConfig,
) -> Duration {
    match mode {
        TradingMode::Aggressive => Duration::minutes(aggressive.max_order_age_minutes),
        _ => Duration::minutes(smart.max_order_age_minutes),
    }
}
