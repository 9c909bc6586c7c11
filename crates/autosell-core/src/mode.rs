//! Time-of-day operating modes.
//!
//! The engine runs in one of four modes chosen purely from the wall clock
//! and a configured schedule of local-time windows. Classification is a
//! pure function of the timestamp, so every component that asks "what mode
//! is it?" at the same instant gets the same answer.

use chrono::{DateTime, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, Result};

/// Engine operating mode, in descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    /// WebSocket execution stream is the primary detection channel.
    Streaming,
    /// Fast fixed-interval polling around market open.
    Aggressive,
    /// Adaptive slow polling.
    Smart,
    /// Outside all configured windows; no detection runs.
    Off,
}

impl TradingMode {
    /// Active modes poll or stream; `Off` does neither.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Smart => write!(f, "smart"),
            Self::Off => write!(f, "off"),
        }
    }
}

/// Half-open local-time window `[start, end)`.
///
/// A window whose end precedes its start wraps past midnight, e.g.
/// `23:00`–`02:00` covers late evening and early morning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Ok(Self {
            start: parse_hhmm(start)?,
            end: parse_hhmm(end)?,
        })
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| CoreError::InvalidWindow(format!("{s}: {e}")))
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        super::parse_hhmm(&s).map_err(serde::de::Error::custom)
    }
}

/// Configured mode windows plus the fixed UTC offset of the local clock
/// the windows are expressed in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModeSchedule {
    /// Fixed offset from UTC in hours (KST is +9). No DST handling.
    #[serde(default = "default_utc_offset")]
    pub utc_offset_hours: i32,
    #[serde(default)]
    pub streaming: Vec<TimeWindow>,
    #[serde(default)]
    pub aggressive: Vec<TimeWindow>,
    #[serde(default)]
    pub smart: Vec<TimeWindow>,
}

fn default_utc_offset() -> i32 {
    9
}

impl Default for ModeSchedule {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset(),
            streaming: Vec::new(),
            aggressive: Vec::new(),
            smart: Vec::new(),
        }
    }
}

impl ModeSchedule {
    /// Project a UTC instant onto the schedule's local clock.
    pub fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        match FixedOffset::east_opt(self.utc_offset_hours.clamp(-23, 23) * 3600) {
            Some(offset) => now.with_timezone(&offset).time(),
            None => now.time(),
        }
    }

    fn windows_for(&self, mode: TradingMode) -> &[TimeWindow] {
        match mode {
            TradingMode::Streaming => &self.streaming,
            TradingMode::Aggressive => &self.aggressive,
            TradingMode::Smart => &self.smart,
            TradingMode::Off => &[],
        }
    }
}

/// Classify a UTC instant into a mode.
///
/// Overlapping windows resolve by priority: streaming, then aggressive,
/// then smart. Outside all windows the result is `Off`.
#[must_use]
pub fn mode_at(schedule: &ModeSchedule, now: DateTime<Utc>) -> TradingMode {
    let local = schedule.local_time(now);

    for mode in [
        TradingMode::Streaming,
        TradingMode::Aggressive,
        TradingMode::Smart,
    ] {
        if schedule.windows_for(mode).iter().any(|w| w.contains(local)) {
            return mode;
        }
    }

    TradingMode::Off
}

/// A detected mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    pub from: TradingMode,
    pub to: TradingMode,
    pub at: DateTime<Utc>,
}

/// Stateful wrapper over [`mode_at`] that surfaces transitions.
#[derive(Debug, Clone)]
pub struct ModeScheduler {
    schedule: ModeSchedule,
    last_mode: TradingMode,
}

impl ModeScheduler {
    pub fn new(schedule: ModeSchedule, now: DateTime<Utc>) -> Self {
        let last_mode = mode_at(&schedule, now);
        Self {
            schedule,
            last_mode,
        }
    }

    pub fn schedule(&self) -> &ModeSchedule {
        &self.schedule
    }

    pub fn current(&self, now: DateTime<Utc>) -> TradingMode {
        mode_at(&self.schedule, now)
    }

    pub fn last_mode(&self) -> TradingMode {
        self.last_mode
    }

    /// Re-classify `now`; returns the transition if the mode changed
    /// since the previous observation.
    pub fn observe(&mut self, now: DateTime<Utc>) -> Option<ModeTransition> {
        let mode = mode_at(&self.schedule, now);
        if mode == self.last_mode {
            return None;
        }

        let transition = ModeTransition {
            from: self.last_mode,
            to: mode,
            at: now,
        };
        if !mode.is_active() {
            warn!(from = %transition.from, "All detection windows closed");
        }
        self.last_mode = mode;
        Some(transition)
    }
}
