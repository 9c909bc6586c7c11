//! Request-budget rate limiter for the polling channel.
//!
//! Enforces minimum inter-request spacing, a consecutive-burst cap with
//! cooldown, daily and hourly hard ceilings, and per-mode call budgets.
//! A denied request is always "skip this cycle", never fatal. All state
//! is mutated only by the polling context; the `*_at` methods take the
//! clock as an argument so every ceiling is testable without sleeping.

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use autosell_core::TradingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Minimum spacing between any two requests.
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Requests allowed back-to-back before a forced cooldown.
    #[serde(default = "default_consecutive_limit")]
    pub consecutive_limit: u32,
    /// Cooldown applied on burst-cap breach or broker throttling.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: u32,
    /// Per-day budget for aggressive-mode calls.
    #[serde(default = "default_aggressive_mode_limit")]
    pub aggressive_mode_limit: u32,
    /// Per-day budget for smart-mode calls.
    #[serde(default = "default_smart_mode_limit")]
    pub smart_mode_limit: u32,
}

fn default_min_interval_secs() -> u64 {
    2
}
fn default_consecutive_limit() -> u32 {
    10
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_daily_limit() -> u32 {
    1000
}
fn default_hourly_limit() -> u32 {
    200
}
fn default_aggressive_mode_limit() -> u32 {
    400
}
fn default_smart_mode_limit() -> u32 {
    600
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            consecutive_limit: default_consecutive_limit(),
            cooldown_secs: default_cooldown_secs(),
            daily_limit: default_daily_limit(),
            hourly_limit: default_hourly_limit(),
            aggressive_mode_limit: default_aggressive_mode_limit(),
            smart_mode_limit: default_smart_mode_limit(),
        }
    }
}

#[derive(Debug)]
struct Counters {
    last_request_at: Option<DateTime<Utc>>,
    consecutive: u32,
    daily: u32,
    hourly: u32,
    aggressive_calls: u32,
    smart_calls: u32,
    day: NaiveDate,
    hour: u32,
    cooldown_until: Option<DateTime<Utc>>,
    violations: u32,
}

impl Counters {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_request_at: None,
            consecutive: 0,
            daily: 0,
            hourly: 0,
            aggressive_calls: 0,
            smart_calls: 0,
            day: now.date_naive(),
            hour: now.hour(),
            cooldown_until: None,
            violations: 0,
        }
    }

    /// Reset counters exactly at date / hour rollover.
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        let day_changed = day != self.day;
        if day_changed {
            debug!(new_day = %day, "Daily rate counters reset");
            self.day = day;
            self.daily = 0;
            self.aggressive_calls = 0;
            self.smart_calls = 0;
        }
        let hour = now.hour();
        if day_changed || hour != self.hour {
            self.hour = hour;
            self.hourly = 0;
            // The burst counter resets with the hour as well.
            self.consecutive = 0;
        }
    }
}

/// Snapshot of current budget usage, for periodic stats logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    pub daily: u32,
    pub hourly: u32,
    pub consecutive: u32,
    pub aggressive_calls: u32,
    pub smart_calls: u32,
    pub violations: u32,
    pub in_cooldown: bool,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Mutex<Counters>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let counters = Mutex::new(Counters::new(Utc::now()));
        Self { config, counters }
    }

    /// Whether a polling request may go out right now. Denial has no
    /// side effect beyond a log line; callers skip the cycle.
    pub fn can_request(&self, mode: TradingMode) -> bool {
        self.can_request_at(mode, Utc::now())
    }

    pub fn can_request_at(&self, mode: TradingMode, now: DateTime<Utc>) -> bool {
        // No polling budget exists outside the polling modes.
        if !matches!(mode, TradingMode::Aggressive | TradingMode::Smart) {
            debug!(%mode, "Polling requests denied in this mode");
            return false;
        }

        let mut c = self.counters.lock();
        c.roll_over(now);

        if let Some(until) = c.cooldown_until {
            if now < until {
                debug!(until = %until, "In cooldown, request denied");
                return false;
            }
            c.cooldown_until = None;
        }

        if let Some(last) = c.last_request_at {
            if now - last < Duration::seconds(self.config.min_interval_secs as i64) {
                debug!("Minimum request spacing not yet elapsed");
                return false;
            }
        }

        if c.consecutive >= self.config.consecutive_limit {
            let until = now + Duration::seconds(self.config.cooldown_secs as i64);
            warn!(
                consecutive = c.consecutive,
                cooldown_secs = self.config.cooldown_secs,
                "Burst cap reached, entering cooldown"
            );
            c.cooldown_until = Some(until);
            c.consecutive = 0;
            return false;
        }

        if c.daily >= self.config.daily_limit {
            warn!(daily = c.daily, "Daily request ceiling reached");
            return false;
        }
        if c.hourly >= self.config.hourly_limit {
            warn!(hourly = c.hourly, "Hourly request ceiling reached");
            return false;
        }

        let (mode_calls, mode_limit) = match mode {
            TradingMode::Aggressive => (c.aggressive_calls, self.config.aggressive_mode_limit),
            _ => (c.smart_calls, self.config.smart_mode_limit),
        };
        if mode_calls >= mode_limit {
            warn!(%mode, mode_calls, "Per-mode call ceiling reached");
            return false;
        }

        true
    }

    /// Record a request that was actually sent.
    pub fn record_request(&self, mode: TradingMode) {
        self.record_request_at(mode, Utc::now());
    }

    pub fn record_request_at(&self, mode: TradingMode, now: DateTime<Utc>) {
        let mut c = self.counters.lock();
        c.roll_over(now);
        c.last_request_at = Some(now);
        c.consecutive += 1;
        c.daily += 1;
        c.hourly += 1;
        match mode {
            TradingMode::Aggressive => c.aggressive_calls += 1,
            TradingMode::Smart => c.smart_calls += 1,
            _ => {}
        }
    }

    /// Broker-signaled throttling: force a cooldown and count the
    /// violation.
    pub fn penalize(&self) {
        self.penalize_at(Utc::now());
    }

    pub fn penalize_at(&self, now: DateTime<Utc>) {
        let mut c = self.counters.lock();
        c.cooldown_until = Some(now + Duration::seconds(self.config.cooldown_secs as i64));
        c.consecutive = 0;
        c.violations += 1;
        warn!(
            violations = c.violations,
            cooldown_secs = self.config.cooldown_secs,
            "Broker throttled us, entering cooldown"
        );
    }

    pub fn stats(&self) -> RateLimitStats {
        let c = self.counters.lock();
        RateLimitStats {
            daily: c.daily,
            hourly: c.hourly,
            consecutive: c.consecutive,
            aggressive_calls: c.aggressive_calls,
            smart_calls: c.smart_calls,
            violations: c.violations,
            in_cooldown: c.cooldown_until.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(day: u32, hour: u32, min: u32, sec: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, min, sec).unwrap()
    }

    fn limiter(config: RateLimitConfig) -> RateLimiter {
        let l = RateLimiter::new(config);
        // Pin the counters to a known clock.
        *l.counters.lock() = Counters::new(utc(2, 10, 0, 0));
        l
    }

    fn permissive() -> RateLimitConfig {
        RateLimitConfig {
            min_interval_secs: 0,
            consecutive_limit: 1000,
            cooldown_secs: 30,
            daily_limit: 10_000,
            hourly_limit: 10_000,
            aggressive_mode_limit: 10_000,
            smart_mode_limit: 10_000,
        }
    }

    #[test]
    fn test_streaming_and_off_are_denied() {
        let l = limiter(permissive());
        assert!(!l.can_request_at(TradingMode::Streaming, utc(2, 10, 0, 0)));
        assert!(!l.can_request_at(TradingMode::Off, utc(2, 10, 0, 0)));
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 0)));
    }

    #[test]
    fn test_min_spacing() {
        let l = limiter(RateLimitConfig {
            min_interval_secs: 2,
            ..permissive()
        });
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 0)));
        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 0));
        assert!(!l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 1)));
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 2)));
    }

    #[test]
    fn test_burst_cap_then_cooldown() {
        let l = limiter(RateLimitConfig {
            consecutive_limit: 3,
            cooldown_secs: 30,
            min_interval_secs: 0,
            ..permissive()
        });

        for i in 0..3 {
            let now = utc(2, 10, 0, i);
            assert!(l.can_request_at(TradingMode::Aggressive, now));
            l.record_request_at(TradingMode::Aggressive, now);
        }

        // Cap reached: denied, cooldown armed.
        assert!(!l.can_request_at(TradingMode::Aggressive, utc(2, 10, 0, 3)));
        // Still inside cooldown.
        assert!(!l.can_request_at(TradingMode::Aggressive, utc(2, 10, 0, 20)));
        // Cooldown elapsed.
        assert!(l.can_request_at(TradingMode::Aggressive, utc(2, 10, 0, 33)));
    }

    #[test]
    fn test_daily_ceiling_resets_at_midnight() {
        let l = limiter(RateLimitConfig {
            daily_limit: 2,
            min_interval_secs: 0,
            ..permissive()
        });

        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 0));
        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 5));
        assert!(!l.can_request_at(TradingMode::Smart, utc(2, 23, 59, 59)));
        // Next day: fresh budget.
        assert!(l.can_request_at(TradingMode::Smart, utc(3, 0, 0, 0)));
    }

    #[test]
    fn test_hourly_ceiling_resets_on_the_hour() {
        let l = limiter(RateLimitConfig {
            hourly_limit: 1,
            min_interval_secs: 0,
            ..permissive()
        });

        l.record_request_at(TradingMode::Smart, utc(2, 10, 30, 0));
        assert!(!l.can_request_at(TradingMode::Smart, utc(2, 10, 59, 0)));
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 11, 0, 0)));
    }

    #[test]
    fn test_hour_rollover_resets_burst_counter() {
        let l = limiter(RateLimitConfig {
            consecutive_limit: 3,
            min_interval_secs: 0,
            ..permissive()
        });

        for i in 0..3 {
            l.record_request_at(TradingMode::Smart, utc(2, 10, 0, i));
        }

        // Next hour: fresh burst budget, no spurious cooldown.
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 11, 0, 0)));
        assert_eq!(l.stats().consecutive, 0);
        assert!(!l.stats().in_cooldown);
    }

    #[test]
    fn test_stats_expose_per_mode_calls() {
        let l = limiter(permissive());
        l.record_request_at(TradingMode::Aggressive, utc(2, 10, 0, 0));
        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 5));
        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 10));

        let stats = l.stats();
        assert_eq!(stats.aggressive_calls, 1);
        assert_eq!(stats.smart_calls, 2);
        assert_eq!(stats.daily, 3);
    }

    #[test]
    fn test_per_mode_budgets_are_independent() {
        let l = limiter(RateLimitConfig {
            aggressive_mode_limit: 1,
            smart_mode_limit: 2,
            min_interval_secs: 0,
            ..permissive()
        });

        l.record_request_at(TradingMode::Aggressive, utc(2, 10, 0, 0));
        assert!(!l.can_request_at(TradingMode::Aggressive, utc(2, 10, 0, 10)));
        // Smart budget is untouched by aggressive spending.
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 10)));
    }

    #[test]
    fn test_penalize_forces_cooldown_and_counts() {
        let l = limiter(permissive());
        l.penalize_at(utc(2, 10, 0, 0));
        assert!(!l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 10)));
        assert!(l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 31)));
        assert_eq!(l.stats().violations, 1);
    }

    #[test]
    fn test_denial_has_no_side_effects_on_counters() {
        let l = limiter(RateLimitConfig {
            daily_limit: 1,
            min_interval_secs: 0,
            ..permissive()
        });
        l.record_request_at(TradingMode::Smart, utc(2, 10, 0, 0));
        let before = l.stats();
        assert!(!l.can_request_at(TradingMode::Smart, utc(2, 10, 0, 5)));
        assert_eq!(l.stats(), before);
    }
}
