//! Polling fill detection.
//!
//! A supervisor loop that discovers new buy fills, tracks known orders
//! with adaptive per-order intervals, and expires stale records — all
//! gated by a local request-budget rate limiter.

pub mod detector;
pub mod interval;
pub mod rate_limiter;

pub use detector::{PollingConfig, PollingSupervisor};
pub use interval::{max_age_for, polling_interval, AgeStep, AggressiveConfig, SmartConfig};
pub use rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
