//! Connection liveness tracking.
//!
//! The brokerage feed drives keepalive with periodic text frames that
//! the client echoes back. This monitor tracks inbound activity so the
//! connection loop can send a probe ping on a quiet link and tear the
//! connection down when the link has gone fully silent.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::time::Duration;
use tracing::debug;

pub struct KeepaliveMonitor {
    /// Quiet time before a probe ping is sent.
    interval_ms: u64,
    /// Quiet time at which the connection is considered dead.
    timeout_ms: u64,
    last_message: RwLock<DateTime<Utc>>,
    last_keepalive: RwLock<Option<DateTime<Utc>>>,
}

impl KeepaliveMonitor {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            last_message: RwLock::new(Utc::now()),
            last_keepalive: RwLock::new(None),
        }
    }

    /// Reset on (re)connect.
    pub fn reset(&self) {
        *self.last_message.write() = Utc::now();
        *self.last_keepalive.write() = None;
    }

    pub fn record_message(&self) {
        *self.last_message.write() = Utc::now();
    }

    pub fn record_keepalive(&self) {
        let now = Utc::now();
        *self.last_keepalive.write() = Some(now);
        *self.last_message.write() = now;
        debug!(time = %now, "Recorded server keepalive");
    }

    pub fn time_since_last_message_ms(&self) -> i64 {
        (Utc::now() - *self.last_message.read()).num_milliseconds()
    }

    pub fn should_probe(&self) -> bool {
        self.time_since_last_message_ms() >= self.interval_ms as i64
    }

    pub fn is_dead(&self) -> bool {
        self.time_since_last_message_ms() >= self.timeout_ms as i64
    }

    /// Wait until the next liveness check.
    pub async fn wait_for_check(&self) {
        tokio::time::sleep(Duration::from_millis(self.interval_ms / 2)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_is_alive() {
        let m = KeepaliveMonitor::new(60_000, 180_000);
        assert!(!m.should_probe());
        assert!(!m.is_dead());
    }

    #[test]
    fn test_silence_triggers_probe_then_death() {
        let m = KeepaliveMonitor::new(60_000, 180_000);
        *m.last_message.write() = Utc::now() - chrono::Duration::seconds(90);
        assert!(m.should_probe());
        assert!(!m.is_dead());

        *m.last_message.write() = Utc::now() - chrono::Duration::seconds(200);
        assert!(m.is_dead());
    }

    #[test]
    fn test_keepalive_refreshes_activity() {
        let m = KeepaliveMonitor::new(60_000, 180_000);
        *m.last_message.write() = Utc::now() - chrono::Duration::seconds(90);
        m.record_keepalive();
        assert!(!m.should_probe());
        assert!(m.last_keepalive.read().is_some());
    }
}
