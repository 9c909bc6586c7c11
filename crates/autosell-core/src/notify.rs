//! Operator notification boundary.

use async_trait::async_trait;
use tracing::info;

/// Outbound operator notifications (sell submitted, dispatch failed,
/// mode changed, rate limit hit). Failures to deliver must never affect
/// the trading path, so the method is infallible.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Default notifier: writes notifications to the structured log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, text: &str) {
        info!(message = text, "Operator notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Test double that records every notification.
    pub struct RecordingNotifier {
        pub messages: Mutex<Vec<String>>,
    }

    impl RecordingNotifier {
        pub fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, text: &str) {
            self.messages.lock().push(text.to_string());
        }
    }

    #[tokio::test]
    async fn test_recording_notifier_captures() {
        let n = RecordingNotifier::new();
        n.notify("sell submitted").await;
        assert_eq!(n.messages.lock().as_slice(), ["sell submitted"]);
    }
}
