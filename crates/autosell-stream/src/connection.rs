//! WebSocket connection manager for the execution feed.
//!
//! Handles the connection lifecycle: subscription on connect, automatic
//! reconnection with exponential backoff and jitter, keepalive echo,
//! and per-message handoff to the execution handler. One message is
//! handled fully before the next is read, so fills for the same order
//! arrive at the handler in feed order.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async_tls_with_config, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use autosell_core::{FillEvent, TokenProvider};

use crate::error::{StreamError, StreamResult};
use crate::keepalive::KeepaliveMonitor;
use crate::parser::{ExecutionParser, StreamFrame, EXECUTION_TR_ID};

/// Receives buy-side fills, one at a time, in feed order.
///
/// Implementations own the downstream dispatch decision; the connection
/// only guarantees delivery order and never interprets the outcome.
#[async_trait]
pub trait ExecutionHandler: Send + Sync {
    async fn on_fill(&self, fill: FillEvent);
}

/// Streaming connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// Subscription key (account identifier). Filled in from the
    /// account credentials when not configured explicitly.
    #[serde(default)]
    pub account_key: String,
    /// Buy-side flag value in execution records. Config-verified
    /// against the live feed.
    #[serde(default = "default_buy_code")]
    pub buy_code: String,
    /// Maximum reconnection attempts (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Quiet time before a probe ping.
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Quiet time at which the connection is torn down.
    #[serde(default = "default_keepalive_timeout_ms")]
    pub keepalive_timeout_ms: u64,
}

fn default_url() -> String {
    "ws://ops.koreainvestment.com:21000".to_string()
}
fn default_buy_code() -> String {
    "02".to_string()
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    60000
}
fn default_keepalive_interval_ms() -> u64 {
    60000
}
fn default_keepalive_timeout_ms() -> u64 {
    180000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            account_key: String::new(),
            buy_code: default_buy_code(),
            max_reconnect_attempts: 0,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            keepalive_timeout_ms: default_keepalive_timeout_ms(),
        }
    }
}

/// Connection state, queryable by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Streaming fill detector.
pub struct StreamConnection {
    config: StreamConfig,
    parser: ExecutionParser,
    state: Arc<RwLock<StreamState>>,
    keepalive: KeepaliveMonitor,
    handler: Arc<dyn ExecutionHandler>,
    tokens: Arc<dyn TokenProvider>,
    reconnect_count: Arc<RwLock<u32>>,
    shutdown: CancellationToken,
}

impl StreamConnection {
    pub fn new(
        config: StreamConfig,
        tokens: Arc<dyn TokenProvider>,
        handler: Arc<dyn ExecutionHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let parser = ExecutionParser::new(config.buy_code.clone());
        let keepalive =
            KeepaliveMonitor::new(config.keepalive_interval_ms, config.keepalive_timeout_ms);
        Self {
            config,
            parser,
            state: Arc::new(RwLock::new(StreamState::Disconnected)),
            keepalive,
            handler,
            tokens,
            reconnect_count: Arc::new(RwLock::new(0)),
            shutdown,
        }
    }

    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Connected
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Connect and run until shutdown, reconnecting on failure.
    pub async fn run(&self) -> StreamResult<()> {
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                info!("Shutdown requested, exiting stream connect loop");
                *self.state.write() = StreamState::Disconnected;
                return Ok(());
            }

            *self.state.write() = StreamState::Connecting;

            match self.try_connect().await {
                Ok(()) => {
                    info!("Execution feed connection closed");
                }
                Err(e) => {
                    error!(error = %e, "Execution feed connection error");
                }
            }

            if self.is_shutdown() {
                *self.state.write() = StreamState::Disconnected;
                return Ok(());
            }

            attempt += 1;
            *self.reconnect_count.write() = attempt;

            if self.config.max_reconnect_attempts > 0
                && attempt >= self.config.max_reconnect_attempts
            {
                error!(attempt, "Max reconnection attempts reached");
                *self.state.write() = StreamState::Disconnected;
                return Err(StreamError::ConnectionFailed(
                    "Max reconnection attempts reached".to_string(),
                ));
            }

            *self.state.write() = StreamState::Reconnecting;

            let delay = self.backoff_delay(attempt);
            warn!(attempt, delay_ms = delay.as_millis(), "Reconnecting to execution feed");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown.cancelled() => {
                    *self.state.write() = StreamState::Disconnected;
                    return Ok(());
                }
            }
        }
    }

    async fn try_connect(&self) -> StreamResult<()> {
        info!(url = %self.config.url, "Connecting to execution feed");

        let (ws_stream, _response) =
            connect_async_tls_with_config(&self.config.url, None, true, None).await?;
        let (mut write, mut read) = ws_stream.split();

        let approval_key = self.tokens.approval_key().await?;
        let request = self.subscription_request(&approval_key);
        write.send(Message::Text(request)).await?;
        info!(account_key = %self.config.account_key, "Subscription request sent");

        *self.state.write() = StreamState::Connected;
        *self.reconnect_count.write() = 0;
        self.keepalive.reset();

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("Shutdown signal received in stream loop");
                    if let Err(e) = write.send(Message::Close(None)).await {
                        warn!(error = %e, "Failed to send Close frame during shutdown");
                    }
                    *self.state.write() = StreamState::Disconnected;
                    return Ok(());
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.keepalive.record_message();
                            match self.parser.parse(&text, Utc::now()) {
                                Ok(StreamFrame::Executions(fills)) => {
                                    for fill in fills {
                                        debug!(order_id = %fill.order_id, ticker = %fill.ticker, "Streaming fill");
                                        self.handler.on_fill(fill).await;
                                    }
                                }
                                Ok(StreamFrame::Keepalive) => {
                                    self.keepalive.record_keepalive();
                                    // Echo the keepalive back verbatim.
                                    write.send(Message::Text(text)).await?;
                                }
                                Ok(StreamFrame::Control { tr_id, message }) => {
                                    debug!(%tr_id, %message, "Control frame");
                                }
                                Err(e) => {
                                    warn!(error = %e, "Discarding malformed stream message");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            self.keepalive.record_message();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = frame
                                .map(|f| (f.code.into(), f.reason.to_string()))
                                .unwrap_or((1000, "Normal close".to_string()));
                            warn!(code, %reason, "Execution feed closed by server");
                            return Err(StreamError::ConnectionClosed { code, reason });
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Execution feed read error");
                            return Err(e.into());
                        }
                        None => {
                            warn!("Execution feed stream ended");
                            return Ok(());
                        }
                        _ => {}
                    }
                }

                _ = self.keepalive.wait_for_check() => {
                    if self.keepalive.is_dead() {
                        error!("Execution feed silent past timeout");
                        return Err(StreamError::HeartbeatTimeout);
                    }
                    if self.keepalive.should_probe() {
                        write.send(Message::Ping(Vec::new())).await?;
                        debug!("Sent probe ping");
                    }
                }
            }
        }
    }

    fn subscription_request(&self, approval_key: &str) -> String {
        serde_json::json!({
            "header": {
                "approval_key": approval_key,
                "custtype": "P",
                "tr_type": "1",
                "content-type": "utf-8"
            },
            "body": {
                "input": {
                    "tr_id": EXECUTION_TR_ID,
                    "tr_key": self.config.account_key
                }
            }
        })
        .to_string()
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.reconnect_base_delay_ms;
        let max = self.config.reconnect_max_delay_ms;

        // base * 2^(attempt-1), capped.
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = base.saturating_mul(1u64 << exponent).min(max);

        Duration::from_millis(delay + rand_jitter())
    }
}

/// Generate random jitter (0-1000ms).
fn rand_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as u64
}
