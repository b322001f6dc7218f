//! Upstream Feed Connector
//!
//! Owns the single WebSocket connection to the quote source.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected → Connecting → Authenticating → Streaming
//!                    ↑                              │ close / error / silence
//!                    └──────── Reconnecting ◄───────┘
//!                                   │ budget spent
//!                                   ▼
//!                                 Failed
//! ```
//!
//! Credentials travel on the upgrade request, so `Authenticating` covers the
//! handshake and `Streaming` starts once the upgrade is accepted. Retries
//! use a fixed delay and a bounded attempt count that resets on every
//! successful connect. `Failed` is terminal; the process keeps running and
//! reports unhealthy.
//!
//! # Subscriptions
//!
//! The connector keeps no record of active keys. Control frames are only
//! accepted while streaming and are never queued across connections; the
//! registry resyncs the full desired set on each new streaming epoch.
//!
//! # Ticks
//!
//! Binary frames are decoded inline and handed to the single registered
//! tick consumer with `try_send`. A full consumer channel drops the tick
//! rather than stalling the read loop.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::{AuthError, FeedCredentials, rejection_status};
use super::codec::{Frame, TickDecoder};
use super::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState, PING, PONG,
};
use super::messages::{ControlAction, ControlFrame};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::state::{ConnectionState, FeedState};
use crate::application::ports::{FeedControl, FeedControlError};
use crate::domain::market::{FeedMode, SubscriptionKey, Tick};
use crate::infrastructure::metrics::{self, DropReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Control frames waiting for the writer.
const CONTROL_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the feed connector.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The handshake did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Upstream went silent.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// A tick consumer is already registered.
    #[error("tick consumer already registered")]
    TickConsumerAlreadyRegistered,
}

// =============================================================================
// Events
// =============================================================================

/// Lifecycle events emitted by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// Entered Streaming.
    Streaming {
        /// Streaming epoch, starting at 1.
        epoch: u64,
    },
    /// Connection lost.
    Disconnected,
    /// Waiting before a reconnection attempt.
    Reconnecting {
        /// Attempt number since the last streaming period.
        attempt: u32,
    },
    /// Retry budget exhausted.
    Failed,
}

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the feed connector.
#[derive(Debug, Clone)]
pub struct FeedConnectorConfig {
    /// WebSocket URL.
    pub url: String,
    /// Handshake credentials.
    pub credentials: FeedCredentials,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
    /// Upper bound on the WebSocket handshake.
    pub connect_timeout: Duration,
}

impl FeedConnectorConfig {
    /// Create a configuration with default timings.
    #[must_use]
    pub fn new(url: impl Into<String>, credentials: FeedCredentials) -> Self {
        Self {
            url: url.into(),
            credentials,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Single shared connection to the upstream quote source.
pub struct UpstreamFeedConnector {
    config: FeedConnectorConfig,
    decoder: TickDecoder,
    state: Arc<FeedState>,
    event_tx: mpsc::Sender<FeedEvent>,
    cancel: CancellationToken,
    control_tx: parking_lot::Mutex<Option<mpsc::Sender<(ControlAction, String)>>>,
    tick_tx: OnceLock<mpsc::Sender<Tick>>,
}

impl UpstreamFeedConnector {
    /// Create a new connector.
    #[must_use]
    pub fn new(
        config: FeedConnectorConfig,
        event_tx: mpsc::Sender<FeedEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            decoder: TickDecoder::new(),
            state: Arc::new(FeedState::new()),
            event_tx,
            cancel,
            control_tx: parking_lot::Mutex::new(None),
            tick_tx: OnceLock::new(),
        }
    }

    /// Shared connection state.
    #[must_use]
    pub fn state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Register the single downstream tick consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if a consumer is already registered.
    pub fn on_tick(&self, consumer: mpsc::Sender<Tick>) -> Result<(), FeedError> {
        self.tick_tx
            .set(consumer)
            .map_err(|_| FeedError::TickConsumerAlreadyRegistered)
    }

    /// Run the connection loop until cancelled or the retry budget is spent.
    ///
    /// # Errors
    ///
    /// Returns [`FeedError::MaxReconnectAttemptsExceeded`] after moving to
    /// `Failed`.
    pub async fn run(self: Arc<Self>) -> Result<(), FeedError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect);

        loop {
            if self.cancel.is_cancelled() {
                self.state.set_state(ConnectionState::Disconnected);
                tracing::info!("Feed connector cancelled");
                return Ok(());
            }

            match self.connect_and_run(&mut policy).await {
                Ok(()) => {
                    self.state.set_state(ConnectionState::Disconnected);
                    tracing::info!("Feed connection closed gracefully");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Feed connection error");
                    self.state.set_error(e.to_string());
                    let _ = self.event_tx.send(FeedEvent::Disconnected).await;

                    let Some(delay) = policy.next_delay() else {
                        let attempts = policy.max_attempts();
                        self.state.set_state(ConnectionState::Failed);
                        self.state
                            .set_error(format!("gave up after {attempts} reconnect attempts: {e}"));
                        tracing::error!(attempts, "Feed reconnect budget exhausted");
                        let _ = self.event_tx.send(FeedEvent::Failed).await;
                        return Err(FeedError::MaxReconnectAttemptsExceeded(attempts));
                    };

                    let attempt = policy.attempt_count();
                    self.state.set_state(ConnectionState::Reconnecting);
                    self.state.set_reconnect_attempts(attempt);
                    metrics::record_reconnect();
                    tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting to feed");
                    let _ = self.event_tx.send(FeedEvent::Reconnecting { attempt }).await;

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            self.state.set_state(ConnectionState::Disconnected);
                            tracing::info!("Feed connector cancelled during reconnect delay");
                            return Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Connect, stream until the connection ends, then tear down.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), FeedError> {
        self.state.set_state(ConnectionState::Connecting);
        tracing::info!(
            url = %self.config.url,
            client_code = self.config.credentials.client_code(),
            "Connecting to feed"
        );
        let request = self.config.credentials.handshake_request(&self.config.url)?;

        self.state.set_state(ConnectionState::Authenticating);
        let handshake = tokio_tungstenite::connect_async(request);
        let (ws_stream, _response) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| FeedError::ConnectTimeout(self.config.connect_timeout))?
            .map_err(|e| match rejection_status(&e) {
                Some(status) => FeedError::Auth(AuthError::Rejected(status)),
                None => FeedError::WebSocket(e),
            })?;

        let (write, read) = ws_stream.split();
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        // The sender must be visible before Streaming is.
        *self.control_tx.lock() = Some(control_tx);
        self.state.set_state(ConnectionState::Streaming);
        policy.reset();

        let epoch = self.state.streaming_epoch().unwrap_or_default();
        tracing::info!(epoch, "Feed streaming");
        let _ = self.event_tx.send(FeedEvent::Streaming { epoch }).await;

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(10);
        let heartbeat_cancel = CancellationToken::new();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat,
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel.clone(),
            )
            .run(),
        );

        let result = self
            .pump(write, read, control_rx, heartbeat_rx, &heartbeat_state)
            .await;

        heartbeat_cancel.cancel();
        *self.control_tx.lock() = None;
        result
    }

    /// Multiplex reads, control writes and heartbeats for one connection.
    async fn pump(
        &self,
        mut write: WsWrite,
        mut read: WsRead,
        mut control_rx: mpsc::Receiver<(ControlAction, String)>,
        mut heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
        heartbeat: &HeartbeatState,
    ) -> Result<(), FeedError> {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                event = heartbeat_rx.recv() => {
                    match event {
                        Some(HeartbeatEvent::SendPing) => {
                            write.send(Message::Text(PING.into())).await?;
                        }
                        Some(HeartbeatEvent::Timeout) => {
                            return Err(FeedError::HeartbeatTimeout);
                        }
                        None => {
                            tracing::debug!("Heartbeat channel closed");
                        }
                    }
                }
                Some((action, json)) = control_rx.recv() => {
                    write.send(Message::Text(json.into())).await?;
                    metrics::record_control_frame(action.as_str());
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat.record_activity();
                            self.handle_binary(&data);
                        }
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_activity();
                            self.handle_text(text.as_str());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) => {
                            heartbeat.record_activity();
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(?frame, "Upstream sent close frame");
                            return Err(FeedError::ConnectionClosed);
                        }
                        Some(Ok(Message::Frame(_))) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Upstream stream ended");
                            return Err(FeedError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    fn handle_binary(&self, data: &[u8]) {
        self.state.increment_frames();
        metrics::record_frame_received("binary");

        let Some(tick) = self.decoder.decode(data) else {
            return;
        };
        metrics::record_tick_decoded(tick.mode.as_str());

        let Some(consumer) = self.tick_tx.get() else {
            tracing::trace!(key = %tick.key, "No tick consumer registered");
            return;
        };

        match consumer.try_send(tick) {
            Ok(()) => {}
            Err(TrySendError::Full(tick)) => {
                tracing::debug!(key = %tick.key, "Tick channel full, dropping tick");
                metrics::record_ticks_dropped(DropReason::TickChannelFull, 1);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Tick consumer closed");
            }
        }
    }

    fn handle_text(&self, text: &str) {
        self.state.increment_frames();
        metrics::record_frame_received("text");

        if text.trim() == PONG {
            tracing::trace!("Heartbeat pong");
            return;
        }

        match self.decoder.classify(text.as_bytes()) {
            Ok(Frame::Control(message)) => {
                tracing::debug!(%message, "Upstream control message");
            }
            Ok(Frame::Tick(tick)) => {
                tracing::debug!(key = %tick.key, "Ignoring tick carried in a text frame");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unrecognised text frame");
            }
        }
    }

    async fn send_control(
        &self,
        action: ControlAction,
        keys: &[SubscriptionKey],
        mode: FeedMode,
    ) -> Result<(), FeedControlError> {
        if keys.is_empty() {
            return Ok(());
        }
        if self.state.streaming_epoch().is_none() {
            return Err(FeedControlError::NotStreaming);
        }
        let sender = self
            .control_tx
            .lock()
            .clone()
            .ok_or(FeedControlError::NotStreaming)?;

        let frame = ControlFrame::new(action, mode, keys);
        let json = frame
            .to_json()
            .map_err(|e| FeedControlError::Encode(e.to_string()))?;

        tracing::debug!(
            action = action.as_str(),
            mode = mode.as_str(),
            tokens = frame.token_count(),
            correlation_id = %frame.correlation_id,
            "Sending control frame"
        );

        sender
            .send((action, json))
            .await
            .map_err(|_| FeedControlError::ChannelClosed)
    }
}

#[async_trait]
impl FeedControl for UpstreamFeedConnector {
    fn streaming_epoch(&self) -> Option<u64> {
        self.state.streaming_epoch()
    }

    async fn subscribe(
        &self,
        keys: &[SubscriptionKey],
        mode: FeedMode,
    ) -> Result<(), FeedControlError> {
        self.send_control(ControlAction::Subscribe, keys, mode).await
    }

    async fn unsubscribe(
        &self,
        keys: &[SubscriptionKey],
        mode: FeedMode,
    ) -> Result<(), FeedControlError> {
        self.send_control(ControlAction::Unsubscribe, keys, mode).await
    }
}
