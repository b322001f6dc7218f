//! Heartbeat Manager
//!
//! Sends a text `ping` on a fixed interval while the connection is
//! streaming and watches for upstream silence. Any inbound frame counts as
//! a sign of life; the upstream answers pings with a text `pong`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Text frame sent as a heartbeat.
pub const PING: &str = "ping";

/// Text frame the upstream answers with.
pub const PONG: &str = "pong";

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub interval: Duration,
    /// Silence after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// Upstream has been silent for longer than the timeout.
    Timeout,
}

/// Last-seen tracking shared with the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    last_seen: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_seen: RwLock::new(Instant::now()),
        }
    }

    /// Record inbound traffic.
    pub fn record_activity(&self) {
        *self.last_seen.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.read().elapsed()
    }
}

/// Periodic ping and silence detection for one connection.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled, the event channel closes, or a timeout fires.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick completes immediately; the first ping goes out one interval in.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let silence = self.state.silence();
                    if silence > self.config.timeout {
                        tracing::warn!(
                            silence_secs = silence.as_secs(),
                            timeout_secs = self.config.timeout.as_secs(),
                            "Upstream heartbeat timeout"
                        );
                        let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
                        break;
                    }

                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }
}
