//! Feed Connection State
//!
//! Shared, lock-light view of the upstream connection read by the registry
//! (streaming epoch) and the health endpoint.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Upstream connection lifecycle.
///
/// `Failed` is terminal: once entered, no further transition is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected and not trying.
    #[default]
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open, handshake credentials being verified.
    Authenticating,
    /// Authenticated and delivering data.
    Streaming,
    /// Waiting out the delay before the next attempt.
    Reconnecting,
    /// Retry budget exhausted.
    Failed,
}

impl ConnectionState {
    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Streaming => "streaming",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Point-in-time copy of [`FeedState`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    /// Current state.
    pub state: ConnectionState,
    /// Number of streaming periods so far.
    pub epoch: u64,
    /// Attempts since the last streaming period.
    pub reconnect_attempts: u32,
    /// Frames received over the process lifetime.
    pub frames_received: u64,
    /// When Streaming was last entered.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last recorded error.
    pub error_message: Option<String>,
}

/// Tracks the state of the upstream connection.
#[derive(Debug, Default)]
pub struct FeedState {
    state: parking_lot::RwLock<ConnectionState>,
    epoch: AtomicU64,
    last_connected_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    error_message: parking_lot::RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    frames_received: AtomicU64,
}

impl FeedState {
    /// Create state in `Disconnected`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Move to a new state.
    ///
    /// Entering `Streaming` starts a new epoch and clears the error and
    /// attempt count. Returns `false` if the state is already `Failed`.
    pub fn set_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Failed {
            return false;
        }

        let previous = *state;
        *state = next;

        if next == ConnectionState::Streaming {
            self.epoch.fetch_add(1, Ordering::AcqRel);
            *self.last_connected_at.write() = Some(Utc::now());
            *self.error_message.write() = None;
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
        drop(state);

        if previous != next {
            tracing::info!(from = previous.as_str(), to = next.as_str(), "Feed state changed");
        }
        true
    }

    /// Record an error without changing state.
    pub fn set_error(&self, message: impl Into<String>) {
        *self.error_message.write() = Some(message.into());
    }

    /// Record a reconnection attempt number.
    pub fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    /// Increment the frames received counter.
    pub fn increment_frames(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Current state.
    #[must_use]
    pub fn get_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Epoch of the current streaming period, or `None` when not streaming.
    #[must_use]
    pub fn streaming_epoch(&self) -> Option<u64> {
        let state = self.state.read();
        (*state == ConnectionState::Streaming).then(|| self.epoch.load(Ordering::Acquire))
    }

    /// Whether the feed reached the terminal state.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.get_state() == ConnectionState::Failed
    }

    /// Copy of the current state.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.get_state(),
            epoch: self.epoch.load(Ordering::Acquire),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            last_connected_at: *self.last_connected_at.read(),
            error_message: self.error_message.read().clone(),
        }
    }
}
