//! Gateway Wire Protocol
//!
//! Every message in both directions is a JSON envelope:
//!
//! ```json
//! {"event": "subscribe", "data": {"tokens": ["26000"], "mode": "ltp"}}
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::services::TokenSpec;
use crate::domain::market::{EnrichedTick, FeedMode, SubscriptionKey};
use crate::domain::snapshot::MarketSnapshot;

/// Default position update cadence.
pub const DEFAULT_POSITION_INTERVAL: Duration = Duration::from_millis(1000);

/// Fastest allowed position update cadence.
pub const MIN_POSITION_INTERVAL: Duration = Duration::from_millis(250);

/// Slowest allowed position update cadence.
pub const MAX_POSITION_INTERVAL: Duration = Duration::from_millis(60_000);

/// Most ticks sent in one `marketData` event.
pub const MAX_MARKET_DATA_BATCH: usize = 256;

// =============================================================================
// Requests
// =============================================================================

/// A consumer request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    /// Start receiving market data for tokens.
    Subscribe(SubscribeRequest),
    /// Track tokens as positions with periodic updates.
    SubscribePositions(PositionsRequest),
    /// Stop tracking tokens.
    Unsubscribe(UnsubscribeRequest),
    /// List this session's keys.
    GetSubscriptions,
    /// Return this session's snapshot.
    GetSnapshot,
}

impl ClientRequest {
    /// Event name of the request.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::SubscribePositions(_) => "subscribePositions",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::GetSubscriptions => "getSubscriptions",
            Self::GetSnapshot => "getSnapshot",
        }
    }
}

/// `subscribe` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscribeRequest {
    /// Tokens in any accepted shape.
    pub tokens: Vec<TokenSpec>,
    /// Mode name or code, LTP when absent.
    #[serde(default)]
    pub mode: Option<Value>,
}

impl SubscribeRequest {
    /// Requested mode.
    ///
    /// Accepts `"ltp"`/`"QUOTE"` style names or the numeric codes 1 to 3.
    #[must_use]
    pub fn feed_mode(&self) -> Option<FeedMode> {
        match &self.mode {
            None | Some(Value::Null) => Some(FeedMode::Ltp),
            Some(Value::String(name)) => FeedMode::from_str_case_insensitive(name),
            Some(Value::Number(code)) => code
                .as_u64()
                .and_then(|c| u8::try_from(c).ok())
                .and_then(FeedMode::from_code),
            Some(_) => None,
        }
    }
}

/// `subscribePositions` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsRequest {
    /// Position tokens.
    pub tokens: Vec<TokenSpec>,
    /// Broker the positions belong to; echoed back.
    #[serde(default)]
    pub broker_id: Option<String>,
    /// Update cadence in milliseconds.
    #[serde(default)]
    pub update_interval: Option<u64>,
}

impl PositionsRequest {
    /// Update cadence, clamped to the allowed range.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.update_interval
            .map_or(DEFAULT_POSITION_INTERVAL, Duration::from_millis)
            .clamp(MIN_POSITION_INTERVAL, MAX_POSITION_INTERVAL)
    }
}

/// `unsubscribe` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UnsubscribeRequest {
    /// Tokens to drop.
    pub tokens: Vec<TokenSpec>,
}

// =============================================================================
// Events
// =============================================================================

/// A server event, borrowing its payload.
#[derive(Debug, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent<'a> {
    /// Batch of enriched ticks.
    MarketData(Vec<&'a EnrichedTick>),
    /// Latest tick per tracked position.
    PositionUpdate {
        /// One entry per position key with data so far.
        positions: Vec<&'a EnrichedTick>,
    },
    /// Tokens now tracked.
    #[serde(rename_all = "camelCase")]
    Subscribed {
        /// Canonical keys.
        tokens: &'a [SubscriptionKey],
        /// Mode they were joined in.
        mode: FeedMode,
        /// Whether they are tracked as positions.
        positions: bool,
        /// Echoed broker id.
        #[serde(skip_serializing_if = "Option::is_none")]
        broker_id: Option<&'a str>,
        /// Effective position cadence in milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        update_interval: Option<u64>,
    },
    /// Tokens no longer tracked.
    Unsubscribed {
        /// Canonical keys.
        tokens: &'a [SubscriptionKey],
    },
    /// This session's keys.
    Subscriptions {
        /// Canonical keys.
        tokens: &'a [SubscriptionKey],
    },
    /// This session's snapshot.
    Snapshot(&'a MarketSnapshot),
    /// A request failed.
    Error {
        /// Request that failed, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        request: Option<&'a str>,
        /// Human-readable reason.
        message: String,
    },
}

impl ServerEvent<'_> {
    /// Encode as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload fails to serialize.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Tests
// =============================================================================
