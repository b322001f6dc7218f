//! Port Interfaces
//!
//! Defines the interfaces (ports) between the application services and
//! the outside world, following the Hexagonal Architecture pattern. These
//! are the contracts that infrastructure adapters implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `FeedControl`: subscribe/unsubscribe on the single upstream connection
//! - `InstrumentLookup`: instrument-master lookup by token and exchange
//! - `QuoteSource`: full-quote query used for snapshot reconciliation
//!
//! ## Internal Ports
//!
//! - `AliasResolver`: client-declared display names, owned by the registry

use async_trait::async_trait;

use crate::domain::market::{ExchangeType, FeedMode, SubscriptionKey, SymbolRecord};
use crate::domain::snapshot::QuoteFields;

// =============================================================================
// Feed Control
// =============================================================================

/// Errors from upstream subscription control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedControlError {
    /// The connector is not in the Streaming state.
    #[error("upstream feed is not streaming")]
    NotStreaming,

    /// The connection task went away before the frame was sent.
    #[error("upstream control channel closed")]
    ChannelClosed,

    /// The control frame could not be encoded.
    #[error("failed to encode control frame: {0}")]
    Encode(String),
}

/// Subscription control over the single upstream connection.
///
/// Calls succeed only while the connection is streaming. Nothing is
/// queued: a failed call must be recovered by a resync on the next
/// streaming epoch.
#[async_trait]
pub trait FeedControl: Send + Sync {
    /// Current streaming epoch, or `None` when not streaming.
    ///
    /// The epoch increases by one each time the connection enters the
    /// Streaming state.
    fn streaming_epoch(&self) -> Option<u64>;

    /// Subscribe keys upstream in one mode.
    async fn subscribe(&self, keys: &[SubscriptionKey], mode: FeedMode)
    -> Result<(), FeedControlError>;

    /// Unsubscribe keys upstream in one mode.
    async fn unsubscribe(
        &self,
        keys: &[SubscriptionKey],
        mode: FeedMode,
    ) -> Result<(), FeedControlError>;
}

// =============================================================================
// Instrument Lookup
// =============================================================================

/// Errors from the instrument-master collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    /// Transport failure.
    #[error("instrument lookup request failed: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("instrument lookup returned status {0}")]
    Status(u16),

    /// Response body could not be parsed.
    #[error("invalid instrument lookup response: {0}")]
    InvalidResponse(String),
}

/// Instrument-master lookup by (token, exchange).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InstrumentLookup: Send + Sync {
    /// Find the instrument for a token, or `None` when unknown.
    async fn symbol_by_token(
        &self,
        token: &str,
        exchange: ExchangeType,
    ) -> Result<Option<SymbolRecord>, LookupError>;
}

// =============================================================================
// Quote Source
// =============================================================================

/// One row of a full-quote response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullQuote {
    /// Instrument the row describes.
    pub key: SubscriptionKey,
    /// Symbol reported by the source, if any.
    pub symbol: Option<String>,
    /// Field values; absent fields are `None`.
    pub fields: QuoteFields,
}

/// Errors from the full-quote query.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// Transport failure.
    #[error("quote request failed: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("quote request returned status {0}")]
    Status(u16),

    /// Response reported `success: false`.
    #[error("quote source reported failure")]
    Unsuccessful,

    /// Response body could not be parsed.
    #[error("invalid quote response: {0}")]
    InvalidResponse(String),
}

/// Full-quote query over a set of keys.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Fetch the current full quote for each key.
    async fn full_quotes(&self, keys: &[SubscriptionKey]) -> Result<Vec<FullQuote>, QuoteError>;
}

// =============================================================================
// Alias Resolver
// =============================================================================

/// Client-declared display names for keys.
pub trait AliasResolver: Send + Sync {
    /// Alias declared for a key by a session currently wanting it.
    fn alias_for(&self, key: &SubscriptionKey) -> Option<String>;
}
