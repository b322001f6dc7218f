#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Relay - Real-time Market Data Multiplexer
//!
//! Maintains one WebSocket connection to the upstream quote feed,
//! reference-counts downstream consumers' interest over it, decodes binary
//! ticks, enriches them with instrument identity and fans them out to every
//! connected consumer. Each consumer keeps a snapshot reconciled from the
//! push stream and a periodic full-quote poll.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: keys, ticks, desired-set bookkeeping, snapshot merge
//! - **Application**: ports plus the registry, enricher, market store and
//!   tick pipeline services
//! - **Infrastructure**: upstream feed, broadcaster, consumer gateway, HTTP
//!   collaborators, configuration, health, metrics, telemetry
//!
//! # Data Flow
//!
//! ```text
//!                    subscribe/unsubscribe (refcounted)
//!        ┌──────────────────────────────────────────────┐
//!        ▼                                              │
//! Upstream WS ──► TickDecoder ──► TickEnricher ──► Broadcaster ──► Session 1 (store)
//!                                                       │      ──► Session 2 (store)
//!                                                       └────► ──► Session N (store)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market::{
    EnrichedTick, ExchangeType, FeedMode, SubscriptionKey, SymbolRecord, Tick,
};
pub use domain::snapshot::{MarketSnapshot, QuoteFields, SnapshotEntry, SnapshotUpdate};
pub use domain::subscription::{DesiredSet, KeyRequest, SessionId, SubscriptionChanges};

// Application ports and services
pub use application::ports::{
    AliasResolver, FeedControl, FeedControlError, FullQuote, InstrumentLookup, LookupError,
    QuoteError, QuoteSource,
};
pub use application::services::{
    ClientMarketStore, EnricherConfig, MarketStoreConfig, RegistryStats, StoreError,
    SubscriptionRegistry, TickEnricher, TokenId, TokenSpec, run_tick_pipeline,
};

// Upstream feed
pub use infrastructure::feed::{
    ConnectionState, FeedConnectorConfig, FeedCredentials, FeedError, FeedEvent, FeedState,
    TickDecoder, UpstreamFeedConnector,
};

// Fan-out and gateway
pub use infrastructure::broadcast::{BroadcastConfig, Broadcaster, SharedBroadcaster};
pub use infrastructure::gateway::{GatewayError, GatewayServer, GatewayState};

// Collaborators
pub use infrastructure::instruments::HttpInstrumentLookup;
pub use infrastructure::quotes::HttpQuoteSource;

// Configuration and health
pub use infrastructure::config::{ConfigError, RelayConfig};
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
