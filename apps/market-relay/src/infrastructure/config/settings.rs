//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.
//! Malformed numeric values fall back to their defaults; missing
//! credentials are an error.

use std::time::Duration;

use crate::application::services::{EnricherConfig, MarketStoreConfig};
use crate::infrastructure::broadcast::BroadcastConfig;
use crate::infrastructure::feed::{
    AuthError, FeedConnectorConfig, FeedCredentials, HeartbeatConfig, ReconnectConfig,
};

/// Default upstream WebSocket endpoint.
pub const DEFAULT_FEED_URL: &str = "wss://smartapisocket.angelone.in/smart-stream";

/// Default base URL for the quote and instrument collaborators.
pub const DEFAULT_API_URL: &str = "http://localhost:3000/api";

/// Upstream feed connection settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// Upstream WebSocket URL.
    pub url: String,
    /// Handshake credentials.
    pub credentials: FeedCredentials,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence before the connection is considered dead.
    pub heartbeat_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Reconnection attempts before entering Failed.
    pub max_reconnect_attempts: u32,
    /// Connector to pipeline buffer.
    pub tick_channel_capacity: usize,
}

impl FeedSettings {
    /// Connector configuration for these settings.
    #[must_use]
    pub fn connector_config(&self) -> FeedConnectorConfig {
        let mut config = FeedConnectorConfig::new(self.url.clone(), self.credentials.clone());
        config.heartbeat = HeartbeatConfig::new(self.heartbeat_interval, self.heartbeat_timeout);
        config.reconnect =
            ReconnectConfig::fixed(self.reconnect_delay, self.max_reconnect_attempts);
        config
    }
}

/// Instrument enrichment settings.
#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    /// Instrument-master base URL.
    pub instrument_api_url: String,
    /// Bounded lookup timeout.
    pub lookup_timeout: Duration,
    /// Instrument lookups in flight at once.
    pub concurrency: usize,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            instrument_api_url: DEFAULT_API_URL.to_string(),
            lookup_timeout: Duration::from_millis(1500),
            concurrency: 64,
        }
    }
}

impl EnrichmentSettings {
    /// Enricher configuration for these settings.
    #[must_use]
    pub fn enricher_config(&self) -> EnricherConfig {
        EnricherConfig {
            lookup_timeout: self.lookup_timeout,
            max_in_flight: self.concurrency.max(1),
            ..EnricherConfig::default()
        }
    }
}

/// Per-consumer store settings.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Full-quote base URL.
    pub quote_api_url: String,
    /// Poll cadence.
    pub poll_interval: Duration,
    /// Broadcast channel capacity.
    pub broadcast_capacity: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            quote_api_url: DEFAULT_API_URL.to_string(),
            poll_interval: Duration::from_secs(2),
            broadcast_capacity: 10_000,
        }
    }
}

impl StoreSettings {
    /// Market store configuration for these settings.
    #[must_use]
    pub const fn store_config(&self) -> MarketStoreConfig {
        MarketStoreConfig {
            poll_interval: self.poll_interval,
        }
    }

    /// Broadcaster configuration for these settings.
    #[must_use]
    pub const fn broadcast_config(&self) -> BroadcastConfig {
        BroadcastConfig {
            capacity: self.broadcast_capacity,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Downstream consumer WebSocket port.
    pub gateway_port: u16,
    /// Health and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            gateway_port: 8090,
            health_port: 8082,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream feed settings.
    pub feed: FeedSettings,
    /// Enrichment settings.
    pub enrichment: EnrichmentSettings,
    /// Store and broadcast settings.
    pub store: StoreSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a credential is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a credential is missing or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let credentials = FeedCredentials::new(
            env.required("FEED_API_KEY")?,
            env.required("FEED_CLIENT_CODE")?,
            env.required("FEED_TOKEN")?,
            env.required("FEED_AUTH_TOKEN")?,
        )?;

        let heartbeat = HeartbeatConfig::default();
        let reconnect = ReconnectConfig::default();
        let feed = FeedSettings {
            url: env.string("FEED_URL", DEFAULT_FEED_URL),
            credentials,
            heartbeat_interval: env.secs("FEED_HEARTBEAT_INTERVAL_SECS", heartbeat.interval),
            heartbeat_timeout: env.secs("FEED_HEARTBEAT_TIMEOUT_SECS", heartbeat.timeout),
            reconnect_delay: env.millis("FEED_RECONNECT_DELAY_MS", reconnect.delay),
            max_reconnect_attempts: env.parse(
                "FEED_MAX_RECONNECT_ATTEMPTS",
                reconnect.max_attempts,
            ),
            tick_channel_capacity: env.parse("FEED_TICK_CHANNEL_CAPACITY", 8192),
        };

        let defaults = EnrichmentSettings::default();
        let enrichment = EnrichmentSettings {
            instrument_api_url: env.string("INSTRUMENT_API_URL", &defaults.instrument_api_url),
            lookup_timeout: env.millis("ENRICH_LOOKUP_TIMEOUT_MS", defaults.lookup_timeout),
            concurrency: env.parse("ENRICH_CONCURRENCY", defaults.concurrency),
        };

        let defaults = StoreSettings::default();
        let store = StoreSettings {
            quote_api_url: env.string("QUOTE_API_URL", &defaults.quote_api_url),
            poll_interval: env.millis("MARKET_POLL_INTERVAL_MS", defaults.poll_interval),
            broadcast_capacity: env.parse("RELAY_BROADCAST_CAPACITY", defaults.broadcast_capacity),
        };

        let defaults = ServerSettings::default();
        let server = ServerSettings {
            gateway_port: env.parse("RELAY_GATEWAY_PORT", defaults.gateway_port),
            health_port: env.parse("RELAY_HEALTH_PORT", defaults.health_port),
        };

        Ok(Self {
            feed,
            enrichment,
            store,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),

    /// Credentials rejected before use.
    #[error(transparent)]
    Credentials(#[from] AuthError),
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        let value = (self.0)(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))?;
        if value.trim().is_empty() {
            return Err(ConfigError::EmptyValue(key.to_string()));
        }
        Ok(value)
    }

    fn string(&self, key: &str, default: &str) -> String {
        (self.0)(key)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        (self.0)(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn secs(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        (self.0)(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}
