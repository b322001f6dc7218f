//! Market Relay Binary
//!
//! Starts the market data relay.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `FEED_API_KEY`, `FEED_CLIENT_CODE`, `FEED_TOKEN`, `FEED_AUTH_TOKEN`: upstream credentials
//!
//! ## Optional
//! - `FEED_URL`: upstream WebSocket endpoint
//! - `FEED_HEARTBEAT_INTERVAL_SECS` / `FEED_HEARTBEAT_TIMEOUT_SECS` (default: 30 / 90)
//! - `FEED_RECONNECT_DELAY_MS` (default: 5000)
//! - `FEED_MAX_RECONNECT_ATTEMPTS` (default: 10)
//! - `FEED_TICK_CHANNEL_CAPACITY` (default: 8192)
//! - `QUOTE_API_URL` / `INSTRUMENT_API_URL` (default: <http://localhost:3000/api>)
//! - `ENRICH_LOOKUP_TIMEOUT_MS` (default: 1500)
//! - `ENRICH_CONCURRENCY` (default: 64)
//! - `MARKET_POLL_INTERVAL_MS` (default: 2000)
//! - `RELAY_BROADCAST_CAPACITY` (default: 10000)
//! - `RELAY_GATEWAY_PORT` / `RELAY_HEALTH_PORT` (default: 8090 / 8082)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use market_relay::application::services::{SubscriptionRegistry, TickEnricher, run_tick_pipeline};
use market_relay::infrastructure::broadcast::Broadcaster;
use market_relay::infrastructure::feed::{FeedEvent, UpstreamFeedConnector};
use market_relay::infrastructure::gateway::{GatewayServer, GatewayState};
use market_relay::infrastructure::health::{HealthServer, HealthServerState};
use market_relay::infrastructure::instruments::HttpInstrumentLookup;
use market_relay::infrastructure::quotes::{DEFAULT_QUOTE_TIMEOUT, HttpQuoteSource};
use market_relay::infrastructure::telemetry;
use market_relay::{RelayConfig, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard cap on one instrument-lookup HTTP request.
const LOOKUP_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Relay");

    let _metrics_handle = init_metrics();

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Upstream connector and its lifecycle events
    let (event_tx, event_rx) = mpsc::channel::<FeedEvent>(64);
    let connector = Arc::new(UpstreamFeedConnector::new(
        config.feed.connector_config(),
        event_tx,
        shutdown_token.clone(),
    ));
    let feed_state = connector.state();

    let (tick_tx, tick_rx) = mpsc::channel(config.feed.tick_channel_capacity.max(1));
    connector.on_tick(tick_tx)?;

    // Registry, enrichment and fan-out
    let registry = Arc::new(SubscriptionRegistry::new(connector.clone()));
    let instruments = Arc::new(HttpInstrumentLookup::new(
        &config.enrichment.instrument_api_url,
        LOOKUP_HTTP_TIMEOUT,
    )?);
    let enricher = Arc::new(TickEnricher::new(
        instruments,
        registry.clone(),
        config.enrichment.enricher_config(),
    ));
    let broadcaster = Arc::new(Broadcaster::new(config.store.broadcast_config()));
    let quotes = Arc::new(HttpQuoteSource::new(
        &config.store.quote_api_url,
        DEFAULT_QUOTE_TIMEOUT,
    )?);

    // Spawn lifecycle event handler
    let event_registry = Arc::clone(&registry);
    tokio::spawn(async move {
        handle_feed_events(event_rx, event_registry).await;
    });

    // Spawn tick pipeline
    let pipeline_broadcaster = Arc::clone(&broadcaster);
    let pipeline_cancel = shutdown_token.clone();
    let pipeline = tokio::spawn(async move {
        run_tick_pipeline(tick_rx, enricher, pipeline_broadcaster, pipeline_cancel).await;
    });

    // Spawn upstream connector
    let connector_task = Arc::clone(&connector);
    let upstream = tokio::spawn(async move {
        if let Err(e) = connector_task.run().await {
            tracing::error!(error = %e, "Feed connector stopped");
        }
    });

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        feed_state,
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Spawn consumer gateway
    let gateway_state = Arc::new(GatewayState::new(
        Arc::clone(&registry),
        quotes,
        Arc::clone(&broadcaster),
        config.store.store_config(),
        shutdown_token.clone(),
    ));
    let gateway = GatewayServer::new(config.server.gateway_port, gateway_state);
    let consumers = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            tracing::error!(error = %e, "Consumer gateway error");
        }
    });

    tracing::info!("Market relay ready");

    await_shutdown(shutdown_token).await;

    // Sessions tear down and the connector sends its close frame.
    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = tokio::join!(consumers, upstream, pipeline);
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Graceful shutdown timed out"
        );
    }

    tracing::info!("Market relay stopped");
    Ok(())
}

/// Resync the registry whenever the upstream enters a new streaming epoch.
async fn handle_feed_events(
    mut rx: mpsc::Receiver<FeedEvent>,
    registry: Arc<SubscriptionRegistry>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Streaming { epoch } => {
                let resynced = registry.on_reconnect().await;
                tracing::info!(epoch, resynced, "Upstream streaming");
            }
            FeedEvent::Disconnected => {
                tracing::warn!("Upstream disconnected");
            }
            FeedEvent::Reconnecting { attempt } => {
                tracing::info!(attempt, "Upstream reconnecting");
            }
            FeedEvent::Failed => {
                tracing::error!("Upstream failed permanently, relay is degraded");
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        feed_url = %config.feed.url,
        client_code = config.feed.credentials.client_code(),
        gateway_port = config.server.gateway_port,
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        quote_api_url = %config.store.quote_api_url,
        instrument_api_url = %config.enrichment.instrument_api_url,
        poll_interval_ms = config.store.poll_interval.as_millis(),
        max_reconnect_attempts = config.feed.max_reconnect_attempts,
        "Collaborator endpoints"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
