//! Consumer Gateway
//!
//! Downstream WebSocket endpoint at `/ws`. Each connection becomes one
//! consumer session with its own market store; every session receives the
//! global tick broadcast.
//!
//! # Requests
//!
//! `subscribe`, `subscribePositions`, `unsubscribe`, `getSubscriptions`,
//! `getSnapshot`
//!
//! # Events
//!
//! `marketData`, `positionUpdate`, `subscribed`, `unsubscribed`,
//! `subscriptions`, `snapshot`, `error`

pub mod protocol;
mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::application::ports::QuoteSource;
use crate::application::services::{MarketStoreConfig, SubscriptionRegistry};
use crate::infrastructure::broadcast::SharedBroadcaster;

pub use protocol::{ClientRequest, ServerEvent};

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),

    /// Consumer socket failed.
    #[error("consumer socket error: {0}")]
    Socket(String),

    /// Event could not be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Everything a consumer session needs.
pub struct GatewayState {
    registry: Arc<SubscriptionRegistry>,
    quotes: Arc<dyn QuoteSource>,
    broadcaster: SharedBroadcaster,
    store_config: MarketStoreConfig,
    cancel: CancellationToken,
    sessions: TaskTracker,
}

impl GatewayState {
    /// Create gateway state.
    #[must_use]
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        quotes: Arc<dyn QuoteSource>,
        broadcaster: SharedBroadcaster,
        store_config: MarketStoreConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            quotes,
            broadcaster,
            store_config,
            cancel,
            sessions: TaskTracker::new(),
        }
    }

    /// Wait until every open session has finished its teardown.
    pub async fn drain_sessions(&self) {
        self.sessions.close();
        self.sessions.wait().await;
    }
}

/// Downstream WebSocket server.
pub struct GatewayServer {
    port: u16,
    state: Arc<GatewayState>,
}

impl GatewayServer {
    /// Create a gateway server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<GatewayState>) -> Self {
        Self { port, state }
    }

    /// Routes served by the gateway.
    pub fn router(state: Arc<GatewayState>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state)
    }

    /// Run until the shared cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the server stops abnormally.
    pub async fn run(self) -> Result<(), GatewayError> {
        let cancel = self.state.cancel.clone();
        let app = Self::router(Arc::clone(&self.state));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Consumer gateway listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
            .map_err(|e| GatewayError::ServerFailed(e.to_string()))?;

        self.state.drain_sessions().await;
        tracing::info!("Consumer gateway stopped");
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> Response {
    let session = state.sessions.token();
    ws.on_upgrade(move |socket| async move {
        session::run(socket, state).await;
        drop(session);
    })
}
