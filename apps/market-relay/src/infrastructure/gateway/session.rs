//! Consumer Session
//!
//! One downstream WebSocket connection. The session owns its
//! [`ClientMarketStore`] and a broadcast receiver, and runs a single loop
//! over consumer requests, broadcast ticks and the position timer. Closing
//! the socket tears the store down, which releases the session's interest
//! in the registry.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{Interval, MissedTickBehavior};

use super::GatewayError;
use super::GatewayState;
use super::protocol::{
    ClientRequest, MAX_MARKET_DATA_BATCH, PositionsRequest, ServerEvent, SubscribeRequest,
    UnsubscribeRequest,
};
use crate::application::services::ClientMarketStore;
use crate::domain::market::{FeedMode, SubscriptionKey};
use crate::domain::subscription::SessionId;
use crate::infrastructure::broadcast::SharedTick;

type Sink = SplitSink<WebSocket, Message>;

// =============================================================================
// Position Tracking
// =============================================================================

#[derive(Default)]
struct Positions {
    keys: HashSet<SubscriptionKey>,
    latest: BTreeMap<SubscriptionKey, SharedTick>,
    timer: Option<Interval>,
}

impl Positions {
    fn track(&mut self, keys: &[SubscriptionKey], request: &PositionsRequest) {
        self.keys.extend(keys.iter().cloned());

        let period = request.interval();
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);
    }

    fn forget(&mut self, keys: &[SubscriptionKey]) {
        for key in keys {
            self.keys.remove(key);
            self.latest.remove(key);
        }
        if self.keys.is_empty() {
            self.timer = None;
        }
    }

    fn observe(&mut self, tick: &SharedTick) {
        if self.keys.contains(tick.key()) {
            self.latest.insert(tick.key().clone(), Arc::clone(tick));
        }
    }

    async fn next_update(&mut self) {
        match self.timer.as_mut() {
            Some(timer) => {
                timer.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Serve one consumer connection until it closes or the relay shuts down.
pub async fn run(socket: WebSocket, state: Arc<GatewayState>) {
    let session = state.registry.open_session().await;
    let store = ClientMarketStore::new(
        session,
        Arc::clone(&state.registry),
        Arc::clone(&state.quotes),
        state.store_config,
    );
    let mut ticks = state.broadcaster.subscribe();
    let (mut sink, mut stream) = socket.split();
    let mut positions = Positions::default();

    tracing::info!(session, "Consumer connected");

    let outcome: Result<(), GatewayError> = loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }

            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle_text(&text, session, &store, &state, &mut positions, &mut sink).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    let event = ServerEvent::Error {
                        request: None,
                        message: "binary frames are not supported".to_string(),
                    };
                    if let Err(e) = send(&mut sink, &event).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Err(e)) => break Err(GatewayError::Socket(e.to_string())),
            },

            tick = ticks.recv() => {
                let Some(first) = tick else { break Ok(()) };
                let mut batch = vec![first];
                batch.extend(ticks.drain_ready(MAX_MARKET_DATA_BATCH - 1));

                for tick in &batch {
                    store.apply_tick(tick);
                    positions.observe(tick);
                }

                let event = ServerEvent::MarketData(batch.iter().map(AsRef::as_ref).collect());
                if let Err(e) = send(&mut sink, &event).await {
                    break Err(e);
                }
            }

            () = positions.next_update() => {
                if positions.latest.is_empty() {
                    continue;
                }
                let event = ServerEvent::PositionUpdate {
                    positions: positions.latest.values().map(AsRef::as_ref).collect(),
                };
                if let Err(e) = send(&mut sink, &event).await {
                    break Err(e);
                }
            }
        }
    };

    if let Err(e) = outcome {
        tracing::warn!(session, error = %e, "Consumer connection ended with error");
    }

    store.teardown().await;
    tracing::info!(session, "Consumer disconnected");
}

async fn send(sink: &mut Sink, event: &ServerEvent<'_>) -> Result<(), GatewayError> {
    let text = event.to_json()?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| GatewayError::Socket(e.to_string()))
}

async fn send_error(
    sink: &mut Sink,
    request: Option<&str>,
    message: impl ToString,
) -> Result<(), GatewayError> {
    send(
        sink,
        &ServerEvent::Error {
            request,
            message: message.to_string(),
        },
    )
    .await
}

async fn handle_text(
    text: &str,
    session: SessionId,
    store: &ClientMarketStore,
    state: &GatewayState,
    positions: &mut Positions,
    sink: &mut Sink,
) -> Result<(), GatewayError> {
    let request = match serde_json::from_str::<ClientRequest>(text) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(session, error = %e, "Unparseable consumer request");
            return send_error(sink, None, format!("invalid request: {e}")).await;
        }
    };

    tracing::debug!(session, request = request.name(), "Consumer request");

    match request {
        ClientRequest::Subscribe(request) => subscribe(request, store, sink).await,
        ClientRequest::SubscribePositions(request) => {
            subscribe_positions(request, store, positions, sink).await
        }
        ClientRequest::Unsubscribe(request) => {
            unsubscribe(request, store, positions, sink).await
        }
        ClientRequest::GetSubscriptions => {
            let keys = state.registry.subscriptions(session).await;
            send(sink, &ServerEvent::Subscriptions { tokens: &keys }).await
        }
        ClientRequest::GetSnapshot => {
            let snapshot = store.snapshot();
            send(sink, &ServerEvent::Snapshot(&snapshot)).await
        }
    }
}

async fn subscribe(
    request: SubscribeRequest,
    store: &ClientMarketStore,
    sink: &mut Sink,
) -> Result<(), GatewayError> {
    let Some(mode) = request.feed_mode() else {
        return send_error(sink, Some("subscribe"), "unknown mode").await;
    };

    match store.subscribe_tokens(request.tokens, mode).await {
        Ok(keys) => {
            let event = ServerEvent::Subscribed {
                tokens: &keys,
                mode,
                positions: false,
                broker_id: None,
                update_interval: None,
            };
            send(sink, &event).await
        }
        Err(e) => send_error(sink, Some("subscribe"), e).await,
    }
}

async fn subscribe_positions(
    request: PositionsRequest,
    store: &ClientMarketStore,
    positions: &mut Positions,
    sink: &mut Sink,
) -> Result<(), GatewayError> {
    match store
        .subscribe_tokens(request.tokens.clone(), FeedMode::Ltp)
        .await
    {
        Ok(keys) => {
            positions.track(&keys, &request);
            let interval_ms = u64::try_from(request.interval().as_millis()).unwrap_or(u64::MAX);
            let event = ServerEvent::Subscribed {
                tokens: &keys,
                mode: FeedMode::Ltp,
                positions: true,
                broker_id: request.broker_id.as_deref(),
                update_interval: Some(interval_ms),
            };
            send(sink, &event).await
        }
        Err(e) => send_error(sink, Some("subscribePositions"), e).await,
    }
}

async fn unsubscribe(
    request: UnsubscribeRequest,
    store: &ClientMarketStore,
    positions: &mut Positions,
    sink: &mut Sink,
) -> Result<(), GatewayError> {
    match store.unsubscribe_tokens(request.tokens).await {
        Ok(keys) => {
            positions.forget(&keys);
            send(sink, &ServerEvent::Unsubscribed { tokens: &keys }).await
        }
        Err(e) => send_error(sink, Some("unsubscribe"), e).await,
    }
}
