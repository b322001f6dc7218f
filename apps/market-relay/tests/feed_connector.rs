//! Feed Connector Integration Tests
//!
//! Runs the connector against a local WebSocket server standing in for the
//! upstream quote source.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use market_relay::infrastructure::feed::codec::encode_frame;
use market_relay::infrastructure::feed::{ControlAction, ControlFrame, ReconnectConfig};
use market_relay::{
    ConnectionState, ExchangeType, FeedConnectorConfig, FeedControl, FeedCredentials, FeedError,
    FeedEvent, FeedMode, KeyRequest, SubscriptionKey, SubscriptionRegistry,
    UpstreamFeedConnector,
};

const WAIT: Duration = Duration::from_secs(5);

fn config(url: String) -> FeedConnectorConfig {
    let credentials = FeedCredentials::new("key", "C1", "feed", "jwt").unwrap();
    let mut config = FeedConnectorConfig::new(url, credentials);
    config.reconnect = ReconnectConfig::fixed(Duration::from_millis(10), 3);
    config.connect_timeout = Duration::from_secs(2);
    config
}

fn nifty() -> SubscriptionKey {
    SubscriptionKey::new(ExchangeType::Nse, "26000")
}

async fn wait_for(rx: &mut mpsc::Receiver<FeedEvent>, wanted: FeedEvent) {
    timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if event == wanted {
                return;
            }
        }
        panic!("event channel closed before {wanted:?}");
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {wanted:?}"));
}

/// Accept upstream connections, forwarding each control frame with the
/// index of the connection it arrived on.
///
/// Every connection first sends `ticks`. Connections with an index below
/// `close_after_control` are closed after their first control frame.
fn spawn_upstream(
    listener: TcpListener,
    ticks: Vec<Vec<u8>>,
    close_after_control: usize,
) -> mpsc::UnboundedReceiver<(usize, ControlFrame)> {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let frames_tx = frames_tx.clone();
            let ticks = ticks.clone();
            let close = index < close_after_control;
            let conn = index;
            index += 1;

            tokio::spawn(async move {
                for tick in ticks {
                    ws.send(Message::Binary(tick.into())).await.unwrap();
                }
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let Ok(frame) = serde_json::from_str::<ControlFrame>(text.as_str()) else {
                        continue;
                    };
                    let _ = frames_tx.send((conn, frame));
                    if close {
                        let _ = ws.close(None).await;
                        return;
                    }
                }
            });
        }
    });

    frames_rx
}

#[tokio::test]
async fn delivers_ticks_and_sends_control_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let tick = encode_frame(FeedMode::Ltp, ExchangeType::Nse, 26_000, 5, 0, 2_150_050);
    let mut frames = spawn_upstream(listener, vec![tick], 0);

    let (event_tx, mut event_rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let connector = Arc::new(UpstreamFeedConnector::new(
        config(url),
        event_tx,
        cancel.clone(),
    ));
    let (tick_tx, mut tick_rx) = mpsc::channel(16);
    connector.on_tick(tick_tx).unwrap();
    let run = tokio::spawn(Arc::clone(&connector).run());

    wait_for(&mut event_rx, FeedEvent::Streaming { epoch: 1 }).await;
    assert_eq!(connector.streaming_epoch(), Some(1));

    let tick = timeout(WAIT, tick_rx.recv()).await.unwrap().unwrap();
    assert_eq!(tick.key, nifty());
    assert_eq!(tick.ltp, Decimal::new(2_150_050, 2));

    connector.subscribe(&[nifty()], FeedMode::Quote).await.unwrap();
    let (conn, frame) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(conn, 0);
    assert_eq!(frame.action, ControlAction::Subscribe.code());
    assert_eq!(frame.params.mode, FeedMode::Quote.code());
    assert_eq!(frame.params.token_list.len(), 1);
    assert_eq!(frame.params.token_list[0].exchange_type, 1);
    assert_eq!(frame.params.token_list[0].tokens, vec!["26000".to_string()]);

    cancel.cancel();
    let result = timeout(WAIT, run).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(connector.state().get_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn second_tick_consumer_is_rejected() {
    let (event_tx, _event_rx) = mpsc::channel(1);
    let connector = UpstreamFeedConnector::new(
        config("ws://127.0.0.1:1".to_string()),
        event_tx,
        CancellationToken::new(),
    );

    let (first, _) = mpsc::channel(1);
    let (second, _) = mpsc::channel(1);
    connector.on_tick(first).unwrap();

    assert!(matches!(
        connector.on_tick(second),
        Err(FeedError::TickConsumerAlreadyRegistered)
    ));
}

#[tokio::test]
async fn exhausted_budget_moves_to_failed() {
    // Reserve a port, then free it so every connection attempt is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (event_tx, mut event_rx) = mpsc::channel(32);
    let connector = Arc::new(UpstreamFeedConnector::new(
        config(url),
        event_tx,
        CancellationToken::new(),
    ));

    let result = timeout(WAIT, Arc::clone(&connector).run()).await.unwrap();

    assert!(matches!(
        result,
        Err(FeedError::MaxReconnectAttemptsExceeded(3))
    ));
    assert!(connector.state().is_failed());
    assert_eq!(connector.streaming_epoch(), None);

    let mut events = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.last(), Some(&FeedEvent::Failed));
    assert!(events.contains(&FeedEvent::Reconnecting { attempt: 3 }));
    assert!(!events.iter().any(|e| matches!(e, FeedEvent::Streaming { .. })));
}

#[tokio::test]
async fn reconnect_resubscribes_desired_set_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let mut frames = spawn_upstream(listener, Vec::new(), 1);

    let (event_tx, mut event_rx) = mpsc::channel(32);
    let cancel = CancellationToken::new();
    let connector = Arc::new(UpstreamFeedConnector::new(
        config(url),
        event_tx,
        cancel.clone(),
    ));
    let registry = SubscriptionRegistry::new(connector.clone());
    tokio::spawn(Arc::clone(&connector).run());

    wait_for(&mut event_rx, FeedEvent::Streaming { epoch: 1 }).await;
    registry.on_reconnect().await;
    let session = registry.open_session().await;
    registry
        .join(session, &[KeyRequest::plain(nifty())], FeedMode::Ltp)
        .await;

    // The first connection closes after this frame.
    let (conn, frame) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!((conn, frame.token_count()), (0, 1));

    wait_for(&mut event_rx, FeedEvent::Streaming { epoch: 2 }).await;
    assert!(registry.on_reconnect().await);
    assert!(!registry.on_reconnect().await);

    let (conn, frame) = timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(conn, 1);
    assert_eq!(frame.action, ControlAction::Subscribe.code());
    assert_eq!(frame.params.token_list[0].tokens, vec!["26000".to_string()]);

    // Nothing else reaches the new connection.
    assert!(
        timeout(Duration::from_millis(200), frames.recv())
            .await
            .is_err()
    );
    assert_eq!(registry.refcount(&nifty()).await, 1);

    cancel.cancel();
}
