//! Subscription Lifecycle Integration Tests
//!
//! Reference counting across sessions, upstream control frame counts and
//! resync behaviour across streaming epochs.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;

use market_relay::{
    ExchangeType, FeedControl, FeedControlError, FeedMode, KeyRequest, SessionId,
    SubscriptionKey, SubscriptionRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Subscribe,
    Unsubscribe,
}

/// Feed fake that records every control call made while streaming.
///
/// Each call yields before recording so that unserialized callers would
/// interleave.
#[derive(Default)]
struct RecordingFeed {
    epoch: Mutex<Option<u64>>,
    subscribes: Mutex<Vec<Vec<SubscriptionKey>>>,
    unsubscribes: Mutex<Vec<Vec<SubscriptionKey>>>,
    log: Mutex<Vec<(Control, SubscriptionKey)>>,
}

impl RecordingFeed {
    fn streaming(epoch: u64) -> Arc<Self> {
        let feed = Arc::new(Self::default());
        feed.set_epoch(Some(epoch));
        feed
    }

    fn set_epoch(&self, epoch: Option<u64>) {
        *self.epoch.lock() = epoch;
    }

    fn subscribe_count(&self, key: &SubscriptionKey) -> usize {
        self.subscribes
            .lock()
            .iter()
            .flatten()
            .filter(|k| *k == key)
            .count()
    }

    fn unsubscribe_count(&self, key: &SubscriptionKey) -> usize {
        self.unsubscribes
            .lock()
            .iter()
            .flatten()
            .filter(|k| *k == key)
            .count()
    }
}

#[async_trait]
impl FeedControl for RecordingFeed {
    fn streaming_epoch(&self) -> Option<u64> {
        *self.epoch.lock()
    }

    async fn subscribe(
        &self,
        keys: &[SubscriptionKey],
        _mode: FeedMode,
    ) -> Result<(), FeedControlError> {
        if self.epoch.lock().is_none() {
            return Err(FeedControlError::NotStreaming);
        }
        tokio::task::yield_now().await;
        self.log
            .lock()
            .extend(keys.iter().map(|k| (Control::Subscribe, k.clone())));
        self.subscribes.lock().push(keys.to_vec());
        Ok(())
    }

    async fn unsubscribe(
        &self,
        keys: &[SubscriptionKey],
        _mode: FeedMode,
    ) -> Result<(), FeedControlError> {
        if self.epoch.lock().is_none() {
            return Err(FeedControlError::NotStreaming);
        }
        tokio::task::yield_now().await;
        self.log
            .lock()
            .extend(keys.iter().map(|k| (Control::Unsubscribe, k.clone())));
        self.unsubscribes.lock().push(keys.to_vec());
        Ok(())
    }
}

fn nse(token: &str) -> SubscriptionKey {
    SubscriptionKey::new(ExchangeType::Nse, token)
}

fn requests(keys: &[SubscriptionKey]) -> Vec<KeyRequest> {
    keys.iter().cloned().map(KeyRequest::plain).collect()
}

// =============================================================================
// Two Sessions, One Key
// =============================================================================

#[tokio::test]
async fn shared_key_is_released_once_by_last_session() {
    let feed = RecordingFeed::streaming(1);
    let registry = SubscriptionRegistry::new(feed.clone());
    let key = nse("26000");

    let a = registry.open_session().await;
    let b = registry.open_session().await;
    registry.join(a, &requests(&[key.clone()]), FeedMode::Ltp).await;
    registry.join(b, &requests(&[key.clone()]), FeedMode::Ltp).await;

    assert_eq!(registry.refcount(&key).await, 2);
    assert_eq!(feed.subscribe_count(&key), 1);

    let changes = registry.on_disconnect(a).await;
    assert!(changes.is_empty());
    assert_eq!(registry.refcount(&key).await, 1);
    assert_eq!(feed.unsubscribe_count(&key), 0);

    let changes = registry.on_disconnect(b).await;
    assert_eq!(changes.unsubscribed_keys(), vec![key.clone()]);
    assert_eq!(registry.refcount(&key).await, 0);
    assert_eq!(feed.unsubscribe_count(&key), 1);
    assert_eq!(registry.stats().upstream_keys, 0);
}

#[tokio::test]
async fn leave_only_releases_keys_the_session_wanted() {
    let feed = RecordingFeed::streaming(1);
    let registry = SubscriptionRegistry::new(feed.clone());
    let a = registry.open_session().await;
    let b = registry.open_session().await;
    registry
        .join(a, &requests(&[nse("1"), nse("2")]), FeedMode::Quote)
        .await;

    let changes = registry.leave(b, &[nse("1")]).await;

    assert!(changes.is_empty());
    assert_eq!(registry.refcount(&nse("1")).await, 1);
    assert_eq!(registry.subscriptions(a).await.len(), 2);
    assert!(registry.subscriptions(b).await.is_empty());
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_and_disconnects_alternate_upstream() {
    let feed = RecordingFeed::streaming(1);
    let registry = Arc::new(SubscriptionRegistry::new(feed.clone()));
    let key = nse("26000");
    assert!(registry.on_reconnect().await);

    let mut tasks = Vec::new();
    for worker in 0..8_u32 {
        let registry = Arc::clone(&registry);
        let key = key.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..25_u32 {
                let session = registry.open_session().await;
                registry
                    .join(session, &requests(&[key.clone()]), FeedMode::Ltp)
                    .await;
                tokio::task::yield_now().await;
                if (worker + round) % 2 == 0 {
                    registry.leave(session, &[key.clone()]).await;
                }
                registry.on_disconnect(session).await;
                if round % 5 == 0 {
                    assert!(!registry.on_reconnect().await);
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let log = feed.log.lock().clone();
    assert!(!log.is_empty());
    assert!(log.iter().all(|(_, k)| *k == key));
    for (i, (control, _)) in log.iter().enumerate() {
        let expected = if i % 2 == 0 {
            Control::Subscribe
        } else {
            Control::Unsubscribe
        };
        assert_eq!(*control, expected, "control #{i} out of order: {log:?}");
    }

    assert_eq!(registry.refcount(&key).await, 0);
    assert_eq!(log.last().map(|(c, _)| *c), Some(Control::Unsubscribe));
    assert_eq!(registry.stats().upstream_keys, 0);
    assert_eq!(registry.stats().sessions, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnect_racing_join_leaves_upstream_matching_refcount() {
    let feed = RecordingFeed::streaming(1);
    let registry = Arc::new(SubscriptionRegistry::new(feed.clone()));
    let key = nse("2885");
    assert!(registry.on_reconnect().await);

    for _ in 0..50 {
        let leaving = registry.open_session().await;
        registry
            .join(leaving, &requests(&[key.clone()]), FeedMode::Ltp)
            .await;
        let joining = registry.open_session().await;

        let disconnect = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.on_disconnect(leaving).await })
        };
        let join = {
            let registry = Arc::clone(&registry);
            let key = key.clone();
            tokio::spawn(async move {
                registry
                    .join(joining, &requests(&[key]), FeedMode::Ltp)
                    .await
            })
        };
        disconnect.await.unwrap();
        join.await.unwrap();

        assert_eq!(registry.refcount(&key).await, 1);
        let subscribed = feed.subscribe_count(&key) > feed.unsubscribe_count(&key);
        assert!(subscribed, "upstream dropped a key that is still wanted");

        registry.on_disconnect(joining).await;
        assert_eq!(feed.subscribe_count(&key), feed.unsubscribe_count(&key));
    }
}

// =============================================================================
// Resync
// =============================================================================

#[tokio::test]
async fn resync_happens_once_per_streaming_epoch() {
    let feed = Arc::new(RecordingFeed::default());
    let registry = SubscriptionRegistry::new(feed.clone());
    let session = registry.open_session().await;

    // Interest registered while the upstream is down is deferred.
    registry
        .join(session, &requests(&[nse("1"), nse("2")]), FeedMode::Ltp)
        .await;
    assert!(feed.subscribes.lock().is_empty());

    // Several failed attempts later the connection streams on epoch 1.
    feed.set_epoch(Some(1));
    assert!(registry.on_reconnect().await);
    assert!(!registry.on_reconnect().await);
    registry
        .join(session, &requests(&[nse("1")]), FeedMode::Ltp)
        .await;

    assert_eq!(feed.subscribes.lock().len(), 1);
    assert_eq!(feed.subscribe_count(&nse("1")), 1);
    assert_eq!(feed.subscribe_count(&nse("2")), 1);
    assert_eq!(registry.stats().synced_epoch, Some(1));

    // A later reconnect pushes the desired set again, once.
    feed.set_epoch(None);
    feed.set_epoch(Some(2));
    assert!(registry.on_reconnect().await);
    assert!(!registry.on_reconnect().await);

    assert_eq!(feed.subscribes.lock().len(), 2);
    assert_eq!(feed.subscribe_count(&nse("1")), 2);
    assert_eq!(registry.stats().synced_epoch, Some(2));
}

#[tokio::test]
async fn first_join_of_new_epoch_resyncs_before_subscribing() {
    let feed = RecordingFeed::streaming(1);
    let registry = SubscriptionRegistry::new(feed.clone());
    let session = registry.open_session().await;
    registry
        .join(session, &requests(&[nse("1")]), FeedMode::Ltp)
        .await;

    // The streaming event for epoch 2 has not been handled yet.
    feed.set_epoch(Some(2));
    registry
        .join(session, &requests(&[nse("2")]), FeedMode::Ltp)
        .await;

    let subscribes = feed.subscribes.lock().clone();
    assert_eq!(subscribes.len(), 3);
    assert_eq!(subscribes[1], vec![nse("1")]);
    assert_eq!(subscribes[2], vec![nse("2")]);
}

// =============================================================================
// Refcount Property
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Join(usize, usize),
    Leave(usize, usize),
    Disconnect(usize),
}

const SESSIONS: usize = 3;
const KEYS: usize = 4;

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..SESSIONS, 0..KEYS).prop_map(|(s, k)| Op::Join(s, k)),
        (0..SESSIONS, 0..KEYS).prop_map(|(s, k)| Op::Leave(s, k)),
        (0..SESSIONS).prop_map(Op::Disconnect),
    ]
}

fn key(index: usize) -> SubscriptionKey {
    nse(&(1000 + index).to_string())
}

async fn check_refcounts(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let feed = RecordingFeed::streaming(1);
    let registry = SubscriptionRegistry::new(feed.clone());

    let mut sessions: Vec<SessionId> = Vec::new();
    for _ in 0..SESSIONS {
        sessions.push(registry.open_session().await);
    }

    let mut model: HashMap<usize, HashSet<usize>> = HashMap::new();
    let mut rises = vec![0usize; KEYS];
    let mut falls = vec![0usize; KEYS];
    let holders = |model: &HashMap<usize, HashSet<usize>>, k: usize| {
        model.values().filter(|wanted| wanted.contains(&k)).count()
    };

    for op in ops {
        match op {
            Op::Join(s, k) => {
                let before = holders(&model, k);
                if model.entry(s).or_default().insert(k) && before == 0 {
                    rises[k] += 1;
                }
                registry
                    .join(sessions[s], &requests(&[key(k)]), FeedMode::Ltp)
                    .await;
            }
            Op::Leave(s, k) => {
                let removed = model.get_mut(&s).is_some_and(|wanted| wanted.remove(&k));
                if removed && holders(&model, k) == 0 {
                    falls[k] += 1;
                }
                registry.leave(sessions[s], &[key(k)]).await;
            }
            Op::Disconnect(s) => {
                for k in model.remove(&s).unwrap_or_default() {
                    if holders(&model, k) == 0 {
                        falls[k] += 1;
                    }
                }
                registry.on_disconnect(sessions[s]).await;
            }
        }

        for k in 0..KEYS {
            prop_assert_eq!(registry.refcount(&key(k)).await, holders(&model, k));
        }
    }

    for k in 0..KEYS {
        prop_assert_eq!(feed.subscribe_count(&key(k)), rises[k]);
        prop_assert_eq!(feed.unsubscribe_count(&key(k)), falls[k]);
    }
    Ok(())
}

proptest! {
    #[test]
    fn refcount_tracks_wanting_sessions(ops in proptest::collection::vec(op(), 1..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(check_refcounts(ops))?;
    }
}
