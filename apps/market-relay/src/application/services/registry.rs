//! Subscription Registry
//!
//! The single serialization point for the global desired set. Every join,
//! leave, disconnect and resync runs under one async mutex, so refcount
//! transitions and the control frames they cause are never interleaved.
//!
//! # Resync
//!
//! The connector exposes a streaming epoch that increases on every entry
//! into Streaming. The registry remembers the epoch it last pushed the full
//! desired set on; every mutating call first resyncs when the connector is
//! streaming on a newer epoch. A resync therefore happens exactly once per
//! streaming period and always before the first join processed in it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::application::ports::{AliasResolver, FeedControl};
use crate::domain::market::{FeedMode, SubscriptionKey};
use crate::domain::subscription::{DesiredSet, KeyRequest, SessionId, SubscriptionChanges};
use crate::infrastructure::metrics;

// =============================================================================
// Stats
// =============================================================================

/// Registry counters for health reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Open consumer sessions.
    pub sessions: usize,
    /// Keys in the global desired set.
    pub upstream_keys: usize,
    /// Streaming epoch of the last full resync.
    pub synced_epoch: Option<u64>,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    desired: DesiredSet,
    synced_epoch: Option<u64>,
}

/// Reference-counted owner of upstream subscriptions.
pub struct SubscriptionRegistry {
    feed: Arc<dyn FeedControl>,
    state: Mutex<RegistryState>,
    aliases: RwLock<HashMap<SubscriptionKey, String>>,
    next_session: AtomicU64,
    session_count: AtomicUsize,
    key_count: AtomicUsize,
    synced_epoch: AtomicU64,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry driving the given feed.
    #[must_use]
    pub fn new(feed: Arc<dyn FeedControl>) -> Self {
        Self {
            feed,
            state: Mutex::new(RegistryState::default()),
            aliases: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            session_count: AtomicUsize::new(0),
            key_count: AtomicUsize::new(0),
            synced_epoch: AtomicU64::new(0),
        }
    }

    /// Open a new consumer session with no interest.
    pub async fn open_session(&self) -> SessionId {
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().await;
        self.resync_if_needed(&mut state).await;
        state.desired.open_session(session);
        self.publish_counts(&state);

        tracing::debug!(session, "Consumer session opened");
        session
    }

    /// Add keys to a session's interest.
    ///
    /// Keys whose refcount goes 0→1 are subscribed upstream in `mode`, one
    /// control frame per call. Returns the upstream deltas.
    pub async fn join(
        &self,
        session: SessionId,
        requests: &[KeyRequest],
        mode: FeedMode,
    ) -> SubscriptionChanges {
        let mut state = self.state.lock().await;
        self.resync_if_needed(&mut state).await;

        let changes = state.desired.join(session, requests, mode);
        self.refresh_aliases(&state.desired, requests.iter().map(|r| &r.key));
        self.publish_counts(&state);

        for (mode, keys) in &changes.subscribe {
            tracing::info!(session, ?mode, keys = keys.len(), "Subscribing upstream");
            if let Err(e) = self.feed.subscribe(keys, *mode).await {
                tracing::warn!(session, ?mode, error = %e, "Upstream subscribe deferred to resync");
            }
        }

        changes
    }

    /// Remove keys from a session's interest.
    ///
    /// Keys whose refcount goes 1→0 are unsubscribed upstream.
    pub async fn leave(&self, session: SessionId, keys: &[SubscriptionKey]) -> SubscriptionChanges {
        let mut state = self.state.lock().await;
        self.resync_if_needed(&mut state).await;

        let changes = state.desired.leave(session, keys);
        self.refresh_aliases(&state.desired, keys.iter());
        self.publish_counts(&state);
        self.send_unsubscribes(session, &changes).await;

        changes
    }

    /// Remove a session and all of its interest.
    pub async fn on_disconnect(&self, session: SessionId) -> SubscriptionChanges {
        let mut state = self.state.lock().await;
        self.resync_if_needed(&mut state).await;

        let keys = state.desired.session_keys(session);
        let changes = state.desired.remove_session(session);
        self.refresh_aliases(&state.desired, keys.iter());
        self.publish_counts(&state);
        self.send_unsubscribes(session, &changes).await;

        tracing::debug!(
            session,
            released = changes.unsubscribed_keys().len(),
            "Consumer session closed"
        );
        changes
    }

    /// Push the full desired set upstream if the feed entered a new
    /// streaming epoch since the last resync.
    ///
    /// Returns `true` when a resync was issued.
    pub async fn on_reconnect(&self) -> bool {
        let mut state = self.state.lock().await;
        self.resync_if_needed(&mut state).await
    }

    /// Keys a session currently wants.
    pub async fn subscriptions(&self, session: SessionId) -> Vec<SubscriptionKey> {
        self.state.lock().await.desired.session_keys(session)
    }

    /// Number of sessions currently wanting a key.
    pub async fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.state.lock().await.desired.refcount(key)
    }

    /// Counters, readable without waiting on the writer.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let synced = self.synced_epoch.load(Ordering::Relaxed);
        RegistryStats {
            sessions: self.session_count.load(Ordering::Relaxed),
            upstream_keys: self.key_count.load(Ordering::Relaxed),
            synced_epoch: (synced > 0).then_some(synced),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn resync_if_needed(&self, state: &mut RegistryState) -> bool {
        let Some(epoch) = self.feed.streaming_epoch() else {
            return false;
        };
        if state.synced_epoch == Some(epoch) {
            return false;
        }

        state.synced_epoch = Some(epoch);
        self.synced_epoch.store(epoch, Ordering::Relaxed);

        let grouped = state.desired.grouped();
        if grouped.is_empty() {
            tracing::debug!(epoch, "Resync skipped, desired set is empty");
            return true;
        }

        metrics::record_resync();
        for (mode, by_exchange) in grouped {
            let keys: Vec<SubscriptionKey> = by_exchange.into_values().flatten().collect();
            tracing::info!(epoch, ?mode, keys = keys.len(), "Resubscribing desired set");

            if let Err(e) = self.feed.subscribe(&keys, mode).await {
                tracing::warn!(epoch, ?mode, error = %e, "Resync subscribe failed");
            }
        }

        true
    }

    async fn send_unsubscribes(&self, session: SessionId, changes: &SubscriptionChanges) {
        for (mode, keys) in &changes.unsubscribe {
            tracing::info!(session, ?mode, keys = keys.len(), "Unsubscribing upstream");
            if let Err(e) = self.feed.unsubscribe(keys, *mode).await {
                tracing::debug!(session, ?mode, error = %e, "Upstream unsubscribe skipped");
            }
        }
    }

    fn refresh_aliases<'a>(
        &self,
        desired: &DesiredSet,
        keys: impl Iterator<Item = &'a SubscriptionKey>,
    ) {
        let mut aliases = self.aliases.write();
        for key in keys {
            match desired.alias_for(key) {
                Some(alias) => {
                    aliases.insert(key.clone(), alias.to_string());
                }
                None => {
                    aliases.remove(key);
                }
            }
        }
    }

    fn publish_counts(&self, state: &RegistryState) {
        let sessions = state.desired.session_count();
        let keys = state.desired.key_count();
        self.session_count.store(sessions, Ordering::Relaxed);
        self.key_count.store(keys, Ordering::Relaxed);
        metrics::set_consumer_sessions(sessions);
        metrics::set_upstream_subscriptions(keys);
    }
}

impl AliasResolver for SubscriptionRegistry {
    fn alias_for(&self, key: &SubscriptionKey) -> Option<String> {
        self.aliases.read().get(key).cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
