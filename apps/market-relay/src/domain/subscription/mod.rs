//! Subscription Bookkeeping
//!
//! Pure, single-threaded state behind the subscription registry: which keys
//! each consumer session wants, and the reference-counted global desired set
//! derived from them.
//!
//! # Design
//!
//! The desired set tracks, per key, the exact set of sessions wanting it, so
//! the reference count is always `sessions.len()` and can never drift from
//! the per-session want-sets. Every mutation returns the keys whose count
//! crossed 0→1 or 1→0; those are the only keys that need an upstream
//! subscribe or unsubscribe.
//!
//! Locking lives one layer up: this type is owned by the registry, which
//! serializes every call.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::market::{ExchangeType, FeedMode, SubscriptionKey};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a consumer session.
pub type SessionId = u64;

/// A key requested by a session, with its optional client-declared alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    /// Instrument identity.
    pub key: SubscriptionKey,
    /// Client-declared display name.
    pub alias: Option<String>,
}

impl KeyRequest {
    /// Request a key without an alias.
    #[must_use]
    pub const fn plain(key: SubscriptionKey) -> Self {
        Self { key, alias: None }
    }

    /// Request a key with an alias. Blank aliases are dropped.
    #[must_use]
    pub fn aliased(key: SubscriptionKey, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        let alias = alias.trim();
        Self {
            key,
            alias: (!alias.is_empty()).then(|| alias.to_string()),
        }
    }
}

/// One consumer's interest.
#[derive(Debug, Clone, Default)]
pub struct ConsumerSession {
    /// Keys this session wants.
    pub wanted: HashSet<SubscriptionKey>,
    /// Client-declared display names.
    pub aliases: HashMap<SubscriptionKey, String>,
}

/// Global desired-set entry for one key.
#[derive(Debug, Clone)]
struct DesiredEntry {
    sessions: HashSet<SessionId>,
    mode: FeedMode,
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Upstream deltas produced by one mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionChanges {
    /// Keys whose refcount went 0→1, grouped by mode.
    pub subscribe: BTreeMap<FeedMode, Vec<SubscriptionKey>>,
    /// Keys whose refcount went 1→0, grouped by mode.
    pub unsubscribe: BTreeMap<FeedMode, Vec<SubscriptionKey>>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// All keys to subscribe, regardless of mode.
    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<SubscriptionKey> {
        self.subscribe.values().flatten().cloned().collect()
    }

    /// All keys to unsubscribe, regardless of mode.
    #[must_use]
    pub fn unsubscribed_keys(&self) -> Vec<SubscriptionKey> {
        self.unsubscribe.values().flatten().cloned().collect()
    }
}

// =============================================================================
// Desired Set
// =============================================================================

/// Per-session interest plus the reference-counted global desired set.
#[derive(Debug, Default)]
pub struct DesiredSet {
    sessions: HashMap<SessionId, ConsumerSession>,
    keys: HashMap<SubscriptionKey, DesiredEntry>,
}

impl DesiredSet {
    /// Create an empty desired set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with no interest. Idempotent.
    pub fn open_session(&mut self, session: SessionId) {
        self.sessions.entry(session).or_default();
    }

    /// Add keys to a session's want-set.
    ///
    /// The mode is recorded for keys that become newly desired; keys that
    /// are already desired keep their original mode. Returns the keys whose
    /// refcount went 0→1.
    pub fn join(
        &mut self,
        session: SessionId,
        requests: &[KeyRequest],
        mode: FeedMode,
    ) -> SubscriptionChanges {
        let consumer = self.sessions.entry(session).or_default();
        let mut changes = SubscriptionChanges::default();

        for request in requests {
            if let Some(alias) = &request.alias {
                consumer.aliases.insert(request.key.clone(), alias.clone());
            }

            if !consumer.wanted.insert(request.key.clone()) {
                continue;
            }

            let entry = self
                .keys
                .entry(request.key.clone())
                .or_insert_with(|| DesiredEntry {
                    sessions: HashSet::new(),
                    mode,
                });
            entry.sessions.insert(session);

            if entry.sessions.len() == 1 {
                changes
                    .subscribe
                    .entry(entry.mode)
                    .or_default()
                    .push(request.key.clone());
            }
        }

        changes
    }

    /// Remove keys from a session's want-set.
    ///
    /// Returns the keys whose refcount went 1→0. Keys the session never
    /// wanted are ignored.
    pub fn leave(&mut self, session: SessionId, keys: &[SubscriptionKey]) -> SubscriptionChanges {
        let Some(consumer) = self.sessions.get_mut(&session) else {
            return SubscriptionChanges::default();
        };

        let mut released = Vec::new();
        for key in keys {
            consumer.aliases.remove(key);
            if consumer.wanted.remove(key) {
                released.push(key.clone());
            }
        }

        self.release(session, released)
    }

    /// Remove a session and all of its interest.
    ///
    /// Returns the keys whose refcount went 1→0.
    pub fn remove_session(&mut self, session: SessionId) -> SubscriptionChanges {
        let Some(consumer) = self.sessions.remove(&session) else {
            return SubscriptionChanges::default();
        };

        self.release(session, consumer.wanted.into_iter().collect())
    }

    fn release(&mut self, session: SessionId, keys: Vec<SubscriptionKey>) -> SubscriptionChanges {
        let mut changes = SubscriptionChanges::default();

        for key in keys {
            let Some(entry) = self.keys.get_mut(&key) else {
                continue;
            };
            entry.sessions.remove(&session);

            if entry.sessions.is_empty() {
                let mode = entry.mode;
                self.keys.remove(&key);
                changes.unsubscribe.entry(mode).or_default().push(key);
            }
        }

        changes
    }

    /// Number of sessions currently wanting a key.
    #[must_use]
    pub fn refcount(&self, key: &SubscriptionKey) -> usize {
        self.keys.get(key).map_or(0, |entry| entry.sessions.len())
    }

    /// Whether any session wants a key.
    #[must_use]
    pub fn is_desired(&self, key: &SubscriptionKey) -> bool {
        self.keys.contains_key(key)
    }

    /// Sessions currently wanting a key.
    #[must_use]
    pub fn sessions_for(&self, key: &SubscriptionKey) -> Vec<SessionId> {
        self.keys
            .get(key)
            .map(|entry| entry.sessions.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The full desired set, grouped by mode then exchange.
    #[must_use]
    pub fn grouped(&self) -> BTreeMap<FeedMode, BTreeMap<ExchangeType, Vec<SubscriptionKey>>> {
        let mut grouped: BTreeMap<FeedMode, BTreeMap<ExchangeType, Vec<SubscriptionKey>>> =
            BTreeMap::new();

        for (key, entry) in &self.keys {
            grouped
                .entry(entry.mode)
                .or_default()
                .entry(key.exchange)
                .or_default()
                .push(key.clone());
        }

        for by_exchange in grouped.values_mut() {
            for keys in by_exchange.values_mut() {
                keys.sort();
            }
        }

        grouped
    }

    /// Keys wanted by one session, sorted.
    #[must_use]
    pub fn session_keys(&self, session: SessionId) -> Vec<SubscriptionKey> {
        let mut keys: Vec<_> = self
            .sessions
            .get(&session)
            .map(|c| c.wanted.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// A session's interest, if the session exists.
    #[must_use]
    pub fn session(&self, session: SessionId) -> Option<&ConsumerSession> {
        self.sessions.get(&session)
    }

    /// First alias declared for a key by any session currently wanting it.
    ///
    /// Sessions are visited in id order so the choice is stable.
    #[must_use]
    pub fn alias_for(&self, key: &SubscriptionKey) -> Option<&str> {
        let entry = self.keys.get(key)?;
        let mut sessions: Vec<_> = entry.sessions.iter().copied().collect();
        sessions.sort_unstable();

        sessions.into_iter().find_map(|id| {
            self.sessions
                .get(&id)
                .and_then(|c| c.aliases.get(key))
                .map(String::as_str)
        })
    }

    /// Number of distinct desired keys.
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn nse(token: &str) -> SubscriptionKey {
        SubscriptionKey::new(ExchangeType::Nse, token)
    }

    fn plain(keys: &[SubscriptionKey]) -> Vec<KeyRequest> {
        keys.iter().cloned().map(KeyRequest::plain).collect()
    }

    #[test]
    fn first_join_subscribes() {
        let mut set = DesiredSet::new();

        let changes = set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);

        assert_eq!(changes.subscribed_keys(), vec![nse("26000")]);
        assert!(changes.unsubscribe.is_empty());
        assert_eq!(set.refcount(&nse("26000")), 1);
    }

    #[test]
    fn second_session_join_is_silent() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);

        let changes = set.join(2, &plain(&[nse("26000")]), FeedMode::Ltp);

        assert!(changes.is_empty());
        assert_eq!(set.refcount(&nse("26000")), 2);
    }

    #[test]
    fn duplicate_join_same_session_does_not_double_count() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);

        let changes = set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);

        assert!(changes.is_empty());
        assert_eq!(set.refcount(&nse("26000")), 1);
    }

    #[test]
    fn leave_last_session_unsubscribes() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("26000")]), FeedMode::Quote);

        let changes = set.leave(1, &[nse("26000")]);

        assert_eq!(
            changes.unsubscribe.get(&FeedMode::Quote),
            Some(&vec![nse("26000")])
        );
        assert!(!set.is_desired(&nse("26000")));
    }

    #[test]
    fn leave_with_remaining_session_keeps_key() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);
        set.join(2, &plain(&[nse("26000")]), FeedMode::Ltp);

        let changes = set.leave(1, &[nse("26000")]);

        assert!(changes.is_empty());
        assert_eq!(set.sessions_for(&nse("26000")), vec![2]);
    }

    #[test]
    fn leave_unknown_key_or_session_is_noop() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("26000")]), FeedMode::Ltp);

        assert!(set.leave(1, &[nse("99999")]).is_empty());
        assert!(set.leave(7, &[nse("26000")]).is_empty());
        assert_eq!(set.refcount(&nse("26000")), 1);
    }

    #[test]
    fn remove_session_releases_only_exclusive_keys() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("1"), nse("2")]), FeedMode::Ltp);
        set.join(2, &plain(&[nse("2")]), FeedMode::Ltp);

        let changes = set.remove_session(1);

        assert_eq!(changes.unsubscribed_keys(), vec![nse("1")]);
        assert_eq!(set.refcount(&nse("2")), 1);
        assert!(set.session(1).is_none());
    }

    #[test]
    fn mode_of_first_join_is_kept() {
        let mut set = DesiredSet::new();
        set.join(1, &plain(&[nse("1")]), FeedMode::Full);
        set.join(2, &plain(&[nse("1")]), FeedMode::Ltp);

        let changes = set.remove_session(1);
        assert!(changes.is_empty());
        let changes = set.remove_session(2);

        assert_eq!(changes.unsubscribe.get(&FeedMode::Full), Some(&vec![nse("1")]));
    }

    #[test]
    fn grouped_by_mode_and_exchange() {
        let mut set = DesiredSet::new();
        set.join(
            1,
            &plain(&[
                nse("2"),
                nse("1"),
                SubscriptionKey::new(ExchangeType::Mcx, "9"),
            ]),
            FeedMode::Ltp,
        );
        set.join(2, &plain(&[nse("3")]), FeedMode::Quote);

        let grouped = set.grouped();

        let ltp = grouped.get(&FeedMode::Ltp).unwrap();
        assert_eq!(ltp.get(&ExchangeType::Nse), Some(&vec![nse("1"), nse("2")]));
        assert_eq!(ltp.get(&ExchangeType::Mcx).map(Vec::len), Some(1));
        assert_eq!(
            grouped.get(&FeedMode::Quote).unwrap().get(&ExchangeType::Nse),
            Some(&vec![nse("3")])
        );
    }

    #[test]
    fn alias_prefers_lowest_session_id() {
        let mut set = DesiredSet::new();
        set.join(5, &[KeyRequest::aliased(nse("1"), "LATE")], FeedMode::Ltp);
        set.join(2, &[KeyRequest::aliased(nse("1"), "NIFTY")], FeedMode::Ltp);

        assert_eq!(set.alias_for(&nse("1")), Some("NIFTY"));

        set.remove_session(2);
        assert_eq!(set.alias_for(&nse("1")), Some("LATE"));

        set.remove_session(5);
        assert_eq!(set.alias_for(&nse("1")), None);
    }

    #[test]
    fn blank_alias_is_dropped() {
        assert_eq!(KeyRequest::aliased(nse("1"), "  ").alias, None);
        assert_eq!(
            KeyRequest::aliased(nse("1"), " NIFTY ").alias.as_deref(),
            Some("NIFTY")
        );
    }

    #[test]
    fn open_session_counts_without_interest() {
        let mut set = DesiredSet::new();
        set.open_session(1);
        set.open_session(1);

        assert_eq!(set.session_count(), 1);
        assert_eq!(set.key_count(), 0);
        assert!(set.session_keys(1).is_empty());
    }
}
