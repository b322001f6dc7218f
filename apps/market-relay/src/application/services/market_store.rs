//! Client Market Store
//!
//! Per-consumer reconciling cache. Two independent sources feed one
//! snapshot through the same merge:
//!
//! - **push**: enriched ticks from the broadcaster, via [`ClientMarketStore::apply_tick`]
//! - **poll**: a fixed-interval full-quote query over the wanted keys
//!
//! Every merge takes the store's single lock, so the poll task and the push
//! path cannot interleave inside a merge.
//!
//! # Display Keys
//!
//! A key's display name is resolved in this order: the alias the consumer
//! declared, the display key already assigned to that instrument, the
//! symbol carried by the update, and finally `Token_<token>`. Once assigned
//! the display key sticks, so push and poll always land on the same entry.
//! Declaring an alias later renames the existing entry, as does the first
//! real symbol for an entry still shown under its placeholder. A name already
//! shown for another instrument is qualified with the exchange, then with
//! the full key.
//!
//! # Timestamps
//!
//! A pushed tick is stamped with its exchange time when the frame carries
//! one. Poll rows carry no time of their own and are stamped on receipt.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::registry::SubscriptionRegistry;
use crate::application::ports::{FullQuote, QuoteError, QuoteSource};
use crate::domain::market::{EnrichedTick, ExchangeType, FeedMode, SubscriptionKey};
use crate::domain::snapshot::{MarketSnapshot, QuoteFields, SnapshotUpdate};
use crate::domain::subscription::{KeyRequest, SessionId};
use crate::infrastructure::metrics;

// =============================================================================
// Errors
// =============================================================================

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Token entry has an unrecognised exchange.
    #[error("unknown exchange {exchange:?} for token {token}")]
    UnknownExchange {
        /// Requested token.
        token: String,
        /// Requested exchange.
        exchange: String,
    },

    /// Token entry has an empty token.
    #[error("empty token")]
    EmptyToken,

    /// Full-quote query failed.
    #[error(transparent)]
    Quote(#[from] QuoteError),
}

// =============================================================================
// Token Normalization
// =============================================================================

/// A token id given as a string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenId {
    /// `"26000"`
    Text(String),
    /// `26000`
    Number(u64),
}

impl TokenId {
    fn into_string(self) -> String {
        match self {
            Self::Text(text) => text.trim().to_string(),
            Self::Number(number) => number.to_string(),
        }
    }
}

/// One token as a consumer may send it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum TokenSpec {
    /// `{"token": "26000", "exchange": "nse", "symbol": "NIFTY"}`
    Detailed {
        /// Token id.
        token: TokenId,
        /// Exchange name, NSE when absent.
        #[serde(default)]
        exchange: Option<String>,
        /// Alias for display.
        #[serde(default)]
        symbol: Option<String>,
    },
    /// A bare token id on NSE.
    Bare(TokenId),
}

impl TokenSpec {
    /// Canonical key plus declared alias.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty token or an unknown exchange.
    pub fn normalize(self) -> Result<KeyRequest, StoreError> {
        let (token, exchange, symbol) = match self {
            Self::Detailed {
                token,
                exchange,
                symbol,
            } => (token.into_string(), exchange, symbol),
            Self::Bare(token) => (token.into_string(), None, None),
        };

        if token.is_empty() {
            return Err(StoreError::EmptyToken);
        }

        let exchange = match exchange.as_deref().map(str::trim) {
            None | Some("") => ExchangeType::Nse,
            Some(name) => name.parse().map_err(|_| StoreError::UnknownExchange {
                token: token.clone(),
                exchange: name.to_string(),
            })?,
        };

        let key = SubscriptionKey::new(exchange, token);
        Ok(match symbol {
            Some(alias) => KeyRequest::aliased(key, alias),
            None => KeyRequest::plain(key),
        })
    }
}

// =============================================================================
// Store State
// =============================================================================

/// Store tuning.
#[derive(Debug, Clone, Copy)]
pub struct MarketStoreConfig {
    /// Full-quote poll cadence.
    pub poll_interval: Duration,
}

impl Default for MarketStoreConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    snapshot: MarketSnapshot,
    wanted: BTreeMap<SubscriptionKey, Option<String>>,
    display_keys: HashMap<SubscriptionKey, String>,
}

impl StoreState {
    fn is_taken(&self, key: &SubscriptionKey, name: &str) -> bool {
        self.display_keys
            .iter()
            .any(|(other, assigned)| other != key && assigned == name)
    }

    fn unique_name(&self, key: &SubscriptionKey, name: String) -> String {
        if !self.is_taken(key, &name) {
            return name;
        }
        let qualified = format!("{name}:{}", key.exchange);
        if !self.is_taken(key, &qualified) {
            return qualified;
        }
        format!("{name}:{key}")
    }

    /// Make `name` the display key of `key`, renaming any existing entry.
    fn assign(&mut self, key: &SubscriptionKey, name: String) -> String {
        if self.display_keys.get(key) == Some(&name) {
            return name;
        }
        let name = self.unique_name(key, name);
        self.snapshot.rename(key, &name);
        self.display_keys.insert(key.clone(), name.clone());
        name
    }

    fn display_key(&mut self, key: &SubscriptionKey, source_symbol: Option<&str>) -> String {
        if let Some(Some(alias)) = self.wanted.get(key) {
            let alias = alias.clone();
            return self.assign(key, alias);
        }
        let placeholder = key.placeholder_symbol();
        let symbol = source_symbol
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != placeholder);

        if let Some(assigned) = self.display_keys.get(key) {
            // A placeholder name gives way to the first real symbol.
            if symbol.is_none() || !assigned.starts_with(&placeholder) {
                return assigned.clone();
            }
        }

        let resolved = symbol.map_or(placeholder, str::to_string);
        self.assign(key, resolved)
    }

    fn merge(
        &mut self,
        key: &SubscriptionKey,
        source_symbol: Option<&str>,
        fields: QuoteFields,
        timestamp: i64,
    ) {
        let display_key = self.display_key(key, source_symbol);
        self.snapshot.merge(&SnapshotUpdate {
            display_key,
            key: key.clone(),
            fields,
            timestamp,
        });
    }
}

fn received_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn tick_time(tick: &EnrichedTick) -> i64 {
    match i64::try_from(tick.tick.exchange_timestamp) {
        Ok(ms) if ms > 0 => ms,
        _ => received_now(),
    }
}

#[derive(Debug)]
struct PollTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct StoreShared {
    state: parking_lot::Mutex<StoreState>,
    quotes: Arc<dyn QuoteSource>,
}

impl StoreShared {
    fn wanted_keys(&self) -> Vec<SubscriptionKey> {
        self.state.lock().wanted.keys().cloned().collect()
    }

    async fn sync(&self, keys: &[SubscriptionKey]) -> Result<usize, QuoteError> {
        if keys.is_empty() {
            return Ok(0);
        }

        let rows = self.quotes.full_quotes(keys).await?;

        let received = received_now();
        let mut state = self.state.lock();
        let mut merged = 0;
        for FullQuote {
            key,
            symbol,
            fields,
        } in rows
        {
            // Rows for keys dropped while the request was in flight are stale.
            if !state.wanted.contains_key(&key) {
                continue;
            }
            state.merge(&key, symbol.as_deref(), fields, received);
            merged += 1;
        }
        Ok(merged)
    }
}

// =============================================================================
// Client Market Store
// =============================================================================

/// One consumer's reconciled market view.
pub struct ClientMarketStore {
    session: SessionId,
    registry: Arc<SubscriptionRegistry>,
    config: MarketStoreConfig,
    shared: Arc<StoreShared>,
    poller: parking_lot::Mutex<Option<PollTask>>,
}

impl ClientMarketStore {
    /// Create a store for a registered session.
    #[must_use]
    pub fn new(
        session: SessionId,
        registry: Arc<SubscriptionRegistry>,
        quotes: Arc<dyn QuoteSource>,
        config: MarketStoreConfig,
    ) -> Self {
        Self {
            session,
            registry,
            config,
            shared: Arc::new(StoreShared {
                state: parking_lot::Mutex::new(StoreState::default()),
                quotes,
            }),
            poller: parking_lot::Mutex::new(None),
        }
    }

    /// Session this store belongs to.
    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Start tracking tokens.
    ///
    /// Tokens are normalized, their aliases recorded, one full-quote sync is
    /// run for them, and they are joined in the registry. Re-subscribing a
    /// tracked token only refreshes it. Returns the canonical keys.
    ///
    /// # Errors
    ///
    /// Returns an error if any token cannot be normalized; nothing is
    /// subscribed in that case.
    pub async fn subscribe_tokens(
        &self,
        tokens: Vec<TokenSpec>,
        mode: FeedMode,
    ) -> Result<Vec<SubscriptionKey>, StoreError> {
        let requests = tokens
            .into_iter()
            .map(TokenSpec::normalize)
            .collect::<Result<Vec<_>, _>>()?;
        let keys: Vec<SubscriptionKey> = requests.iter().map(|r| r.key.clone()).collect();

        {
            let mut state = self.shared.state.lock();
            for request in &requests {
                let alias = state.wanted.entry(request.key.clone()).or_default();
                if let Some(declared) = &request.alias {
                    *alias = Some(declared.clone());
                    state.assign(&request.key, declared.clone());
                }
            }
        }

        self.start_polling();

        if let Err(e) = self.shared.sync(&keys).await {
            tracing::warn!(session = self.session, error = %e, "Initial quote sync failed");
            metrics::record_quote_poll_failure();
        }

        self.registry.join(self.session, &requests, mode).await;

        tracing::debug!(session = self.session, keys = keys.len(), "Tokens subscribed");
        Ok(keys)
    }

    /// Stop tracking tokens and drop their snapshot entries.
    ///
    /// # Errors
    ///
    /// Returns an error if any token cannot be normalized.
    pub async fn unsubscribe_tokens(
        &self,
        tokens: Vec<TokenSpec>,
    ) -> Result<Vec<SubscriptionKey>, StoreError> {
        let keys = tokens
            .into_iter()
            .map(|spec| spec.normalize().map(|r| r.key))
            .collect::<Result<Vec<_>, _>>()?;

        {
            let mut state = self.shared.state.lock();
            for key in &keys {
                state.wanted.remove(key);
                state.display_keys.remove(key);
                state.snapshot.remove_key(key);
            }
        }

        self.registry.leave(self.session, &keys).await;
        Ok(keys)
    }

    /// Merge a pushed tick if this store wants its key.
    ///
    /// Returns `true` when the tick was merged.
    pub fn apply_tick(&self, tick: &EnrichedTick) -> bool {
        let mut state = self.shared.state.lock();
        if !state.wanted.contains_key(tick.key()) {
            return false;
        }

        state.merge(
            tick.key(),
            Some(&tick.symbol),
            QuoteFields::from_tick(&tick.tick),
            tick_time(tick),
        );
        true
    }

    /// Run one full-quote sync over every wanted key.
    ///
    /// # Errors
    ///
    /// Returns an error if the quote query fails.
    pub async fn sync_now(&self) -> Result<usize, StoreError> {
        let keys = self.shared.wanted_keys();
        Ok(self.shared.sync(&keys).await?)
    }

    /// Start the poll task. Calling again while it runs does nothing.
    pub fn start_polling(&self) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            Arc::clone(&self.shared),
            self.session,
            self.config.poll_interval,
            cancel.clone(),
        ));

        tracing::debug!(
            session = self.session,
            interval_ms = self.config.poll_interval.as_millis(),
            "Quote polling started"
        );
        *poller = Some(PollTask { handle, cancel });
    }

    /// Stop the poll task, if running.
    pub fn stop_polling(&self) {
        if let Some(task) = self.poller.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
            tracing::debug!(session = self.session, "Quote polling stopped");
        }
    }

    /// Whether the poll task is running.
    #[must_use]
    pub fn is_polling(&self) -> bool {
        self.poller
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Stop polling and release every key in the registry.
    pub async fn teardown(&self) {
        self.stop_polling();
        self.registry.on_disconnect(self.session).await;
    }

    /// Copy of the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> MarketSnapshot {
        self.shared.state.lock().snapshot.clone()
    }

    /// Keys this store wants, sorted.
    #[must_use]
    pub fn wanted_keys(&self) -> Vec<SubscriptionKey> {
        self.shared.wanted_keys()
    }
}

impl Drop for ClientMarketStore {
    fn drop(&mut self) {
        self.stop_polling();
    }
}

async fn poll_loop(
    shared: Arc<StoreShared>,
    session: SessionId,
    period: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let keys = shared.wanted_keys();
                match shared.sync(&keys).await {
                    Ok(merged) => tracing::trace!(session, merged, "Quote poll merged"),
                    Err(e) => {
                        tracing::warn!(session, error = %e, "Quote poll failed, retrying next interval");
                        metrics::record_quote_poll_failure();
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
