//! Tick Enricher
//!
//! Resolves a display identity for each decoded tick, in priority order:
//!
//! 1. the alias a consumer declared for the key
//! 2. the instrument master, looked up with a bounded timeout
//! 3. the placeholder `Token_<token>`
//!
//! Enrichment never waits on the instrument master. The first tick for an
//! unresolved key starts one background lookup and leaves with the
//! placeholder; ticks arriving while that lookup is in flight do the same.
//! Once the lookup lands, later ticks carry the resolved identity.
//!
//! Successful lookups are cached per key. Misses, errors and timeouts are
//! cached for a short negative TTL so an unresolvable token costs at most
//! one lookup per TTL instead of one per tick. At most `max_in_flight`
//! lookups run at once; a key that finds no free slot retries on its next
//! tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::application::ports::{AliasResolver, InstrumentLookup};
use crate::domain::market::{EnrichedTick, SubscriptionKey, SymbolRecord, Tick};
use crate::infrastructure::metrics::{self, FallbackReason};

/// Lot size reported when the instrument is unknown.
pub const DEFAULT_LOT_SIZE: u32 = 1;

/// Enricher tuning.
#[derive(Debug, Clone, Copy)]
pub struct EnricherConfig {
    /// Upper bound on a single instrument lookup.
    pub lookup_timeout: Duration,
    /// How long an unresolved key is remembered.
    pub negative_ttl: Duration,
    /// Instrument lookups allowed in flight at once.
    pub max_in_flight: usize,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_millis(1500),
            negative_ttl: Duration::from_secs(60),
            max_in_flight: 64,
        }
    }
}

#[derive(Debug, Clone)]
enum CacheEntry {
    Found(SymbolRecord),
    Missing(Instant),
    Pending,
}

type Cache = Arc<RwLock<HashMap<SubscriptionKey, CacheEntry>>>;

/// Display identity resolver.
pub struct TickEnricher {
    lookup: Arc<dyn InstrumentLookup>,
    aliases: Arc<dyn AliasResolver>,
    config: EnricherConfig,
    cache: Cache,
    lookups: Arc<Semaphore>,
}

impl TickEnricher {
    /// Create an enricher.
    #[must_use]
    pub fn new(
        lookup: Arc<dyn InstrumentLookup>,
        aliases: Arc<dyn AliasResolver>,
        config: EnricherConfig,
    ) -> Self {
        Self {
            lookup,
            aliases,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            lookups: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    /// Attach a display identity to a tick.
    ///
    /// Never fails and never waits: every unresolved path ends at the
    /// placeholder identity. Must be called inside a Tokio runtime.
    pub fn enrich(&self, tick: Tick) -> EnrichedTick {
        let started = Instant::now();
        let key = tick.key.clone();

        let enriched = if let Some(alias) = self.aliases.alias_for(&key) {
            let record = self.cached(&key);
            EnrichedTick {
                tick,
                name: record.as_ref().map_or_else(|| alias.clone(), |r| r.name.clone()),
                lot_size: record.map_or(DEFAULT_LOT_SIZE, |r| r.lot_size),
                symbol: alias,
            }
        } else {
            match self.resolve(&key) {
                Some(record) => EnrichedTick {
                    tick,
                    symbol: record.symbol,
                    name: record.name,
                    lot_size: record.lot_size,
                },
                None => placeholder(tick),
            }
        };

        metrics::record_enrichment_duration(started.elapsed());
        enriched
    }

    /// Whether a lookup for `key` is in flight.
    #[must_use]
    pub fn is_pending(&self, key: &SubscriptionKey) -> bool {
        matches!(self.cache.read().get(key), Some(CacheEntry::Pending))
    }

    fn cached(&self, key: &SubscriptionKey) -> Option<SymbolRecord> {
        match self.cache.read().get(key) {
            Some(CacheEntry::Found(record)) => Some(record.clone()),
            _ => None,
        }
    }

    fn resolve(&self, key: &SubscriptionKey) -> Option<SymbolRecord> {
        let mut cache = self.cache.write();
        match cache.get(key) {
            Some(CacheEntry::Found(record)) => return Some(record.clone()),
            Some(CacheEntry::Pending) => return None,
            Some(CacheEntry::Missing(since)) if since.elapsed() < self.config.negative_ttl => {
                return None;
            }
            _ => {}
        }

        let Ok(permit) = Arc::clone(&self.lookups).try_acquire_owned() else {
            tracing::trace!(key = %key, "Lookup slots busy, placeholder for now");
            return None;
        };

        cache.insert(key.clone(), CacheEntry::Pending);
        drop(cache);

        tokio::spawn(lookup_task(
            Arc::clone(&self.lookup),
            Arc::clone(&self.cache),
            key.clone(),
            self.config.lookup_timeout,
            permit,
        ));
        None
    }
}

async fn lookup_task(
    lookup: Arc<dyn InstrumentLookup>,
    cache: Cache,
    key: SubscriptionKey,
    timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let result = tokio::time::timeout(timeout, lookup.symbol_by_token(&key.token, key.exchange)).await;

    let entry = match result {
        Ok(Ok(Some(record))) => CacheEntry::Found(record),
        Ok(Ok(None)) => {
            tracing::debug!(key = %key, "Instrument not found, using placeholder");
            metrics::record_enrichment_fallback(FallbackReason::Unknown);
            CacheEntry::Missing(Instant::now())
        }
        Ok(Err(e)) => {
            tracing::warn!(key = %key, error = %e, "Instrument lookup failed");
            metrics::record_enrichment_fallback(FallbackReason::Error);
            CacheEntry::Missing(Instant::now())
        }
        Err(_) => {
            tracing::warn!(
                key = %key,
                timeout_ms = timeout.as_millis(),
                "Instrument lookup timed out"
            );
            metrics::record_enrichment_fallback(FallbackReason::Timeout);
            CacheEntry::Missing(Instant::now())
        }
    };

    cache.write().insert(key, entry);
}

fn placeholder(tick: Tick) -> EnrichedTick {
    let symbol = tick.key.placeholder_symbol();
    EnrichedTick {
        tick,
        name: symbol.clone(),
        symbol,
        lot_size: DEFAULT_LOT_SIZE,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::{LookupError, MockInstrumentLookup};
    use crate::domain::market::{ExchangeType, FeedMode};
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticAliases(HashMap<SubscriptionKey, String>);

    impl AliasResolver for StaticAliases {
        fn alias_for(&self, key: &SubscriptionKey) -> Option<String> {
            self.0.get(key).cloned()
        }
    }

    fn no_aliases() -> Arc<dyn AliasResolver> {
        Arc::new(StaticAliases(HashMap::new()))
    }

    fn key(token: &str) -> SubscriptionKey {
        SubscriptionKey::new(ExchangeType::Nse, token)
    }

    fn tick(token: &str) -> Tick {
        Tick::new(key(token), FeedMode::Ltp, 1, 0, Decimal::new(100, 0))
    }

    fn record() -> SymbolRecord {
        SymbolRecord {
            token: "2885".to_string(),
            exchange: ExchangeType::Nse,
            symbol: "RELIANCE-EQ".to_string(),
            name: "Reliance Industries".to_string(),
            lot_size: 1,
        }
    }

    async fn settle(enricher: &TickEnricher, token: &str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while enricher.is_pending(&key(token)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Lookup that takes `delay` and counts calls.
    struct SlowLookup {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl InstrumentLookup for SlowLookup {
        async fn symbol_by_token(
            &self,
            _token: &str,
            _exchange: ExchangeType,
        ) -> Result<Option<SymbolRecord>, LookupError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn alias_wins_without_lookup() {
        let mut lookup = MockInstrumentLookup::new();
        lookup.expect_symbol_by_token().never();

        let aliases = Arc::new(StaticAliases(HashMap::from([(key("26000"), "NIFTY".to_string())])));
        let enricher = TickEnricher::new(Arc::new(lookup), aliases, EnricherConfig::default());

        let enriched = enricher.enrich(tick("26000"));

        assert_eq!(enriched.symbol, "NIFTY");
        assert_eq!(enriched.lot_size, DEFAULT_LOT_SIZE);
    }

    #[tokio::test]
    async fn lookup_result_is_used_and_cached() {
        let mut lookup = MockInstrumentLookup::new();
        lookup
            .expect_symbol_by_token()
            .withf(|token, exchange| token.to_string() == "2885" && *exchange == ExchangeType::Nse)
            .times(1)
            .returning(|_, _| Ok(Some(record())));

        let enricher = TickEnricher::new(Arc::new(lookup), no_aliases(), EnricherConfig::default());

        let first = enricher.enrich(tick("2885"));
        assert_eq!(first.symbol, "Token_2885");

        settle(&enricher, "2885").await;
        let second = enricher.enrich(tick("2885"));
        let third = enricher.enrich(tick("2885"));

        assert_eq!(second.symbol, "RELIANCE-EQ");
        assert_eq!(third.name, "Reliance Industries");
    }

    #[tokio::test]
    async fn unknown_token_gets_placeholder_and_negative_cache() {
        let mut lookup = MockInstrumentLookup::new();
        lookup
            .expect_symbol_by_token()
            .times(1)
            .returning(|_, _| Ok(None));

        let enricher = TickEnricher::new(Arc::new(lookup), no_aliases(), EnricherConfig::default());

        let first = enricher.enrich(tick("999"));
        settle(&enricher, "999").await;
        let second = enricher.enrich(tick("999"));

        assert_eq!(first.symbol, "Token_999");
        assert_eq!(second.symbol, "Token_999");
        assert_eq!(first.lot_size, DEFAULT_LOT_SIZE);
    }

    #[tokio::test]
    async fn lookup_error_falls_back() {
        let mut lookup = MockInstrumentLookup::new();
        lookup
            .expect_symbol_by_token()
            .returning(|_, _| Err(LookupError::Status(503)));

        let enricher = TickEnricher::new(Arc::new(lookup), no_aliases(), EnricherConfig::default());

        assert_eq!(enricher.enrich(tick("7")).symbol, "Token_7");
        settle(&enricher, "7").await;
        assert_eq!(enricher.enrich(tick("7")).symbol, "Token_7");
    }

    #[tokio::test]
    async fn expired_negative_entry_retries_lookup() {
        let mut lookup = MockInstrumentLookup::new();
        lookup
            .expect_symbol_by_token()
            .times(2)
            .returning(|_, _| Ok(None));

        let config = EnricherConfig {
            negative_ttl: Duration::ZERO,
            ..EnricherConfig::default()
        };
        let enricher = TickEnricher::new(Arc::new(lookup), no_aliases(), config);

        enricher.enrich(tick("5"));
        settle(&enricher, "5").await;
        enricher.enrich(tick("5"));
        settle(&enricher, "5").await;
    }

    #[tokio::test]
    async fn slow_lookup_runs_once_and_never_waits() {
        let lookup = Arc::new(SlowLookup {
            delay: Duration::from_millis(500),
            calls: AtomicUsize::new(0),
        });
        let enricher = TickEnricher::new(lookup.clone(), no_aliases(), EnricherConfig::default());

        let started = Instant::now();
        for _ in 0..8 {
            assert_eq!(enricher.enrich(tick("1")).symbol, "Token_1");
        }
        assert!(started.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(enricher.is_pending(&key("1")));
        assert_eq!(enricher.enrich(tick("1")).symbol, "Token_1");
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_slots_are_bounded() {
        let lookup = Arc::new(SlowLookup {
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
        });
        let config = EnricherConfig {
            max_in_flight: 2,
            ..EnricherConfig::default()
        };
        let enricher = TickEnricher::new(lookup.clone(), no_aliases(), config);

        for token in ["1", "2", "3"] {
            enricher.enrich(tick(token));
        }

        assert!(enricher.is_pending(&key("1")));
        assert!(enricher.is_pending(&key("2")));
        assert!(!enricher.is_pending(&key("3")));

        settle(&enricher, "1").await;
        settle(&enricher, "2").await;
        enricher.enrich(tick("3"));
        assert!(enricher.is_pending(&key("3")));
    }
}
