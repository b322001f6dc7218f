//! Market Snapshot
//!
//! Per-consumer merged view of every instrument the consumer wants. Entries
//! are held per [`SubscriptionKey`] and carry the display key they are shown
//! under, so one instrument never occupies two entries. Push ticks and poll
//! results both land here through the single [`MarketSnapshot::merge`]
//! function.
//!
//! # Merge Rule
//!
//! A field is overwritten only when the update carries a value for it;
//! absent fields keep whatever the snapshot already holds. The timestamp
//! always moves to the update's time.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::market::{MarketDepth, SubscriptionKey, Tick};

// =============================================================================
// Quote Fields
// =============================================================================

/// Nullable market fields carried by a snapshot entry or an update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteFields {
    /// Last traded price.
    pub ltp: Option<Decimal>,
    /// Day low.
    pub low: Option<Decimal>,
    /// Day high.
    pub high: Option<Decimal>,
    /// Day open.
    pub open: Option<Decimal>,
    /// Previous close.
    pub close: Option<Decimal>,
    /// Average traded price.
    pub avg_price: Option<Decimal>,
    /// Traded volume.
    pub volume: Option<u64>,
    /// Open interest.
    pub open_interest: Option<u64>,
    /// Percent change.
    pub percent_change: Option<Decimal>,
    /// Net change.
    pub net_change: Option<Decimal>,
    /// Market depth.
    pub depth: Option<MarketDepth>,
}

fn overwrite<T: Clone>(slot: &mut Option<T>, update: Option<&T>) {
    if let Some(value) = update {
        *slot = Some(value.clone());
    }
}

impl QuoteFields {
    /// Fields carried by a decoded tick.
    ///
    /// Estimated OHLC values are not exchange data and are left out.
    #[must_use]
    pub fn from_tick(tick: &Tick) -> Self {
        let (low, high, open, close) = if tick.ohlc_estimated {
            (None, None, None, None)
        } else {
            (tick.low, tick.high, tick.open, tick.close)
        };

        Self {
            ltp: Some(tick.ltp),
            low,
            high,
            open,
            close,
            avg_price: tick.avg_price,
            volume: tick.volume,
            open_interest: tick.open_interest,
            percent_change: tick.percent_change,
            net_change: tick.net_change,
            depth: tick.depth.clone(),
        }
    }

    /// Overwrite every field the update carries.
    pub fn merge_from(&mut self, update: &Self) {
        overwrite(&mut self.ltp, update.ltp.as_ref());
        overwrite(&mut self.low, update.low.as_ref());
        overwrite(&mut self.high, update.high.as_ref());
        overwrite(&mut self.open, update.open.as_ref());
        overwrite(&mut self.close, update.close.as_ref());
        overwrite(&mut self.avg_price, update.avg_price.as_ref());
        overwrite(&mut self.volume, update.volume.as_ref());
        overwrite(&mut self.open_interest, update.open_interest.as_ref());
        overwrite(&mut self.percent_change, update.percent_change.as_ref());
        overwrite(&mut self.net_change, update.net_change.as_ref());
        overwrite(&mut self.depth, update.depth.as_ref());
    }

    /// Whether no field is present.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ltp.is_none()
            && self.low.is_none()
            && self.high.is_none()
            && self.open.is_none()
            && self.close.is_none()
            && self.avg_price.is_none()
            && self.volume.is_none()
            && self.open_interest.is_none()
            && self.percent_change.is_none()
            && self.net_change.is_none()
            && self.depth.is_none()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// One update destined for a snapshot, from either source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotUpdate {
    /// Resolved display key.
    pub display_key: String,
    /// Underlying instrument.
    pub key: SubscriptionKey,
    /// Fields carried by the update.
    pub fields: QuoteFields,
    /// Update time in epoch milliseconds.
    pub timestamp: i64,
}

/// Last known state of one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    /// Underlying instrument.
    pub key: SubscriptionKey,
    /// Name the entry is shown under.
    #[serde(skip)]
    pub display_key: String,
    /// Merged field values.
    #[serde(flatten)]
    pub fields: QuoteFields,
    /// Time of the last merge, epoch milliseconds.
    pub updated_at: i64,
}

/// A consumer's merged market view.
///
/// Serializes as `{"entries": {<display key>: entry}, "updatedAt": ms}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarketSnapshot {
    entries: BTreeMap<SubscriptionKey, SnapshotEntry>,
    updated_at: Option<i64>,
}

impl MarketSnapshot {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one update.
    ///
    /// The entry is found by instrument; a changed display key renames it.
    pub fn merge(&mut self, update: &SnapshotUpdate) {
        let entry = self
            .entries
            .entry(update.key.clone())
            .or_insert_with(|| SnapshotEntry {
                key: update.key.clone(),
                display_key: update.display_key.clone(),
                fields: QuoteFields::default(),
                updated_at: update.timestamp,
            });

        entry.display_key.clone_from(&update.display_key);
        entry.fields.merge_from(&update.fields);
        entry.updated_at = update.timestamp;
        self.updated_at = Some(update.timestamp);
    }

    /// Show an existing entry under a new display key.
    ///
    /// Returns `false` when the instrument has no entry yet.
    pub fn rename(&mut self, key: &SubscriptionKey, display_key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                display_key.clone_into(&mut entry.display_key);
                true
            }
            None => false,
        }
    }

    /// Drop the entry for an instrument. Returns the number removed.
    pub fn remove_key(&mut self, key: &SubscriptionKey) -> usize {
        usize::from(self.entries.remove(key).is_some())
    }

    /// Entry for a display key.
    #[must_use]
    pub fn get(&self, display_key: &str) -> Option<&SnapshotEntry> {
        self.entries
            .values()
            .find(|entry| entry.display_key == display_key)
    }

    /// Entry for an instrument.
    #[must_use]
    pub fn get_key(&self, key: &SubscriptionKey) -> Option<&SnapshotEntry> {
        self.entries.get(key)
    }

    /// All entries, ordered by instrument.
    pub fn entries(&self) -> impl Iterator<Item = &SnapshotEntry> {
        self.entries.values()
    }

    /// Display keys in instrument order.
    #[must_use]
    pub fn display_keys(&self) -> Vec<&str> {
        self.entries
            .values()
            .map(|entry| entry.display_key.as_str())
            .collect()
    }

    /// Time of the last merge.
    #[must_use]
    pub const fn updated_at(&self) -> Option<i64> {
        self.updated_at
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct EntriesByDisplayKey<'a>(&'a BTreeMap<SubscriptionKey, SnapshotEntry>);

impl Serialize for EntriesByDisplayKey<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for entry in self.0.values() {
            map.serialize_entry(&entry.display_key, entry)?;
        }
        map.end()
    }
}

impl Serialize for MarketSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("entries", &EntriesByDisplayKey(&self.entries))?;
        map.serialize_entry("updatedAt", &self.updated_at)?;
        map.end()
    }
}

// =============================================================================
// Tests
// =============================================================================
