//! Market Data Types
//!
//! Core domain types for the relay: subscription keys, decoded ticks and
//! their enriched form, and instrument-master records. These types are
//! codec-agnostic and represent the canonical internal representation of
//! market data.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Exchange Type
// =============================================================================

/// Exchange segment, as carried by the upstream wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExchangeType {
    /// NSE cash market.
    Nse,
    /// NSE futures and options.
    Nfo,
    /// BSE cash market.
    Bse,
    /// BSE futures and options.
    Bfo,
    /// Multi Commodity Exchange.
    Mcx,
    /// National Commodity and Derivatives Exchange.
    Ncdex,
    /// Currency derivatives.
    Cds,
}

impl ExchangeType {
    /// Map a wire exchange code to an exchange.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Nse),
            2 => Some(Self::Nfo),
            3 => Some(Self::Bse),
            4 => Some(Self::Bfo),
            5 => Some(Self::Mcx),
            7 => Some(Self::Ncdex),
            13 => Some(Self::Cds),
            _ => None,
        }
    }

    /// Wire exchange code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Nse => 1,
            Self::Nfo => 2,
            Self::Bse => 3,
            Self::Bfo => 4,
            Self::Mcx => 5,
            Self::Ncdex => 7,
            Self::Cds => 13,
        }
    }

    /// Upper-case exchange name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nse => "NSE",
            Self::Nfo => "NFO",
            Self::Bse => "BSE",
            Self::Bfo => "BFO",
            Self::Mcx => "MCX",
            Self::Ncdex => "NCDEX",
            Self::Cds => "CDS",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an exchange name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown exchange: {0}")]
pub struct UnknownExchange(pub String);

impl FromStr for ExchangeType {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "NSE" => Ok(Self::Nse),
            "NFO" => Ok(Self::Nfo),
            "BSE" => Ok(Self::Bse),
            "BFO" => Ok(Self::Bfo),
            "MCX" => Ok(Self::Mcx),
            "NCDEX" => Ok(Self::Ncdex),
            "CDS" => Ok(Self::Cds),
            other => Err(UnknownExchange(other.to_string())),
        }
    }
}

// =============================================================================
// Feed Mode
// =============================================================================

/// Upstream streaming mode, ordered by richness.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeedMode {
    /// Last traded price only.
    #[default]
    Ltp,
    /// Quote-level fields.
    Quote,
    /// Full mode including depth.
    Full,
}

impl FeedMode {
    /// Map a wire mode byte to a mode.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Ltp),
            2 => Some(Self::Quote),
            3 => Some(Self::Full),
            _ => None,
        }
    }

    /// Wire mode byte.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Ltp => 1,
            Self::Quote => 2,
            Self::Full => 3,
        }
    }

    /// Lower-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ltp => "ltp",
            Self::Quote => "quote",
            Self::Full => "full",
        }
    }

    /// Parse a mode from a client-supplied name or number ("ltp", "QUOTE", "3").
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "LTP" | "1" => Some(Self::Ltp),
            "QUOTE" | "2" => Some(Self::Quote),
            "FULL" | "3" => Some(Self::Full),
            _ => None,
        }
    }
}

// =============================================================================
// Subscription Key
// =============================================================================

/// Identity of one instrument feed: exchange plus token.
///
/// Tokens are kept in their canonical string form so the binary path
/// (numeric token) and the request/poll paths (string token) agree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    /// Exchange segment.
    pub exchange: ExchangeType,
    /// Instrument token.
    pub token: String,
}

impl SubscriptionKey {
    /// Create a key, trimming whitespace from the token.
    #[must_use]
    pub fn new(exchange: ExchangeType, token: impl AsRef<str>) -> Self {
        Self {
            exchange,
            token: token.as_ref().trim().to_string(),
        }
    }

    /// Placeholder display name used when no identity can be resolved.
    #[must_use]
    pub fn placeholder_symbol(&self) -> String {
        format!("Token_{}", self.token)
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.token)
    }
}

// =============================================================================
// Depth
// =============================================================================

/// One price level of market depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Price at this level.
    pub price: Decimal,
    /// Total quantity at this level.
    #[serde(default)]
    pub quantity: u64,
    /// Number of orders at this level.
    #[serde(default)]
    pub orders: u32,
}

/// Order book depth, best levels first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDepth {
    /// Bid levels.
    #[serde(default)]
    pub buy: Vec<DepthLevel>,
    /// Ask levels.
    #[serde(default)]
    pub sell: Vec<DepthLevel>,
}

// =============================================================================
// Tick
// =============================================================================

/// One decoded market update for one instrument.
///
/// Every optional field is independently nullable. When `ohlc_estimated`
/// is set the open/high/low/close values were synthesized from the LTP and
/// are not exchange-sourced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    /// Instrument identity.
    pub key: SubscriptionKey,
    /// Mode the frame was sent in.
    pub mode: FeedMode,
    /// Upstream sequence number.
    pub sequence: u64,
    /// Exchange timestamp in epoch milliseconds.
    pub exchange_timestamp: u64,
    /// Last traded price.
    pub ltp: Decimal,
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
    /// Percent change from close.
    pub percent_change: Option<Decimal>,
    /// Net change from close.
    pub net_change: Option<Decimal>,
    /// Market depth.
    pub depth: Option<MarketDepth>,
    /// OHLC values are LTP-derived estimates.
    #[serde(default)]
    pub ohlc_estimated: bool,
}

impl Tick {
    /// Create a tick carrying only the required fields.
    #[must_use]
    pub const fn new(
        key: SubscriptionKey,
        mode: FeedMode,
        sequence: u64,
        exchange_timestamp: u64,
        ltp: Decimal,
    ) -> Self {
        Self {
            key,
            mode,
            sequence,
            exchange_timestamp,
            ltp,
            low: None,
            high: None,
            open: None,
            close: None,
            avg_price: None,
            volume: None,
            open_interest: None,
            percent_change: None,
            net_change: None,
            depth: None,
            ohlc_estimated: false,
        }
    }
}

// =============================================================================
// Enriched Tick
// =============================================================================

/// A tick with its resolved display identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedTick {
    /// The decoded tick.
    #[serde(flatten)]
    pub tick: Tick,
    /// Display symbol (alias, canonical symbol or placeholder).
    pub symbol: String,
    /// Display name.
    pub name: String,
    /// Contract lot size.
    pub lot_size: u32,
}

impl EnrichedTick {
    /// Instrument identity of the underlying tick.
    #[must_use]
    pub const fn key(&self) -> &SubscriptionKey {
        &self.tick.key
    }
}

// =============================================================================
// Symbol Record
// =============================================================================

/// Instrument-master entry for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    /// Instrument token.
    pub token: String,
    /// Exchange segment.
    pub exchange: ExchangeType,
    /// Canonical trading symbol.
    pub symbol: String,
    /// Instrument name.
    pub name: String,
    /// Contract lot size.
    pub lot_size: u32,
}

// =============================================================================
// Tests
// =============================================================================
