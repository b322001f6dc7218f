//! Full-Quote HTTP Client
//!
//! Implements [`QuoteSource`] against the quote service's batch endpoint.
//!
//! ```text
//! POST {base}/market/quote
//! {"tokens": [{"exchange": "NSE", "token": "26000"}]}
//!
//! {"success": true, "data": [{"exchange": "NSE", "token": "26000", "ltp": 21000.5, ...}]}
//! ```
//!
//! Numeric fields may arrive as JSON numbers or strings. A field that is
//! missing, null or unparseable is absent in the resulting row, so it can
//! never overwrite a snapshot value.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::ports::{FullQuote, QuoteError, QuoteSource};
use crate::domain::market::{ExchangeType, MarketDepth, SubscriptionKey};
use crate::domain::snapshot::QuoteFields;

/// Request timeout for one batch query.
pub const DEFAULT_QUOTE_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct QuoteRequest<'a> {
    tokens: Vec<QuoteToken<'a>>,
}

#[derive(Debug, Serialize)]
struct QuoteToken<'a> {
    exchange: &'static str,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<QuoteRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteRow {
    exchange: Option<String>,
    token: Option<Value>,
    symbol: Option<String>,
    ltp: Option<Value>,
    low: Option<Value>,
    high: Option<Value>,
    open: Option<Value>,
    close: Option<Value>,
    atp: Option<Value>,
    volume: Option<Value>,
    oi: Option<Value>,
    percent_change: Option<Value>,
    net_change: Option<Value>,
    depth: Option<Value>,
}

impl QuoteRow {
    fn into_quote(self) -> Option<FullQuote> {
        let exchange: ExchangeType = self.exchange.as_deref()?.parse().ok()?;
        let token = match self.token? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        if token.is_empty() {
            return None;
        }

        let fields = QuoteFields {
            ltp: decimal(self.ltp.as_ref()),
            low: decimal(self.low.as_ref()),
            high: decimal(self.high.as_ref()),
            open: decimal(self.open.as_ref()),
            close: decimal(self.close.as_ref()),
            avg_price: decimal(self.atp.as_ref()),
            volume: count(self.volume.as_ref()),
            open_interest: count(self.oi.as_ref()),
            percent_change: decimal(self.percent_change.as_ref()),
            net_change: decimal(self.net_change.as_ref()),
            depth: self
                .depth
                .and_then(|d| serde_json::from_value::<MarketDepth>(d).ok()),
        };

        Some(FullQuote {
            key: SubscriptionKey::new(exchange, token),
            symbol: self.symbol.filter(|s| !s.trim().is_empty()),
            fields,
        })
    }
}

fn decimal(value: Option<&Value>) -> Option<Decimal> {
    match value? {
        Value::Number(n) => n.to_string().parse().ok(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn count(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Client
// =============================================================================

/// Full-quote client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpQuoteSource {
    client: Client,
    endpoint: String,
}

impl HttpQuoteSource {
    /// Create a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, QuoteError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| QuoteError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/market/quote", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteSource {
    async fn full_quotes(&self, keys: &[SubscriptionKey]) -> Result<Vec<FullQuote>, QuoteError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let body = QuoteRequest {
            tokens: keys
                .iter()
                .map(|key| QuoteToken {
                    exchange: key.exchange.as_str(),
                    token: &key.token,
                })
                .collect(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| QuoteError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QuoteError::Status(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| QuoteError::Transport(e.to_string()))?;
        let parsed: QuoteResponse =
            serde_json::from_str(&text).map_err(|e| QuoteError::InvalidResponse(e.to_string()))?;

        if !parsed.success {
            return Err(QuoteError::Unsuccessful);
        }

        let total = parsed.data.len();
        let quotes: Vec<FullQuote> = parsed
            .data
            .into_iter()
            .filter_map(QuoteRow::into_quote)
            .collect();

        if quotes.len() < total {
            tracing::debug!(
                skipped = total - quotes.len(),
                "Quote rows without a usable exchange or token skipped"
            );
        }

        Ok(quotes)
    }
}

// =============================================================================
// Tests
// =============================================================================
