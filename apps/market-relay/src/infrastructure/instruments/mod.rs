//! Instrument-Master HTTP Client
//!
//! Implements [`InstrumentLookup`] with one GET per (token, exchange):
//!
//! ```text
//! GET {base}/instruments/by-token?token=2885&exchange=NSE
//! 200 {"symbol": "RELIANCE-EQ", "name": "RELIANCE", "lot_size": 1}
//! 404 or 200 null -> unknown instrument
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;

use crate::application::ports::{InstrumentLookup, LookupError};
use crate::domain::market::{ExchangeType, SymbolRecord};

#[derive(Debug, Deserialize)]
struct SymbolResponse {
    symbol: Option<String>,
    name: Option<String>,
    #[serde(alias = "lotSize", alias = "lotsize")]
    lot_size: Option<Value>,
}

impl SymbolResponse {
    fn into_record(self, token: &str, exchange: ExchangeType) -> Option<SymbolRecord> {
        let symbol = self.symbol.filter(|s| !s.trim().is_empty())?;
        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| symbol.clone());
        let lot_size = match self.lot_size {
            Some(Value::Number(n)) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        }
        .filter(|lot| *lot > 0)
        .unwrap_or(1);

        Some(SymbolRecord {
            token: token.to_string(),
            exchange,
            symbol,
            name,
            lot_size,
        })
    }
}

/// Instrument-master client over HTTP.
#[derive(Debug, Clone)]
pub struct HttpInstrumentLookup {
    client: Client,
    endpoint: String,
}

impl HttpInstrumentLookup {
    /// Create a client for the service at `base_url`.
    ///
    /// The enricher bounds each lookup with its own timeout; `timeout` here
    /// only caps connections the enricher has already given up on.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/instruments/by-token", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl InstrumentLookup for HttpInstrumentLookup {
    async fn symbol_by_token(
        &self,
        token: &str,
        exchange: ExchangeType,
    ) -> Result<Option<SymbolRecord>, LookupError> {
        let url = Url::parse_with_params(
            &self.endpoint,
            &[("token", token), ("exchange", exchange.as_str())],
        )
        .map_err(|e| LookupError::Transport(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(LookupError::Status(status.as_u16()));
        }

        let text = response
            .text()
            .await
            .map_err(|e| LookupError::Transport(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }

        let parsed: Option<SymbolResponse> =
            serde_json::from_str(&text).map_err(|e| LookupError::InvalidResponse(e.to_string()))?;

        Ok(parsed.and_then(|r| r.into_record(token, exchange)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode as HttpStatus;
    use axum::response::IntoResponse;
    use axum::{Json, Router, routing::get};
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn by_token(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
        match (params.get("token").map(String::as_str), params.get("exchange").map(String::as_str)) {
            (Some("2885"), Some("NSE")) => (
                HttpStatus::OK,
                Json(serde_json::json!({"symbol": "RELIANCE-EQ", "name": "RELIANCE", "lot_size": "1"})),
            )
                .into_response(),
            (Some("500"), _) => HttpStatus::INTERNAL_SERVER_ERROR.into_response(),
            (Some("null"), _) => (HttpStatus::OK, Json(Value::Null)).into_response(),
            _ => HttpStatus::NOT_FOUND.into_response(),
        }
    }

    async fn serve() -> HttpInstrumentLookup {
        let app = Router::new().route("/instruments/by-token", get(by_token));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        HttpInstrumentLookup::new(&format!("http://{addr}/"), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn found_record() {
        let lookup = serve().await;

        let record = lookup
            .symbol_by_token("2885", ExchangeType::Nse)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(record.symbol, "RELIANCE-EQ");
        assert_eq!(record.name, "RELIANCE");
        assert_eq!(record.lot_size, 1);
        assert_eq!(record.exchange, ExchangeType::Nse);
    }

    #[tokio::test]
    async fn unknown_token_is_none() {
        let lookup = serve().await;

        assert!(lookup.symbol_by_token("1", ExchangeType::Nse).await.unwrap().is_none());
        assert!(lookup.symbol_by_token("null", ExchangeType::Nse).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_error_is_status() {
        let lookup = serve().await;

        assert!(matches!(
            lookup.symbol_by_token("500", ExchangeType::Nse).await,
            Err(LookupError::Status(500))
        ));
    }

    #[test]
    fn record_defaults() {
        let response = SymbolResponse {
            symbol: Some("GOLD".to_string()),
            name: None,
            lot_size: Some(Value::from(0)),
        };

        let record = response.into_record("234", ExchangeType::Mcx).unwrap();
        assert_eq!(record.name, "GOLD");
        assert_eq!(record.lot_size, 1);
    }
}
