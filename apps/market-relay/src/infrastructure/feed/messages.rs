//! Upstream Control Messages
//!
//! JSON control frames sent to the upstream feed:
//!
//! ```json
//! {"correlationID":"ab12cd34ef","action":1,
//!  "params":{"mode":1,"tokenList":[{"exchangeType":1,"tokens":["26000"]}]}}
//! ```
//!
//! `action` is 1 for subscribe and 0 for unsubscribe. Tokens are grouped by
//! exchange code, so one frame covers every exchange in a batch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::market::{ExchangeType, FeedMode, SubscriptionKey};

/// Length of the correlation id attached to every control frame.
const CORRELATION_ID_LEN: usize = 10;

/// Subscribe or unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Remove tokens from the stream.
    Unsubscribe,
    /// Add tokens to the stream.
    Subscribe,
}

impl ControlAction {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Unsubscribe => 0,
            Self::Subscribe => 1,
        }
    }

    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribe => "unsubscribe",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Tokens for one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGroup {
    /// Exchange code.
    pub exchange_type: u8,
    /// Tokens on that exchange.
    pub tokens: Vec<String>,
}

/// Control frame parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlParams {
    /// Mode code.
    pub mode: u8,
    /// Tokens grouped by exchange.
    pub token_list: Vec<TokenGroup>,
}

/// One upstream control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    /// Request correlation id.
    #[serde(rename = "correlationID")]
    pub correlation_id: String,
    /// Action code.
    pub action: u8,
    /// Parameters.
    pub params: ControlParams,
}

impl ControlFrame {
    /// Build a frame for keys in one mode, grouped by exchange code.
    #[must_use]
    pub fn new(action: ControlAction, mode: FeedMode, keys: &[SubscriptionKey]) -> Self {
        let mut grouped: BTreeMap<ExchangeType, Vec<String>> = BTreeMap::new();
        for key in keys {
            let tokens = grouped.entry(key.exchange).or_default();
            if !tokens.contains(&key.token) {
                tokens.push(key.token.clone());
            }
        }

        let token_list = grouped
            .into_iter()
            .map(|(exchange, tokens)| TokenGroup {
                exchange_type: exchange.code(),
                tokens,
            })
            .collect();

        Self {
            correlation_id: new_correlation_id(),
            action: action.code(),
            params: ControlParams {
                mode: mode.code(),
                token_list,
            },
        }
    }

    /// Encode as JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Number of tokens across all groups.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.params.token_list.iter().map(|g| g.tokens.len()).sum()
    }
}

fn new_correlation_id() -> String {
    uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(CORRELATION_ID_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_frame_groups_by_exchange() {
        let keys = [
            SubscriptionKey::new(ExchangeType::Nse, "26000"),
            SubscriptionKey::new(ExchangeType::Mcx, "234"),
            SubscriptionKey::new(ExchangeType::Nse, "2885"),
        ];

        let frame = ControlFrame::new(ControlAction::Subscribe, FeedMode::Quote, &keys);

        assert_eq!(frame.action, 1);
        assert_eq!(frame.params.mode, 2);
        assert_eq!(frame.params.token_list.len(), 2);
        assert_eq!(frame.params.token_list[0].exchange_type, 1);
        assert_eq!(frame.params.token_list[0].tokens, vec!["26000", "2885"]);
        assert_eq!(frame.params.token_list[1].exchange_type, 5);
        assert_eq!(frame.token_count(), 3);
    }

    #[test]
    fn wire_field_names() {
        let frame = ControlFrame::new(
            ControlAction::Unsubscribe,
            FeedMode::Ltp,
            &[SubscriptionKey::new(ExchangeType::Nse, "1")],
        );

        let json: serde_json::Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();

        assert_eq!(json["action"], 0);
        assert_eq!(json["correlationID"].as_str().unwrap().len(), 10);
        assert_eq!(json["params"]["tokenList"][0]["exchangeType"], 1);
        assert_eq!(json["params"]["tokenList"][0]["tokens"][0], "1");
    }

    #[test]
    fn duplicate_tokens_collapse() {
        let key = SubscriptionKey::new(ExchangeType::Nse, "1");
        let frame = ControlFrame::new(ControlAction::Subscribe, FeedMode::Ltp, &[key.clone(), key]);
        assert_eq!(frame.token_count(), 1);
    }
}
