//! Upstream Feed Authentication
//!
//! The upstream authenticates the WebSocket upgrade itself: credentials are
//! sent as request headers on the handshake and a rejected login comes back
//! as a non-101 HTTP status. There is no in-band login message.
//!
//! # Handshake Headers
//!
//! - `Authorization: Bearer <auth token>`
//! - `x-api-key`
//! - `x-client-code`
//! - `x-feed-token`

use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur while preparing or performing authentication.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// A required credential is empty.
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    /// A credential cannot be carried in an HTTP header.
    #[error("credential {0} contains characters not allowed in a header")]
    InvalidHeader(&'static str),

    /// The feed URL is not a valid WebSocket URL.
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),

    /// The upstream rejected the credentials.
    #[error("upstream rejected credentials with status {0}")]
    Rejected(u16),
}

// =============================================================================
// Credentials
// =============================================================================

/// Upstream feed credentials.
#[derive(Clone)]
pub struct FeedCredentials {
    api_key: String,
    client_code: String,
    feed_token: String,
    auth_token: String,
}

impl FeedCredentials {
    /// Create credentials, rejecting blank values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first empty credential.
    pub fn new(
        api_key: impl Into<String>,
        client_code: impl Into<String>,
        feed_token: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let credentials = Self {
            api_key: api_key.into(),
            client_code: client_code.into(),
            feed_token: feed_token.into(),
            auth_token: auth_token.into(),
        };

        for (name, value) in credentials.fields() {
            if value.trim().is_empty() {
                return Err(AuthError::MissingCredential(name));
            }
        }

        Ok(credentials)
    }

    /// Client code, the only credential safe to log.
    #[must_use]
    pub fn client_code(&self) -> &str {
        &self.client_code
    }

    fn fields(&self) -> [(&'static str, &str); 4] {
        [
            ("api_key", &self.api_key),
            ("client_code", &self.client_code),
            ("feed_token", &self.feed_token),
            ("auth_token", &self.auth_token),
        ]
    }

    /// Build the authenticated WebSocket upgrade request.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or a credential cannot be
    /// encoded as a header value.
    pub fn handshake_request(&self, url: &str) -> Result<Request, AuthError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| AuthError::InvalidUrl(e.to_string()))?;

        let bearer = format!("Bearer {}", self.auth_token);
        let headers = [
            ("authorization", "auth_token", bearer.as_str()),
            ("x-api-key", "api_key", self.api_key.as_str()),
            ("x-client-code", "client_code", self.client_code.as_str()),
            ("x-feed-token", "feed_token", self.feed_token.as_str()),
        ];

        for (header, credential, value) in headers {
            let value =
                HeaderValue::from_str(value).map_err(|_| AuthError::InvalidHeader(credential))?;
            request.headers_mut().insert(header, value);
        }

        Ok(request)
    }
}

impl std::fmt::Debug for FeedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedCredentials")
            .field("api_key", &"[REDACTED]")
            .field("client_code", &self.client_code)
            .field("feed_token", &"[REDACTED]")
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Map a failed handshake to an authentication rejection, if it was one.
#[must_use]
pub fn rejection_status(error: &tokio_tungstenite::tungstenite::Error) -> Option<u16> {
    match error {
        tokio_tungstenite::tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Some(response.status().as_u16())
        }
        _ => None,
    }
}
