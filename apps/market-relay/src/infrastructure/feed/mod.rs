//! Upstream Feed Adapter
//!
//! The single WebSocket connection to the quote source:
//!
//! - **codec**: binary tick decoder (header big-endian, LTP little-endian)
//! - **messages**: JSON subscribe/unsubscribe control frames
//! - **connector**: connection state machine, heartbeat and reconnect
//! - **auth**: handshake credentials

pub mod auth;
pub mod codec;
pub mod connector;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;
pub mod state;

pub use auth::{AuthError, FeedCredentials};
pub use codec::{DecodeError, Frame, TickDecoder};
pub use connector::{FeedConnectorConfig, FeedError, FeedEvent, UpstreamFeedConnector};
pub use heartbeat::HeartbeatConfig;
pub use messages::{ControlAction, ControlFrame};
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use state::{ConnectionState, FeedState, FeedStatus};
