//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Upstream WebSocket feed: decoder, control frames, connection state machine.
pub mod feed;

/// Global tick fan-out.
pub mod broadcast;

/// Downstream consumer WebSocket gateway.
pub mod gateway;

/// Full-quote HTTP client.
pub mod quotes;

/// Instrument-master HTTP client.
pub mod instruments;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
