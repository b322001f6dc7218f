//! Domain Layer - Core market data types and state.
//!
//! This layer holds the relay's domain types and bookkeeping with no I/O.
//! Everything here is plain Rust with serialization support.

/// Market data types (keys, ticks, instrument records).
pub mod market;

/// Per-consumer merged market view.
pub mod snapshot;

/// Reference-counted subscription bookkeeping.
pub mod subscription;
