//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and the port interfaces
//! that define how they reach the upstream feed and external collaborators.

/// Port interfaces for external systems (feed control, lookups, quotes).
pub mod ports;

/// Application services: registry, enrichment, market store, tick pipeline.
pub mod services;
