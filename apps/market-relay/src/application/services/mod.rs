//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionRegistry`: serialized owner of the global desired set
//! - `TickEnricher`: display identity resolution
//! - `ClientMarketStore`: per-consumer push/poll reconciliation
//! - `pipeline`: decoded ticks to enriched broadcast

pub mod enricher;
pub mod market_store;
pub mod pipeline;
pub mod registry;

pub use enricher::{EnricherConfig, TickEnricher};
pub use market_store::{ClientMarketStore, MarketStoreConfig, StoreError, TokenId, TokenSpec};
pub use pipeline::run_tick_pipeline;
pub use registry::{RegistryStats, SubscriptionRegistry};
