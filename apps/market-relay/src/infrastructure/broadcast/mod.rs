//! Broadcaster
//!
//! Fans enriched ticks out to every connected consumer over a tokio
//! broadcast channel.
//!
//! # Delivery
//!
//! Delivery is global and at-most-once. Every subscriber sees every tick
//! sent while it is subscribed, regardless of its declared interest. There
//! is no replay: a consumer that is not subscribed at send time misses the
//! tick, and one that falls more than `capacity` ticks behind skips ahead
//! and loses the overflow.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::domain::market::EnrichedTick;
use crate::infrastructure::metrics::{self, DropReason};

/// Shared tick handle; one allocation per tick regardless of fan-out.
pub type SharedTick = Arc<EnrichedTick>;

// =============================================================================
// Broadcaster
// =============================================================================

/// Configuration for the broadcast channel.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Ticks a subscriber may fall behind before losing some.
    pub capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Global fan-out of enriched ticks.
#[derive(Debug)]
pub struct Broadcaster {
    tx: broadcast::Sender<SharedTick>,
}

impl Broadcaster {
    /// Create a broadcaster.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            tx: broadcast::channel(config.capacity.max(1)).0,
        }
    }

    /// Create a broadcaster with default capacity.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Send a tick to every current subscriber.
    ///
    /// Returns the number of subscribers reached, or `None` if there are
    /// none. Ticks sent with no subscribers are simply gone.
    pub fn send(&self, tick: EnrichedTick) -> Option<usize> {
        let reached = self.tx.send(Arc::new(tick)).ok();
        if reached.is_some() {
            metrics::record_ticks_broadcast(1);
        }
        reached
    }

    /// Subscribe to ticks sent from now on.
    #[must_use]
    pub fn subscribe(&self) -> TickSubscriber {
        TickSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    /// Number of current subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Shared broadcaster reference.
pub type SharedBroadcaster = Arc<Broadcaster>;

// =============================================================================
// Subscriber
// =============================================================================

/// One consumer's view of the broadcast.
#[derive(Debug)]
pub struct TickSubscriber {
    rx: broadcast::Receiver<SharedTick>,
}

impl TickSubscriber {
    /// Wait for the next tick.
    ///
    /// Lag is logged and skipped. Returns `None` once the broadcaster is
    /// gone.
    pub async fn recv(&mut self) -> Option<SharedTick> {
        loop {
            match self.rx.recv().await {
                Ok(tick) => return Some(tick),
                Err(RecvError::Lagged(skipped)) => record_lag(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take up to `max` ticks that are already queued, without waiting.
    pub fn drain_ready(&mut self, max: usize) -> Vec<SharedTick> {
        let mut ticks = Vec::new();
        while ticks.len() < max {
            match self.rx.try_recv() {
                Ok(tick) => ticks.push(tick),
                Err(TryRecvError::Lagged(skipped)) => record_lag(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        ticks
    }
}

fn record_lag(skipped: u64) {
    tracing::warn!(skipped, "Consumer lagging, ticks dropped");
    metrics::record_ticks_dropped(DropReason::LaggingConsumer, skipped);
}

// =============================================================================
// Tests
// =============================================================================
