//! Tick Pipeline
//!
//! The one internal consumer chain behind the connector: decoded ticks in,
//! enriched ticks out to the broadcaster.
//!
//! Enrichment never waits on the instrument master, so ticks leave in
//! arrival order and a slow lookup holds back no key, its own included.

use std::sync::Arc;

use futures::{StreamExt, future};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::enricher::TickEnricher;
use crate::domain::market::Tick;
use crate::infrastructure::broadcast::Broadcaster;

/// Enrich every tick from `ticks` and hand it to the broadcaster.
///
/// Runs until the tick channel closes or `cancel` fires.
pub async fn run_tick_pipeline(
    ticks: mpsc::Receiver<Tick>,
    enricher: Arc<TickEnricher>,
    broadcaster: Arc<Broadcaster>,
    cancel: CancellationToken,
) {
    tracing::info!("Tick pipeline started");

    let pipeline = ReceiverStream::new(ticks).for_each(|tick| {
        if broadcaster.send(enricher.enrich(tick)).is_none() {
            tracing::trace!("No consumers connected, tick discarded");
        }
        future::ready(())
    });

    tokio::select! {
        () = cancel.cancelled() => {
            tracing::info!("Tick pipeline cancelled");
        }
        () = pipeline => {
            tracing::info!("Tick channel closed, pipeline stopped");
        }
    }
}
