//! Prometheus Metrics Module
//!
//! Exposes relay metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: upstream frames received, decoded and rejected
//! - **Delivery**: ticks broadcast and ticks dropped
//! - **Subscriptions**: upstream key count, consumer sessions, control frames
//! - **Collaborators**: enrichment fallbacks and quote poll failures
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if another global recorder was already installed.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "relay_frames_received_total",
        "Total frames received from the upstream feed"
    );
    describe_counter!(
        "relay_ticks_decoded_total",
        "Total ticks decoded from binary frames"
    );
    describe_counter!(
        "relay_decode_failures_total",
        "Total frames rejected by the decoder"
    );
    describe_counter!(
        "relay_ticks_broadcast_total",
        "Total enriched ticks handed to the broadcaster"
    );
    describe_counter!(
        "relay_ticks_dropped_total",
        "Total ticks dropped before reaching a consumer"
    );
    describe_counter!(
        "relay_control_frames_sent_total",
        "Total subscribe/unsubscribe control frames sent upstream"
    );
    describe_counter!(
        "relay_reconnects_total",
        "Total upstream reconnection attempts"
    );
    describe_counter!(
        "relay_resyncs_total",
        "Total full desired-set resynchronizations"
    );
    describe_counter!(
        "relay_enrichment_fallbacks_total",
        "Total ticks enriched with a placeholder identity"
    );
    describe_counter!(
        "relay_quote_poll_failures_total",
        "Total failed full-quote polls"
    );

    describe_gauge!(
        "relay_upstream_subscriptions",
        "Number of keys in the global desired set"
    );
    describe_gauge!(
        "relay_consumer_sessions",
        "Number of connected consumer sessions"
    );

    describe_histogram!(
        "relay_enrichment_seconds",
        "Time to resolve a tick's display identity"
    );
}

// =============================================================================
// Metric Labels
// =============================================================================

/// Reasons a tick never reaches a consumer.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// The connector's tick channel was full.
    TickChannelFull,
    /// A consumer fell behind the broadcast channel.
    LaggingConsumer,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::TickChannelFull => "tick_channel_full",
            Self::LaggingConsumer => "lagging_consumer",
        }
    }
}

/// Reasons enrichment fell back to a placeholder.
#[derive(Debug, Clone, Copy)]
pub enum FallbackReason {
    /// Lookup exceeded its timeout.
    Timeout,
    /// Lookup failed.
    Error,
    /// Lookup found no instrument.
    Unknown,
}

impl FallbackReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a frame received from the upstream feed.
pub fn record_frame_received(kind: &'static str) {
    counter!("relay_frames_received_total", "kind" => kind).increment(1);
}

/// Record a decoded tick.
pub fn record_tick_decoded(mode: &'static str) {
    counter!("relay_ticks_decoded_total", "mode" => mode).increment(1);
}

/// Record a rejected frame.
pub fn record_decode_failure(reason: &'static str) {
    counter!("relay_decode_failures_total", "reason" => reason).increment(1);
}

/// Record ticks handed to the broadcaster.
pub fn record_ticks_broadcast(count: u64) {
    counter!("relay_ticks_broadcast_total").increment(count);
}

/// Record dropped ticks.
pub fn record_ticks_dropped(reason: DropReason, count: u64) {
    counter!("relay_ticks_dropped_total", "reason" => reason.as_str()).increment(count);
}

/// Record a control frame sent upstream.
pub fn record_control_frame(action: &'static str) {
    counter!("relay_control_frames_sent_total", "action" => action).increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("relay_reconnects_total").increment(1);
}

/// Record a full desired-set resync.
pub fn record_resync() {
    counter!("relay_resyncs_total").increment(1);
}

/// Record an enrichment fallback.
pub fn record_enrichment_fallback(reason: FallbackReason) {
    counter!("relay_enrichment_fallbacks_total", "reason" => reason.as_str()).increment(1);
}

/// Record a failed full-quote poll.
pub fn record_quote_poll_failure() {
    counter!("relay_quote_poll_failures_total").increment(1);
}

/// Update the desired-set size.
#[allow(clippy::cast_precision_loss)]
pub fn set_upstream_subscriptions(count: usize) {
    gauge!("relay_upstream_subscriptions").set(count as f64);
}

/// Update the consumer session count.
#[allow(clippy::cast_precision_loss)]
pub fn set_consumer_sessions(count: usize) {
    gauge!("relay_consumer_sessions").set(count as f64);
}

/// Record enrichment latency.
pub fn record_enrichment_duration(duration: Duration) {
    histogram!("relay_enrichment_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
