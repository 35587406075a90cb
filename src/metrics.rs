//! Metric helpers for `subwire`.
//!
//! Thin wrappers over the [`metrics`](https://docs.rs/metrics) crate; all
//! helpers compile to no-ops without the `metrics` feature.

/// Name of the counter tracking established connections.
#[cfg(feature = "metrics")]
pub const CONNECTS_TOTAL: &str = "subwire_connects_total";
/// Name of the counter tracking connection losses.
#[cfg(feature = "metrics")]
pub const DISCONNECTS_TOTAL: &str = "subwire_disconnects_total";
/// Name of the counter tracking inbound frames.
#[cfg(feature = "metrics")]
pub const FRAMES_TOTAL: &str = "subwire_frames_total";
/// Name of the counter tracking published messages.
#[cfg(feature = "metrics")]
pub const PUBLISHES_TOTAL: &str = "subwire_publishes_total";
/// Name of the counter tracking protocol and server errors.
#[cfg(feature = "metrics")]
pub const ERRORS_TOTAL: &str = "subwire_errors_total";
/// Name of the counter tracking deliveries dropped by slow consumers.
#[cfg(feature = "metrics")]
pub const DROPPED_TOTAL: &str = "subwire_dropped_total";

/// Record an established connection.
pub fn record_connect() {
    #[cfg(feature = "metrics")]
    metrics::counter!(CONNECTS_TOTAL).increment(1);
}

/// Record a lost connection.
pub fn record_disconnect() {
    #[cfg(feature = "metrics")]
    metrics::counter!(DISCONNECTS_TOTAL).increment(1);
}

/// Record one inbound frame.
pub fn record_frame() {
    #[cfg(feature = "metrics")]
    metrics::counter!(FRAMES_TOTAL).increment(1);
}

/// Record one published message.
pub fn record_publish() {
    #[cfg(feature = "metrics")]
    metrics::counter!(PUBLISHES_TOTAL).increment(1);
}

/// Record a protocol or server error.
pub fn record_error() {
    #[cfg(feature = "metrics")]
    metrics::counter!(ERRORS_TOTAL).increment(1);
}

/// Record a delivery dropped on a full subscription channel.
pub fn record_dropped() {
    #[cfg(feature = "metrics")]
    metrics::counter!(DROPPED_TOTAL).increment(1);
}
