//! Tracing/logging initialization.

use opentelemetry_sdk::propagation::TraceContextPropagator;
use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process and install the W3C Trace
/// Context propagator used by envelope injection/extraction.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
