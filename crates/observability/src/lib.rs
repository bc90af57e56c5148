//! Tracing, logging, metrics (shared setup) and the trace propagation
//! bridge between in-process spans and envelope extensions.

pub mod metrics;
pub mod propagation;
pub mod tracing;

pub use propagation::{ExtractedTraceContext, TracePropagator};

/// Initialize process-wide observability (tracing/logging + W3C propagator).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}
