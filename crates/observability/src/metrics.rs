//! Metrics recorder setup.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the scrape handle.
///
/// Returns `None` if a recorder is already installed (e.g. a second call,
/// or a test harness that set its own); counters still work in that case.
pub fn install_prometheus() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}
