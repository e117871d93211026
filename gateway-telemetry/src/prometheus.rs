//! Prometheus exposition for the `metrics` facade.

use metrics_exporter_prometheus::PrometheusBuilder;
pub use metrics_exporter_prometheus::PrometheusHandle;

use crate::error::{TelemetryError, TelemetryResult};

/// Installs the global Prometheus recorder and returns its render handle.
///
/// # Errors
///
/// Returns [`TelemetryError::Recorder`] when a recorder is already installed.
pub fn install_prometheus() -> TelemetryResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::Recorder {
            reason: e.to_string(),
        })
}
