//! Error types for telemetry setup.

use thiserror::Error;

/// Errors raised while installing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A tracing subscriber could not be installed.
    #[error("failed to install tracing subscriber: {reason}")]
    Subscriber {
        /// Underlying failure.
        reason: String,
    },
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {reason}")]
    Recorder {
        /// Underlying failure.
        reason: String,
    },
    /// An unknown log format was requested.
    #[error("unknown log format: {0}")]
    UnknownFormat(String),
}

/// Result alias for telemetry setup.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
