//! Observability for the gateway: request metrics, tracing and health.

#![warn(missing_docs, clippy::pedantic)]

pub mod collector;
mod error;
pub mod health;
pub mod prometheus;
pub mod tracing_support;

pub use collector::{
    CollectorConfig, LatencySummary, MetricsCollector, MetricsSample, MetricsSnapshot, Outcome,
    percentile,
};
pub use error::{TelemetryError, TelemetryResult};
pub use health::{ComponentHealth, HealthReport};
pub use prometheus::{PrometheusHandle, install_prometheus};
pub use tracing_support::{LogFormat, init_tracing};
