//! Policy-governed LLM request gateway facade.
//!
//! Bundles the gateway crates behind feature flags so embedders can take the
//! policy engine alone or the whole server stack.

#![warn(missing_docs, clippy::pedantic)]

/// Identifiers shared by every crate.
pub use gateway_primitives as primitives;

/// Policy model, evaluation, tier gate and store (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use gateway_policy as policy;

/// Audit queue, batch writer and stores (enabled by `audit` feature).
#[cfg(feature = "audit")]
pub use gateway_audit as audit;

/// Metrics collector, tracing and health (enabled by `telemetry` feature).
#[cfg(feature = "telemetry")]
pub use gateway_telemetry as telemetry;

/// Layered configuration (enabled by `config` feature).
#[cfg(feature = "config")]
pub use gateway_config as config;

/// Governance pipeline and service wiring (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use gateway_kernel as kernel;

/// HTTP surface (enabled by `api` feature).
#[cfg(feature = "api")]
pub use gateway_api as api;
