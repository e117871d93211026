//! HTTP surface of the policy gateway.
//!
//! Every policy route is scoped by the `X-Tenant-ID` header; `X-User-ID`
//! names the actor recorded in version history. Failures answer with the
//! `{ "error": { "code", "message", "details" } }` envelope.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod extract;
pub mod policies;
pub mod process;

use std::future::Future;

use axum::Router;
use axum::routing::{get, post};
use gateway_kernel::GatewayContext;
use gateway_telemetry::PrometheusHandle;
use tokio::net::TcpListener;

pub use error::{ApiError, ApiResult};
pub use extract::{Caller, DEFAULT_ACTOR, TENANT_HEADER, USER_HEADER};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    context: GatewayContext,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// Wraps a built context.
    #[must_use]
    pub fn new(context: GatewayContext) -> Self {
        Self {
            context,
            prometheus: None,
        }
    }

    /// Serves the Prometheus exposition at `/metrics/prometheus`.
    #[must_use]
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }

    /// Gateway services.
    #[must_use]
    pub fn context(&self) -> &GatewayContext {
        &self.context
    }

    fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("context", &self.context)
            .field("prometheus", &self.prometheus.is_some())
            .finish()
    }
}

/// Builds the router over the shared state.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/policies", get(policies::list).post(policies::create))
        .route("/api/v1/policies/import", post(policies::import))
        .route("/api/v1/policies/export", get(policies::export))
        .route(
            "/api/v1/policies/{id}",
            get(policies::fetch).put(policies::update).delete(policies::remove),
        )
        .route("/api/v1/policies/{id}/test", post(policies::test))
        .route("/api/v1/policies/{id}/versions", get(policies::versions))
        .route("/api/v1/process", post(process::process))
        .route("/health", get(process::health))
        .route("/metrics", get(process::metrics))
        .route("/metrics/prometheus", get(process::prometheus))
        .with_state(state)
}

/// Serves the router until `shutdown` resolves.
///
/// # Errors
///
/// Propagates I/O errors from the listener.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
