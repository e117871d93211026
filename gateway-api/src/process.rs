//! Governed request processing and the operational endpoints.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use gateway_kernel::SchedulerError;
use gateway_policy::api::{NOT_FOUND, VALIDATION_ERROR};
use gateway_policy::{PolicyRequest, UserContext};
use gateway_telemetry::{HealthReport, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::extract::Caller;

/// Body of `POST /api/v1/process`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessRequest {
    /// Prompt or statement to govern.
    pub query: String,
    /// Request type, `llm_chat` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    /// Caller details; the `X-User-ID` header fills the id when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    /// Client application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Extra facts available to `context.*` conditions.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl ProcessRequest {
    fn into_policy_request(self, caller: Caller) -> PolicyRequest {
        let user = self.user.unwrap_or_else(|| UserContext {
            id: caller.actor,
            ..UserContext::default()
        });
        let mut request = PolicyRequest::new(caller.tenant, self.query)
            .with_user(user)
            .with_context_map(self.context);
        if let Some(kind) = self.request_type {
            request = request.with_request_type(kind);
        }
        if let Some(client) = self.client_id {
            request = request.with_client(client);
        }
        request
    }
}

/// Runs the request through the governance pipeline on its own task.
///
/// Served requests answer 200 and blocked ones 403; both carry the outcome.
pub(crate) async fn process(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ProcessRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(body) = body?;
    if body.query.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, VALIDATION_ERROR, "Query is required"));
    }

    let request = body.into_policy_request(caller);
    let pipeline = state.context().pipeline().clone();
    let handle = state
        .context()
        .scheduler()
        .spawn(async move { pipeline.process(&request).await })?;
    let outcome = handle
        .await
        .map_err(|e| ApiError::from(SchedulerError::Join(e.to_string())))???;

    let status = if outcome.is_blocked() {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)).into_response())
}

pub(crate) async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.context().health().await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

pub(crate) async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.context().metrics().snapshot())
}

pub(crate) async fn prometheus(State(state): State<AppState>) -> ApiResult<Response> {
    let handle = state.prometheus().ok_or_else(|| {
        ApiError::new(StatusCode::NOT_FOUND, NOT_FOUND, "Prometheus exporter is not installed")
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}
