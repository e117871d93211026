//! Tenant-scoped policy management handlers.

use std::collections::HashMap;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use gateway_policy::service::{
    ImportRequest, PolicyExport, PolicyListResponse, TestPolicyRequest, TestPolicyResponse,
};
use gateway_policy::store::{ImportReport, ListQuery};
use gateway_policy::{Policy, PolicyDraft, PolicyVersionEntry, UpdatePolicyRequest};
use gateway_primitives::PolicyId;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiResult;
use crate::extract::{Caller, policy_id};

/// `{ "policy": ... }`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyEnvelope {
    /// The policy.
    pub policy: Policy,
}

/// History of one policy, newest first.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionsResponse {
    /// Policy the history belongs to.
    pub policy_id: PolicyId,
    /// Recorded versions.
    pub versions: Vec<PolicyVersionEntry>,
}

pub(crate) async fn list(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<PolicyListResponse>> {
    let listing = state
        .context()
        .policies()
        .list_policies(&caller.tenant, &list_query(&params))
        .await?;
    Ok(Json(listing))
}

pub(crate) async fn create(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<PolicyDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<PolicyEnvelope>)> {
    let Json(draft) = body?;
    let policy = state
        .context()
        .policies()
        .create_policy(&caller.tenant, draft, &caller.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(PolicyEnvelope { policy })))
}

pub(crate) async fn fetch(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<PolicyEnvelope>> {
    let id = policy_id(&id)?;
    let policy = state.context().policies().get_policy(&caller.tenant, &id).await?;
    Ok(Json(PolicyEnvelope { policy }))
}

pub(crate) async fn update(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<UpdatePolicyRequest>, JsonRejection>,
) -> ApiResult<Json<PolicyEnvelope>> {
    let id = policy_id(&id)?;
    let Json(patch) = body?;
    let policy = state
        .context()
        .policies()
        .update_policy(&caller.tenant, &id, patch, &caller.actor)
        .await?;
    Ok(Json(PolicyEnvelope { policy }))
}

pub(crate) async fn remove(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let id = policy_id(&id)?;
    state
        .context()
        .policies()
        .delete_policy(&caller.tenant, &id, &caller.actor)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn test(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    body: Result<Json<TestPolicyRequest>, JsonRejection>,
) -> ApiResult<Json<TestPolicyResponse>> {
    let id = policy_id(&id)?;
    let Json(synthetic) = body?;
    let result = state
        .context()
        .policies()
        .test_policy(&caller.tenant, &id, synthetic)
        .await?;
    Ok(Json(result))
}

pub(crate) async fn versions(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<VersionsResponse>> {
    let id = policy_id(&id)?;
    let versions = state.context().policies().policy_versions(&caller.tenant, &id).await?;
    Ok(Json(VersionsResponse { policy_id: id, versions }))
}

pub(crate) async fn import(
    State(state): State<AppState>,
    caller: Caller,
    body: Result<Json<ImportRequest>, JsonRejection>,
) -> ApiResult<Json<ImportReport>> {
    let Json(request) = body?;
    let report = state
        .context()
        .policies()
        .import_policies(&caller.tenant, request, &caller.actor)
        .await?;
    Ok(Json(report))
}

pub(crate) async fn export(State(state): State<AppState>, caller: Caller) -> ApiResult<Json<PolicyExport>> {
    let export = state.context().policies().export_policies(&caller.tenant).await?;
    Ok(Json(export))
}

/// Unparseable values fall back to their defaults instead of failing the request.
fn list_query(params: &HashMap<String, String>) -> ListQuery {
    ListQuery {
        policy_type: param(params, "type").and_then(|raw| raw.parse().ok()),
        enabled: param(params, "enabled").and_then(|raw| raw.parse().ok()),
        search: param(params, "search").map(str::to_owned),
        sort_by: param(params, "sort_by").map(str::to_owned),
        sort_order: param(params, "sort_order").map(str::to_owned),
        page: param(params, "page").and_then(|raw| raw.parse().ok()),
        page_size: param(params, "page_size").and_then(|raw| raw.parse().ok()),
    }
}

fn param<'a>(params: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str)
}
