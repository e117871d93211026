//! HTTP contract of the gateway, exercised through the router without a socket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode};
use gateway_api::{AppState, TENANT_HEADER, USER_HEADER, router};
use gateway_audit::{AuditDecision, MemoryAuditStore};
use gateway_config::GatewayConfig;
use gateway_kernel::{
    CollaboratorError, GatewayContext, ProviderMetadata, ProviderResponse, ProviderRouter,
};
use gateway_policy::PolicyRequest;
use serde_json::{Value, json};
use tower::ServiceExt;

struct EchoRouter;

#[async_trait]
impl ProviderRouter for EchoRouter {
    async fn route(&self, request: &PolicyRequest) -> Result<ProviderResponse, CollaboratorError> {
        Ok(ProviderResponse {
            content: format!("echo: {}", request.query()),
            metadata: ProviderMetadata {
                provider: "echo".into(),
                model: "echo-1".into(),
                tokens_used: 12,
                ..ProviderMetadata::default()
            },
        })
    }
}

struct TestApp {
    app: Router,
    context: GatewayContext,
    audit: MemoryAuditStore,
    worker: tokio::task::JoinHandle<()>,
}

impl TestApp {
    async fn start() -> Self {
        let audit = MemoryAuditStore::new();
        let (context, worker) = GatewayContext::builder(GatewayConfig::default())
            .with_audit_store(Arc::new(audit.clone()))
            .with_router(Arc::new(EchoRouter))
            .build()
            .await
            .expect("context builds");
        let worker = worker.spawn();
        let app = router(AppState::new(context.clone()));
        Self {
            app,
            context,
            audit,
            worker,
        }
    }

    async fn send(&self, method: Method, uri: &str, tenant: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri).header(USER_HEADER, "alice");
        if let Some(tenant) = tenant {
            builder = builder.header(TENANT_HEADER, tenant);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        self.raw(builder.body(body).expect("request builds")).await
    }

    async fn raw(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.expect("router responds");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body reads");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, value)
    }

    async fn drain(self) -> Vec<gateway_audit::AuditEntry> {
        self.context.shutdown();
        self.worker.await.expect("worker exits");
        self.audit.entries().await
    }
}

fn password_policy() -> Value {
    json!({
        "name": "block-passwords",
        "type": "content",
        "priority": 100,
        "conditions": [{ "field": "query", "operator": "contains", "value": "password" }],
        "actions": [{ "type": "block", "config": { "message": "credentials are not allowed" } }]
    })
}

#[tokio::test]
async fn missing_tenant_is_unauthorized() {
    let app = TestApp::start().await;
    let (status, body) = app.send(Method::GET, "/api/v1/policies", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn created_policy_is_listed_and_fetched() {
    let app = TestApp::start().await;
    let (status, created) = app
        .send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["policy"]["version"], 1);
    assert_eq!(created["policy"]["created_by"], "alice");
    let id = created["policy"]["id"].as_str().expect("id").to_owned();

    let (status, fetched) = app
        .send(Method::GET, &format!("/api/v1/policies/{id}"), Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["policy"]["name"], "block-passwords");

    let (status, listing) = app
        .send(Method::GET, "/api/v1/policies?type=content&page_size=5", Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing["policies"].as_array().map(Vec::len), Some(1));

    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/policies/{id}"), Some("globex"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_policy_is_not_found() {
    let app = TestApp::start().await;
    let (status, body) = app
        .send(Method::GET, "/api/v1/policies/does-not-exist", Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_body_is_invalid_json() {
    let app = TestApp::start().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/policies")
        .header(TENANT_HEADER, "acme")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .expect("request builds");
    let (status, body) = app.raw(request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_JSON");
}

#[tokio::test]
async fn invalid_policy_reports_validation_error() {
    let app = TestApp::start().await;
    let mut draft = password_policy();
    draft["conditions"][0]["operator"] = json!("resembles");
    let (status, body) = app
        .send(Method::POST, "/api/v1/policies", Some("acme"), Some(draft))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn update_bumps_version_and_history() {
    let app = TestApp::start().await;
    let (_, created) = app
        .send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;
    let id = created["policy"]["id"].as_str().expect("id").to_owned();

    let (status, updated) = app
        .send(
            Method::PUT,
            &format!("/api/v1/policies/{id}"),
            Some("acme"),
            Some(json!({ "priority": 10 })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["policy"]["version"], 2);

    let (status, history) = app
        .send(Method::GET, &format!("/api/v1/policies/{id}/versions"), Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["versions"].as_array().map(Vec::len), Some(2));
    assert_eq!(history["versions"][0]["version"], 2);
}

#[tokio::test]
async fn dry_run_reports_block() {
    let app = TestApp::start().await;
    let (_, created) = app
        .send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;
    let id = created["policy"]["id"].as_str().expect("id").to_owned();

    let (status, result) = app
        .send(
            Method::POST,
            &format!("/api/v1/policies/{id}/test"),
            Some("acme"),
            Some(json!({ "query": "what is the admin password?" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["matched"], true);
    assert_eq!(result["blocked"], true);
    assert_eq!(result["block_message"], "credentials are not allowed");
}

#[tokio::test]
async fn delete_removes_policy() {
    let app = TestApp::start().await;
    let (_, created) = app
        .send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;
    let id = created["policy"]["id"].as_str().expect("id").to_owned();

    let (status, _) = app
        .send(Method::DELETE, &format!("/api/v1/policies/{id}"), Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = app
        .send(Method::GET, &format!("/api/v1/policies/{id}"), Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn blocked_request_is_forbidden_and_audited() {
    let app = TestApp::start().await;
    app.send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;

    let (status, outcome) = app
        .send(
            Method::POST,
            "/api/v1/process",
            Some("acme"),
            Some(json!({ "query": "share the root password" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(outcome["status"], "blocked");
    assert_eq!(outcome["reason"], "credentials are not allowed");

    let entries = app.drain().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision(), AuditDecision::Blocked);
    assert_eq!(entries[0].tenant_id().as_str(), "acme");
}

#[tokio::test]
async fn allowed_request_is_served() {
    let app = TestApp::start().await;
    let (status, outcome) = app
        .send(
            Method::POST,
            "/api/v1/process",
            Some("acme"),
            Some(json!({ "query": "summarise the quarterly report" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["status"], "served");
    assert_eq!(outcome["content"], "echo: summarise the quarterly report");
    assert_eq!(outcome["provider"]["provider"], "echo");

    let entries = app.drain().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision(), AuditDecision::Allowed);
}

#[tokio::test]
async fn empty_query_is_rejected() {
    let app = TestApp::start().await;
    let (status, body) = app
        .send(Method::POST, "/api/v1/process", Some("acme"), Some(json!({ "query": "  " })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn export_then_import_skips_existing() {
    let app = TestApp::start().await;
    app.send(Method::POST, "/api/v1/policies", Some("acme"), Some(password_policy()))
        .await;

    let (status, export) = app
        .send(Method::GET, "/api/v1/policies/export", Some("acme"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(export["tenant_id"], "acme");

    let (status, report) = app
        .send(
            Method::POST,
            "/api/v1/policies/import",
            Some("acme"),
            Some(json!({ "policies": [password_policy()] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["skipped"], 1);
    assert_eq!(report["created"], 0);
}

#[tokio::test]
async fn health_and_metrics_report() {
    let app = TestApp::start().await;
    let (status, health) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    let (status, _) = app.send(Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.send(Method::GET, "/metrics/prometheus", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}
