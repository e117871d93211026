use std::sync::Arc;

use chrono::Utc;
use policy_gateway::audit::{AuditDecision, MemoryAuditStore};
use policy_gateway::config::GatewayConfig;
use policy_gateway::kernel::{GatewayContext, PipelineOutcome};
use policy_gateway::policy::api::error_response;
use policy_gateway::policy::service::TestPolicyRequest;
use policy_gateway::policy::store::{MemoryPolicyRepository, PolicyRepository};
use policy_gateway::policy::{
    Action, Condition, PolicyDraft, PolicyRequest, PolicyServiceError, PolicyTier, PolicyType,
};
use policy_gateway::primitives::TenantId;
use serde_json::json;

fn tenant() -> TenantId {
    TenantId::new("acme").unwrap()
}

fn block_password(name: &str) -> PolicyDraft {
    PolicyDraft::new(name, PolicyType::Content)
        .priority(100)
        .condition(Condition::new("query", "contains", json!("password")))
        .action(Action::new("block").with_config("message", json!("credentials are not allowed")))
}

fn code(err: &PolicyServiceError) -> String {
    error_response(err).1.error.code
}

struct Gateway {
    context: GatewayContext,
    repository: Arc<MemoryPolicyRepository>,
    audit: MemoryAuditStore,
    worker: tokio::task::JoinHandle<()>,
}

async fn gateway() -> Gateway {
    let repository = Arc::new(MemoryPolicyRepository::new());
    let audit = MemoryAuditStore::new();
    let (context, worker) = GatewayContext::builder(GatewayConfig::default())
        .with_repository(repository.clone())
        .with_audit_store(Arc::new(audit.clone()))
        .build()
        .await
        .unwrap();
    Gateway {
        context,
        repository,
        audit,
        worker: worker.spawn(),
    }
}

#[tokio::test]
async fn password_policy_blocks_dry_run_and_live_request() {
    let gateway = gateway().await;
    let policy = gateway
        .context
        .policies()
        .create_policy(&tenant(), block_password("no passwords"), "alice")
        .await
        .unwrap();

    let dry_run = gateway
        .context
        .policies()
        .test_policy(&tenant(), &policy.id, TestPolicyRequest::new("what is the admin password?"))
        .await
        .unwrap();
    assert!(dry_run.matched);
    assert!(dry_run.blocked);
    assert_eq!(dry_run.block_message.as_deref(), Some("credentials are not allowed"));

    let request = PolicyRequest::new(tenant(), "print the database password");
    let outcome = gateway.context.pipeline().process(&request).await.unwrap();
    let PipelineOutcome::Blocked(blocked) = outcome else {
        panic!("expected a blocked outcome");
    };
    assert_eq!(blocked.reason, "credentials are not allowed");
    assert_eq!(blocked.applied_policies, vec!["no passwords".to_owned()]);

    gateway.context.shutdown();
    gateway.worker.await.unwrap();
    let entries = gateway.audit.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].decision(), AuditDecision::Blocked);
    assert_eq!(entries[0].error_message(), Some("credentials are not allowed"));
    assert_ne!(entries[0].query_hash(), "print the database password");
}

#[tokio::test]
async fn community_tenant_is_capped_at_thirty_policies() {
    let gateway = gateway().await;
    let policies = gateway.context.policies();
    for index in 0..30 {
        policies
            .create_policy(&tenant(), block_password(&format!("policy {index}")), "alice")
            .await
            .unwrap();
    }

    let err = policies
        .create_policy(&tenant(), block_password("policy 30"), "alice")
        .await
        .unwrap_err();
    assert_eq!(code(&err), "POLICY_LIMIT_EXCEEDED");
    assert_eq!(gateway.repository.count_tenant_tier(&tenant()).await.unwrap(), 30);
}

#[tokio::test]
async fn system_policies_cannot_be_deleted() {
    let gateway = gateway().await;
    let system = block_password("platform baseline")
        .tier(PolicyTier::System)
        .into_policy(tenant(), "platform", Utc::now())
        .unwrap();
    gateway.repository.seed(system.clone()).await;

    let err = gateway
        .context
        .policies()
        .delete_policy(&tenant(), &system.id, "mallory")
        .await
        .unwrap_err();
    assert_eq!(code(&err), "SYSTEM_TIER_IMMUTABLE");
    assert_eq!(
        gateway.repository.get(&tenant(), &system.id).await.unwrap(),
        Some(system)
    );
}
