//! Dependency wiring built once at startup and shared by every handler.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use gateway_audit::{AuditConfig, AuditError, AuditLogger, AuditStore, AuditWorker, JournalAuditStore};
use gateway_config::GatewayConfig;
use gateway_policy::store::{MemoryPolicyRepository, PolicyRepository};
use gateway_policy::tier::mode_is_enterprise;
use gateway_policy::{
    LicenseChecker, PolicyEngine, PolicyError, PolicyService, StaticLicense, StoreBackedEngine,
    StoreError,
};
use gateway_telemetry::{CollectorConfig, ComponentHealth, HealthReport, MetricsCollector};
use thiserror::Error;
use tracing::info;

use crate::collaborators::{PassthroughProcessor, ProviderRouter, ResponseProcessor, UnconfiguredRouter};
use crate::pipeline::GovernancePipeline;
use crate::scheduler::{RequestScheduler, SchedulerConfig};

/// Errors raised while assembling the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Configuration values cannot be used.
    #[error("invalid gateway configuration: {reason}")]
    Config {
        /// What is wrong.
        reason: String,
    },
    /// The policy store could not be prepared.
    #[error(transparent)]
    PolicyStore(#[from] StoreError),
    /// The decision engine could not be built.
    #[error(transparent)]
    Engine(#[from] PolicyError),
    /// The audit store could not be prepared.
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl ContextError {
    fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }
}

/// Result alias for context assembly.
pub type ContextResult<T> = Result<T, ContextError>;

/// Shared services of a running gateway.
#[derive(Clone)]
pub struct GatewayContext {
    config: Arc<GatewayConfig>,
    policies: Arc<PolicyService>,
    pipeline: GovernancePipeline,
    audit: AuditLogger,
    metrics: Arc<MetricsCollector>,
    scheduler: RequestScheduler,
}

impl GatewayContext {
    /// Starts a builder over the configuration.
    #[must_use]
    pub fn builder(config: GatewayConfig) -> GatewayContextBuilder {
        GatewayContextBuilder {
            config,
            repository: None,
            license: None,
            audit_store: None,
            engine: None,
            router: None,
            processor: None,
        }
    }

    /// Returns the configuration the context was built from.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Policy management service.
    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyService> {
        &self.policies
    }

    /// Governance pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &GovernancePipeline {
        &self.pipeline
    }

    /// Audit queue handle.
    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Metrics collector.
    #[must_use]
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Per-request task scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    /// Checks the audit store and the metrics health flag.
    pub async fn health(&self) -> HealthReport {
        let audit = if self.audit.is_healthy().await {
            ComponentHealth::healthy("audit")
        } else {
            ComponentHealth::unhealthy("audit", "audit store unreachable")
        };
        let metrics = if self.metrics.is_healthy() {
            ComponentHealth::healthy("metrics")
        } else {
            ComponentHealth::unhealthy("metrics", "consecutive request failures over threshold")
        };
        HealthReport::new().with_check(audit).with_check(metrics)
    }

    /// Stops accepting requests and asks the audit worker to drain.
    pub fn shutdown(&self) {
        self.scheduler.close();
        self.audit.shutdown();
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("pipeline", &self.pipeline)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GatewayContext`]. Unset parts are derived from the configuration.
pub struct GatewayContextBuilder {
    config: GatewayConfig,
    repository: Option<Arc<dyn PolicyRepository>>,
    license: Option<Arc<dyn LicenseChecker>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    engine: Option<Arc<dyn PolicyEngine>>,
    router: Option<Arc<dyn ProviderRouter>>,
    processor: Option<Arc<dyn ResponseProcessor>>,
}

impl GatewayContextBuilder {
    /// Uses the given policy repository instead of the configured one.
    #[must_use]
    pub fn with_repository(mut self, repository: Arc<dyn PolicyRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Uses the given license checker instead of the deployment mode.
    #[must_use]
    pub fn with_license(mut self, license: Arc<dyn LicenseChecker>) -> Self {
        self.license = Some(license);
        self
    }

    /// Uses the given audit store instead of the configured one.
    #[must_use]
    pub fn with_audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    /// Evaluates requests with the given engine, e.g. a
    /// [`RemotePolicyEngine`](gateway_policy::integrations::RemotePolicyEngine),
    /// instead of the store-backed one.
    #[must_use]
    pub fn with_engine(mut self, engine: Arc<dyn PolicyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Installs the provider router.
    #[must_use]
    pub fn with_router(mut self, router: Arc<dyn ProviderRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Installs the response processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn ResponseProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Builds the context and the audit worker the caller must spawn.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] when the configuration is out of range or a
    /// store cannot be prepared.
    pub async fn build(self) -> ContextResult<(GatewayContext, AuditWorker)> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ContextError::config(e.to_string()))?;

        let repository = match self.repository {
            Some(repository) => repository,
            None => configured_policy_repository(&config).await?,
        };
        let license = self.license.unwrap_or_else(|| {
            let license = if mode_is_enterprise(&config.license.deployment_mode) {
                StaticLicense::enterprise()
            } else {
                StaticLicense::community()
            };
            Arc::new(license) as Arc<dyn LicenseChecker>
        });
        let audit_store = match self.audit_store {
            Some(store) => Some(store),
            None => configured_audit_store(&config).await?,
        };

        let audit_config = AuditConfig::new(
            config.audit.queue_capacity,
            config.audit.batch_size,
            config.audit.flush_interval(),
        )?;
        let mut audit_builder = AuditLogger::builder(audit_config);
        if let Some(store) = audit_store {
            audit_builder = audit_builder.with_store(store);
        }
        let (audit, worker) = audit_builder.build();

        let metrics = Arc::new(MetricsCollector::new(CollectorConfig {
            window: positive(config.metrics.window, "metrics.window")?,
            failure_threshold: config.metrics.failure_threshold,
            error_window: Duration::from_secs(config.metrics.error_window_secs),
        }));

        let engine: Arc<dyn PolicyEngine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(StoreBackedEngine::new(Arc::clone(&repository))?),
        };
        let policies = Arc::new(
            PolicyService::new(repository, license).with_community_limit(config.policy.community_limit),
        );
        let pipeline = GovernancePipeline::new(
            engine,
            self.router
                .unwrap_or_else(|| Arc::new(UnconfiguredRouter) as Arc<dyn ProviderRouter>),
            self.processor
                .unwrap_or_else(|| Arc::new(PassthroughProcessor) as Arc<dyn ResponseProcessor>),
            audit.clone(),
            Arc::clone(&metrics),
        )
        .with_deadline(config.server.request_timeout());
        let scheduler = RequestScheduler::new(SchedulerConfig::new(positive(
            config.server.max_concurrent_requests,
            "server.max_concurrent_requests",
        )?));

        info!(
            deployment_mode = %config.license.deployment_mode,
            enterprise = policies.is_enterprise(),
            "gateway context ready"
        );
        Ok((
            GatewayContext {
                config: Arc::new(config),
                policies,
                pipeline,
                audit,
                metrics,
                scheduler,
            },
            worker,
        ))
    }
}

impl std::fmt::Debug for GatewayContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContextBuilder")
            .field("config", &self.config)
            .field("has_repository", &self.repository.is_some())
            .field("has_audit_store", &self.audit_store.is_some())
            .field("has_engine", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

fn positive(value: usize, field: &str) -> ContextResult<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| ContextError::config(format!("{field} must be positive")))
}

async fn configured_policy_repository(config: &GatewayConfig) -> ContextResult<Arc<dyn PolicyRepository>> {
    let Some(url) = config.policy.database_url.as_deref() else {
        info!("using in-memory policy store");
        return Ok(Arc::new(MemoryPolicyRepository::new()));
    };
    postgres_policy_repository(url).await
}

#[cfg(feature = "postgres")]
async fn postgres_policy_repository(url: &str) -> ContextResult<Arc<dyn PolicyRepository>> {
    let repository = gateway_policy::store::PostgresPolicyRepository::connect_lazy(url)?;
    repository.migrate().await?;
    info!("using PostgreSQL policy store");
    Ok(Arc::new(repository))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_policy_repository(_url: &str) -> ContextResult<Arc<dyn PolicyRepository>> {
    Err(ContextError::config("policy.database_url requires the `postgres` feature"))
}

async fn configured_audit_store(config: &GatewayConfig) -> ContextResult<Option<Arc<dyn AuditStore>>> {
    if let Some(url) = config.audit.database_url.as_deref() {
        return postgres_audit_store(url).await.map(Some);
    }
    if let Some(path) = &config.audit.journal_path {
        let store = JournalAuditStore::open(path.clone()).await?;
        info!(path = %store.path().display(), "using journal audit store");
        return Ok(Some(Arc::new(store)));
    }
    info!("no audit store configured; audit entries are discarded");
    Ok(None)
}

#[cfg(feature = "postgres")]
async fn postgres_audit_store(url: &str) -> ContextResult<Arc<dyn AuditStore>> {
    let store = gateway_audit::PostgresAuditStore::connect_lazy(url)?;
    store.migrate().await?;
    info!("using PostgreSQL audit store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn postgres_audit_store(_url: &str) -> ContextResult<Arc<dyn AuditStore>> {
    Err(ContextError::config("audit.database_url requires the `postgres` feature"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_audit::{AuditDecision, MemoryAuditStore};
    use gateway_policy::integrations::{GovernanceClient, RemotePolicyEngine};
    use gateway_policy::{PolicyEvaluation, PolicyRequest, PolicyResult};
    use gateway_primitives::TenantId;

    use crate::pipeline::PipelineOutcome;

    struct DenylistClient;

    #[async_trait]
    impl GovernanceClient for DenylistClient {
        async fn evaluate(&self, request: &PolicyRequest) -> PolicyResult<PolicyEvaluation> {
            if request.query().contains("exfiltrate") {
                Ok(PolicyEvaluation::block("remote denylist"))
            } else {
                Ok(PolicyEvaluation::allow())
            }
        }
    }

    #[tokio::test]
    async fn installed_engine_replaces_the_store_backed_one() {
        let audit = MemoryAuditStore::new();
        let (context, worker) = GatewayContext::builder(GatewayConfig::default())
            .with_engine(Arc::new(RemotePolicyEngine::new(Arc::new(DenylistClient))))
            .with_audit_store(Arc::new(audit.clone()))
            .build()
            .await
            .unwrap();
        let worker = worker.spawn();

        let request = PolicyRequest::new(TenantId::new("acme").unwrap(), "exfiltrate the payroll table");
        let outcome = context.pipeline().process(&request).await.unwrap();
        let PipelineOutcome::Blocked(blocked) = outcome else {
            panic!("remote engine should block");
        };
        assert_eq!(blocked.reason, "remote denylist");

        context.shutdown();
        worker.await.unwrap();
        let entries = audit.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision(), AuditDecision::Blocked);
    }

    #[tokio::test]
    async fn defaults_build_a_community_gateway() {
        let (context, worker) = GatewayContext::builder(GatewayConfig::default()).build().await.unwrap();
        let worker = worker.spawn();

        assert!(!context.policies().is_enterprise());
        assert_eq!(context.policies().community_limit(), 30);
        assert_eq!(context.pipeline().deadline(), Duration::from_secs(30));
        assert_eq!(context.scheduler().config().max_concurrency().get(), 256);
        assert!(context.health().await.is_healthy());

        context.shutdown();
        worker.await.unwrap();
        assert!(context.scheduler().is_closed());
    }

    #[tokio::test]
    async fn enterprise_modes_unlock_enterprise_tier() {
        let mut config = GatewayConfig::default();
        config.license.deployment_mode = "saas".into();
        let (context, _worker) = GatewayContext::builder(config).build().await.unwrap();
        assert!(context.policies().is_enterprise());
    }

    #[tokio::test]
    async fn unreachable_audit_store_reports_unhealthy() {
        let store = MemoryAuditStore::new();
        store.fail_ping(true);
        let (context, _worker) = GatewayContext::builder(GatewayConfig::default())
            .with_audit_store(Arc::new(store))
            .build()
            .await
            .unwrap();

        let report = context.health().await;
        assert!(!report.is_healthy());
        let audit = report.checks.iter().find(|check| check.name == "audit").unwrap();
        assert!(!audit.healthy);
    }

    #[tokio::test]
    async fn journal_path_selects_the_journal_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/log.ndjson");
        let mut config = GatewayConfig::default();
        config.audit.journal_path = Some(path.clone());
        let (context, _worker) = GatewayContext::builder(config).build().await.unwrap();
        assert!(context.health().await.is_healthy());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn out_of_range_values_are_rejected() {
        let mut config = GatewayConfig::default();
        config.audit.batch_size = 0;
        let err = GatewayContext::builder(config).build().await.unwrap_err();
        assert!(matches!(err, ContextError::Config { .. }));
    }
}
