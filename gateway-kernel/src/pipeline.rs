//! Governance pipeline: evaluate, then block or route, then audit.

use std::sync::Arc;
use std::time::Duration;

use gateway_audit::{
    AuditActor, AuditDecision, AuditEntry, AuditEntryBuilder, AuditLogger, EnqueueOutcome,
    PolicyDetails, ProviderUsage,
};
use gateway_policy::{PolicyEngine, PolicyError, PolicyEvaluation, PolicyRequest};
use gateway_primitives::RequestId;
use gateway_telemetry::{MetricsCollector, MetricsSample, Outcome};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{
    CollaboratorError, ProcessedResponse, ProviderMetadata, ProviderResponse, ProviderRouter,
    ResponseProcessor,
};
use crate::lifecycle::{LifecycleError, RequestEvent, RequestLifecycle};

/// Stage name for policy evaluation timings.
pub const POLICY_STAGE: &str = "policy_evaluation";
/// Stage name for routing and redaction timings.
pub const ROUTING_STAGE: &str = "routing";
/// Request type used when the caller does not name one.
pub const DEFAULT_REQUEST_TYPE: &str = "llm_chat";
/// Routing deadline applied when none is configured.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// Errors that fail a governed request.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Policies could not be evaluated; the request must not proceed.
    #[error(transparent)]
    Policy(#[from] PolicyError),
    /// Routing or redaction failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    /// The deadline passed during a stage.
    #[error("{stage} timed out after {after:?}")]
    Timeout {
        /// Stage that was running.
        stage: &'static str,
        /// Configured deadline.
        after: Duration,
    },
    /// The pipeline attempted an illegal state change.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Result alias for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Request served by a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedResponse {
    /// Gateway request identifier.
    pub request_id: RequestId,
    /// Content after redaction.
    pub content: String,
    /// Provider details.
    pub provider: ProviderMetadata,
    /// Fields redacted from the provider response.
    pub redacted_fields: Vec<String>,
    /// Policy decision that allowed the request.
    pub evaluation: PolicyEvaluation,
}

/// Request refused by a policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockedResponse {
    /// Gateway request identifier.
    pub request_id: RequestId,
    /// Reason given by the blocking policy.
    pub reason: String,
    /// Policies that matched.
    pub applied_policies: Vec<String>,
    /// Final risk score.
    pub risk_score: f64,
}

/// Result of a governed request that did not fail.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    /// Routed and returned.
    Served(ServedResponse),
    /// Refused before routing.
    Blocked(BlockedResponse),
}

impl PipelineOutcome {
    /// Returns the request identifier.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::Served(served) => &served.request_id,
            Self::Blocked(blocked) => &blocked.request_id,
        }
    }

    /// Returns `true` for blocked requests.
    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Runs requests through evaluation, routing, redaction and auditing.
///
/// Audit entries are enqueued without waiting and metrics are recorded in
/// place, so neither can hold a request past its response.
#[derive(Clone)]
pub struct GovernancePipeline {
    engine: Arc<dyn PolicyEngine>,
    router: Arc<dyn ProviderRouter>,
    processor: Arc<dyn ResponseProcessor>,
    audit: AuditLogger,
    metrics: Arc<MetricsCollector>,
    deadline: Duration,
}

impl GovernancePipeline {
    /// Wires the pipeline with its collaborators.
    #[must_use]
    pub fn new(
        engine: Arc<dyn PolicyEngine>,
        router: Arc<dyn ProviderRouter>,
        processor: Arc<dyn ResponseProcessor>,
        audit: AuditLogger,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            engine,
            router,
            processor,
            audit,
            metrics,
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// Sets the deadline shared by routing and redaction.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Returns the routing deadline.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Governs one request.
    ///
    /// Evaluation always completes before routing starts and blocked
    /// requests never reach the router. Every path enqueues exactly one
    /// audit entry and records one metrics sample.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Policy`] when evaluation fails,
    /// [`PipelineError::Collaborator`] when routing or redaction fails and
    /// [`PipelineError::Timeout`] when the deadline passes. No stage is retried.
    #[instrument(skip_all, fields(tenant = %request.tenant_id()))]
    pub async fn process(&self, request: &PolicyRequest) -> PipelineResult<PipelineOutcome> {
        let started = Instant::now();
        let mut lifecycle = RequestLifecycle::new(RequestId::random());
        let request_type = request_type_of(request);

        let evaluation_started = Instant::now();
        let evaluation = match self.engine.evaluate(request).await {
            Ok(evaluation) => evaluation,
            Err(err) => {
                error!(request_id = %lifecycle.request_id(), error = %err, "policy evaluation failed");
                let entry = self
                    .entry(&lifecycle, request, AuditDecision::Error)
                    .error_message(err.to_string())
                    .build();
                self.enqueue(&mut lifecycle, entry)?;
                self.metrics
                    .record(MetricsSample::new(request_type, started.elapsed(), Outcome::Failure));
                lifecycle.transition(RequestEvent::Complete)?;
                return Err(err.into());
            }
        };
        let evaluation_elapsed = evaluation_started.elapsed();
        self.metrics.record_stage(POLICY_STAGE, evaluation_elapsed);
        self.metrics.record_policy_evaluation(
            evaluation_elapsed,
            evaluation.risk_score(),
            evaluation.applied_policies(),
            evaluation.is_blocked(),
        );
        lifecycle.transition(RequestEvent::Evaluate)?;

        if evaluation.is_blocked() {
            lifecycle.transition(RequestEvent::Block)?;
            let reason = evaluation.block_reason().unwrap_or("blocked by policy").to_owned();
            let entry = self
                .entry(&lifecycle, request, AuditDecision::Blocked)
                .policy_details(policy_details(&evaluation))
                .error_message(reason.clone())
                .build();
            self.enqueue(&mut lifecycle, entry)?;
            self.metrics
                .record(MetricsSample::new(request_type, started.elapsed(), Outcome::Blocked));
            lifecycle.transition(RequestEvent::Complete)?;
            info!(request_id = %lifecycle.request_id(), %reason, "request blocked by policy");
            return Ok(PipelineOutcome::Blocked(BlockedResponse {
                request_id: lifecycle.request_id().clone(),
                reason,
                applied_policies: evaluation.applied_policies().to_vec(),
                risk_score: evaluation.risk_score(),
            }));
        }

        lifecycle.transition(RequestEvent::Route)?;
        let routing_started = Instant::now();
        let routed = self.route_and_process(request).await;
        self.metrics.record_stage(ROUTING_STAGE, routing_started.elapsed());

        let (response, processed) = match routed {
            Ok(routed) => routed,
            Err(err) => {
                warn!(request_id = %lifecycle.request_id(), error = %err, "request routing failed");
                let entry = self
                    .entry(&lifecycle, request, AuditDecision::Error)
                    .policy_details(policy_details(&evaluation))
                    .error_message(err.to_string())
                    .build();
                self.enqueue(&mut lifecycle, entry)?;
                self.metrics
                    .record(MetricsSample::new(request_type, started.elapsed(), Outcome::Failure));
                lifecycle.transition(RequestEvent::Complete)?;
                return Err(err);
            }
        };

        let metadata = response.metadata;
        let decision = if processed.redacted_fields.is_empty() {
            AuditDecision::Allowed
        } else {
            AuditDecision::Redacted
        };
        let entry = self
            .entry(&lifecycle, request, decision)
            .policy_details(policy_details(&evaluation))
            .usage(ProviderUsage {
                provider: metadata.provider.clone(),
                model: metadata.model.clone(),
                response_time_ms: metadata.response_time_ms,
                tokens_used: metadata.tokens_used,
                cost: metadata.cost,
            })
            .response(processed.content.as_str())
            .redacted_fields(processed.redacted_fields.clone())
            .build();
        self.enqueue(&mut lifecycle, entry)?;
        self.metrics.record_redaction(processed.redacted_fields.len());
        self.metrics.record(
            MetricsSample::new(request_type, started.elapsed(), Outcome::Success)
                .with_provider(metadata.provider.as_str())
                .with_usage(metadata.tokens_used, metadata.cost),
        );
        lifecycle.transition(RequestEvent::Complete)?;
        debug!(
            request_id = %lifecycle.request_id(),
            provider = %metadata.provider,
            redacted = processed.redacted_fields.len(),
            "request served"
        );

        Ok(PipelineOutcome::Served(ServedResponse {
            request_id: lifecycle.request_id().clone(),
            content: processed.content,
            provider: metadata,
            redacted_fields: processed.redacted_fields,
            evaluation,
        }))
    }

    async fn route_and_process(
        &self,
        request: &PolicyRequest,
    ) -> PipelineResult<(ProviderResponse, ProcessedResponse)> {
        let deadline = Instant::now() + self.deadline;
        let response = time::timeout_at(deadline, self.router.route(request))
            .await
            .map_err(|_| PipelineError::Timeout {
                stage: ROUTING_STAGE,
                after: self.deadline,
            })??;
        let processed = time::timeout_at(deadline, self.processor.process(request, &response))
            .await
            .map_err(|_| PipelineError::Timeout {
                stage: "redaction",
                after: self.deadline,
            })??;
        Ok((response, processed))
    }

    fn entry(
        &self,
        lifecycle: &RequestLifecycle,
        request: &PolicyRequest,
        decision: AuditDecision,
    ) -> AuditEntryBuilder {
        let user = request.user();
        AuditEntry::builder(lifecycle.request_id().clone(), request.tenant_id().clone(), decision)
            .actor(AuditActor {
                user_id: user.id.clone(),
                email: user.email.clone(),
                role: user.role.clone(),
            })
            .client(request.client_id().map(str::to_owned))
            .request_type(request_type_of(request))
            .query(request.query())
    }

    fn enqueue(&self, lifecycle: &mut RequestLifecycle, entry: AuditEntry) -> PipelineResult<()> {
        let outcome = self.audit.enqueue(entry);
        if outcome != EnqueueOutcome::Enqueued {
            debug!(request_id = %lifecycle.request_id(), ?outcome, "audit entry not queued");
        }
        lifecycle.transition(RequestEvent::Audit)?;
        Ok(())
    }
}

impl std::fmt::Debug for GovernancePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernancePipeline")
            .field("audit", &self.audit)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

fn request_type_of(request: &PolicyRequest) -> &str {
    match request.request_type() {
        "" => DEFAULT_REQUEST_TYPE,
        kind => kind,
    }
}

fn policy_details(evaluation: &PolicyEvaluation) -> PolicyDetails {
    PolicyDetails {
        applied_policies: evaluation.applied_policies().to_vec(),
        risk_score: evaluation.risk_score(),
        required_actions: evaluation.required_actions().to_vec(),
        processing_time_ms: evaluation.processing_time_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gateway_audit::{AuditConfig, AuditStore, MemoryAuditStore};
    use gateway_policy::{PolicyResult, StoreError, UserContext};
    use gateway_primitives::TenantId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;

    enum Decision {
        Allow,
        Block(&'static str),
        Fail,
    }

    struct StaticEngine(Decision);

    #[async_trait]
    impl PolicyEngine for StaticEngine {
        async fn evaluate(&self, _request: &PolicyRequest) -> PolicyResult<PolicyEvaluation> {
            match self.0 {
                Decision::Allow => Ok(PolicyEvaluation::allow().with_risk_score(0.1)),
                Decision::Block(reason) => {
                    let mut evaluation = PolicyEvaluation::allow().with_risk_score(0.9);
                    evaluation.push_applied("block-passwords");
                    evaluation.mark_blocked(reason.to_owned());
                    Ok(evaluation)
                }
                Decision::Fail => Err(StoreError::database("connection refused").into()),
            }
        }
    }

    #[derive(Default)]
    struct CountingRouter {
        calls: AtomicUsize,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl ProviderRouter for CountingRouter {
        async fn route(&self, request: &PolicyRequest) -> Result<ProviderResponse, CollaboratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            if self.fail {
                return Err(CollaboratorError::routing("all providers failed"));
            }
            Ok(ProviderResponse {
                content: format!("answer to {} ssn 123-45-6789", request.query()),
                metadata: ProviderMetadata {
                    provider: "openai".into(),
                    model: "gpt-4".into(),
                    response_time_ms: 120,
                    tokens_used: 42,
                    cost: 0.002,
                },
            })
        }
    }

    struct SsnRedactor;

    #[async_trait]
    impl ResponseProcessor for SsnRedactor {
        async fn process(
            &self,
            _request: &PolicyRequest,
            response: &ProviderResponse,
        ) -> Result<ProcessedResponse, CollaboratorError> {
            Ok(ProcessedResponse {
                content: response.content.replace("123-45-6789", "[REDACTED]"),
                redacted_fields: vec!["ssn".into()],
            })
        }
    }

    struct Harness {
        pipeline: GovernancePipeline,
        router: Arc<CountingRouter>,
        store: MemoryAuditStore,
        metrics: Arc<MetricsCollector>,
        logger: AuditLogger,
        worker: JoinHandle<()>,
    }

    impl Harness {
        fn new(decision: Decision, router: CountingRouter, processor: Arc<dyn ResponseProcessor>) -> Self {
            let store = MemoryAuditStore::new();
            let (logger, worker) = AuditLogger::builder(AuditConfig::default())
                .with_store(Arc::new(store.clone()) as Arc<dyn AuditStore>)
                .build();
            let router = Arc::new(router);
            let metrics = Arc::new(MetricsCollector::default());
            let pipeline = GovernancePipeline::new(
                Arc::new(StaticEngine(decision)),
                Arc::clone(&router) as Arc<dyn ProviderRouter>,
                processor,
                logger.clone(),
                Arc::clone(&metrics),
            );
            Self {
                pipeline,
                router,
                store,
                metrics,
                logger,
                worker: worker.spawn(),
            }
        }

        async fn audited(self) -> Vec<AuditEntry> {
            self.logger.shutdown();
            self.worker.await.unwrap();
            self.store.entries().await
        }
    }

    fn request(query: &str) -> PolicyRequest {
        PolicyRequest::new(TenantId::new("acme").unwrap(), query).with_user(UserContext {
            id: "u-1".into(),
            email: "dev@acme.io".into(),
            role: "analyst".into(),
            ..UserContext::default()
        })
    }

    #[tokio::test]
    async fn blocked_requests_never_reach_the_router() {
        let harness = Harness::new(
            Decision::Block("credentials"),
            CountingRouter::default(),
            Arc::new(SsnRedactor),
        );

        let outcome = harness.pipeline.process(&request("what is the admin password")).await.unwrap();
        let PipelineOutcome::Blocked(blocked) = &outcome else {
            panic!("expected a blocked outcome, got {outcome:?}");
        };
        assert_eq!(blocked.reason, "credentials");
        assert_eq!(blocked.applied_policies, vec!["block-passwords".to_owned()]);
        assert_eq!(harness.router.calls.load(Ordering::SeqCst), 0);

        let snapshot = harness.metrics.snapshot();
        assert_eq!(snapshot.policy.blocked_by_policy, 1);
        assert_eq!(snapshot.request_types[DEFAULT_REQUEST_TYPE].totals.blocked, 1);
        assert!(snapshot.providers.is_empty());

        let entries = harness.audited().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision(), AuditDecision::Blocked);
        assert_eq!(entries[0].request_id(), outcome.request_id());
        assert!(entries[0].usage().is_none());
    }

    #[tokio::test]
    async fn redacted_responses_are_audited_as_redacted() {
        let harness = Harness::new(Decision::Allow, CountingRouter::default(), Arc::new(SsnRedactor));

        let outcome = harness.pipeline.process(&request("summarise the ticket")).await.unwrap();
        let PipelineOutcome::Served(served) = outcome else {
            panic!("expected a served outcome");
        };
        assert_eq!(served.content, "answer to summarise the ticket ssn [REDACTED]");
        assert_eq!(served.redacted_fields, vec!["ssn".to_owned()]);

        let snapshot = harness.metrics.snapshot();
        assert_eq!(snapshot.providers["openai"].totals.tokens, 42);
        assert_eq!(snapshot.policy.redactions, 1);
        assert!(snapshot.stages.contains_key(POLICY_STAGE));
        assert!(snapshot.stages.contains_key(ROUTING_STAGE));

        let entries = harness.audited().await;
        assert_eq!(entries[0].decision(), AuditDecision::Redacted);
        assert_eq!(entries[0].usage().unwrap().provider, "openai");
        assert_eq!(entries[0].actor().email, "dev@acme.io");
        assert!(!entries[0].response_sample().unwrap().contains("123-45-6789"));
    }

    #[tokio::test]
    async fn clean_responses_are_audited_as_allowed() {
        let harness = Harness::new(
            Decision::Allow,
            CountingRouter::default(),
            Arc::new(crate::collaborators::PassthroughProcessor),
        );
        harness.pipeline.process(&request("hello")).await.unwrap();
        let entries = harness.audited().await;
        assert_eq!(entries[0].decision(), AuditDecision::Allowed);
        assert!(entries[0].redacted_fields().is_empty());
    }

    #[tokio::test]
    async fn routing_failures_are_audited_and_not_retried() {
        let harness = Harness::new(
            Decision::Allow,
            CountingRouter {
                fail: true,
                ..CountingRouter::default()
            },
            Arc::new(SsnRedactor),
        );

        let err = harness.pipeline.process(&request("hello")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(CollaboratorError::Routing { .. })));
        assert_eq!(harness.router.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.metrics.snapshot().consecutive_failures, 1);

        let entries = harness.audited().await;
        assert_eq!(entries[0].decision(), AuditDecision::Error);
        assert!(entries[0].error_message().unwrap().contains("all providers failed"));
        assert!(entries[0].policy_details().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn routing_is_bounded_by_the_deadline() {
        let mut harness = Harness::new(
            Decision::Allow,
            CountingRouter {
                delay: Some(Duration::from_secs(60)),
                ..CountingRouter::default()
            },
            Arc::new(SsnRedactor),
        );
        harness.pipeline = harness.pipeline.clone().with_deadline(Duration::from_millis(50));

        let err = harness.pipeline.process(&request("hello")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout { stage: ROUTING_STAGE, .. }));
        let entries = harness.audited().await;
        assert_eq!(entries[0].decision(), AuditDecision::Error);
    }

    #[tokio::test]
    async fn evaluation_failures_fail_the_request_after_auditing() {
        let harness = Harness::new(Decision::Fail, CountingRouter::default(), Arc::new(SsnRedactor));

        let err = harness.pipeline.process(&request("hello")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Policy(PolicyError::Storage(_))));
        assert_eq!(harness.router.calls.load(Ordering::SeqCst), 0);

        let entries = harness.audited().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].decision(), AuditDecision::Error);
        assert!(entries[0].policy_details().is_none());
    }
}
