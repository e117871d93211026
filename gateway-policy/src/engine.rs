//! Decision engine trait and the store-backed implementation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contracts::PolicyRequest;
use crate::decision::PolicyEvaluation;
use crate::error::{PolicyError, PolicyResult};
use crate::evaluator::evaluate_policy;
use crate::model::{Action, ActionType, Policy};
use crate::store::PolicyRepository;

/// Trait implemented by policy decision engines.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    /// Evaluates the request against the tenant's policies.
    async fn evaluate(&self, request: &PolicyRequest) -> PolicyResult<PolicyEvaluation>;
}

const SENSITIVE_PATTERNS: [&str; 3] = [
    r"(?i)(password|secret|key|token)",
    r"(?i)(drop\s+table|delete\s+from|truncate)",
    r"(?i)(union\s+select|or\s+1=1)",
];

/// Baseline risk scoring applied before policy actions adjust it.
#[derive(Debug, Clone)]
pub struct RiskCalculator {
    patterns: Vec<Regex>,
}

impl RiskCalculator {
    /// Weight added per matching sensitive pattern.
    pub const PATTERN_WEIGHT: f64 = 0.9;
    /// Weight added for administrators.
    pub const ADMIN_WEIGHT: f64 = 0.5;
    /// Weight added for unbounded selects.
    pub const SELECT_ALL_WEIGHT: f64 = 0.3;

    /// Compiles the built-in patterns.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidRule`] if a pattern fails to compile.
    pub fn new() -> PolicyResult<Self> {
        let patterns = SENSITIVE_PATTERNS
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(|e| PolicyError::InvalidRule(e.to_string())))
            .collect::<PolicyResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    /// Scores the request between 0 and 1.
    #[must_use]
    pub fn score(&self, request: &PolicyRequest) -> f64 {
        let query = request.query();
        let mut score = self
            .patterns
            .iter()
            .filter(|pattern| pattern.is_match(query))
            .map(|_| Self::PATTERN_WEIGHT)
            .sum::<f64>();
        if request.user().role == "admin" {
            score += Self::ADMIN_WEIGHT;
        }
        if query.to_lowercase().contains("select *") {
            score += Self::SELECT_ALL_WEIGHT;
        }
        score.min(1.0)
    }
}

/// Evaluates the tenant's enabled policies straight from the repository.
#[derive(Clone)]
pub struct StoreBackedEngine {
    repository: Arc<dyn PolicyRepository>,
    risk: RiskCalculator,
}

impl StoreBackedEngine {
    /// Creates an engine over the repository.
    ///
    /// # Errors
    ///
    /// Propagates [`RiskCalculator::new`] failures.
    pub fn new(repository: Arc<dyn PolicyRepository>) -> PolicyResult<Self> {
        Ok(Self {
            repository,
            risk: RiskCalculator::new()?,
        })
    }

    fn apply_action(policy: &Policy, action: &Action, evaluation: &mut PolicyEvaluation, risk: &mut f64) {
        match action.kind() {
            Some(ActionType::Block) => {
                let reason = action
                    .config_str("reason")
                    .or_else(|| action.config_str("message"))
                    .unwrap_or(policy.name.as_str())
                    .to_owned();
                evaluation.mark_blocked(reason);
            }
            Some(ActionType::Redact) => {
                let fields = match action.config.get("fields") {
                    Some(Value::Array(items)) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join(","),
                    Some(Value::String(field)) => field.clone(),
                    _ => String::new(),
                };
                evaluation.push_required_action(format!("redact: {fields}"));
            }
            Some(ActionType::Alert) => {
                warn!(policy = %policy.name, policy_id = %policy.id, "policy alert triggered");
            }
            Some(ActionType::Log) => {
                info!(policy = %policy.name, policy_id = %policy.id, "policy log action triggered");
            }
            Some(ActionType::ModifyRisk) => {
                if let Some(modifier) = action.config.get("modifier").and_then(Value::as_f64) {
                    *risk *= modifier;
                }
            }
            Some(ActionType::Route) => {
                if let Some(target) = action.config_str("provider") {
                    evaluation.push_required_action(format!("route: {target}"));
                }
            }
            None => debug!(action = %action.action_type, "ignoring unknown action type"),
        }
    }
}

impl std::fmt::Debug for StoreBackedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackedEngine")
            .field("risk", &self.risk)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PolicyEngine for StoreBackedEngine {
    async fn evaluate(&self, request: &PolicyRequest) -> PolicyResult<PolicyEvaluation> {
        let started = Instant::now();
        let mut policies = self.repository.enabled_policies(request.tenant_id()).await?;
        policies.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));

        let mut evaluation = PolicyEvaluation::allow();
        let mut risk = self.risk.score(request);
        for policy in &policies {
            let outcome = evaluate_policy(policy, request);
            if !outcome.matched {
                continue;
            }
            debug!(policy = %policy.name, priority = policy.priority, "policy matched");
            evaluation.push_applied(policy.name.clone());
            for action in &outcome.actions {
                Self::apply_action(policy, action, &mut evaluation, &mut risk);
            }
        }

        evaluation.set_risk_score(risk);
        evaluation.set_processing_time_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        debug!(
            tenant = %request.tenant_id(),
            allowed = evaluation.is_allowed(),
            applied = evaluation.applied_policies().len(),
            risk = evaluation.risk_score(),
            "policy evaluation complete"
        );
        Ok(evaluation)
    }
}
