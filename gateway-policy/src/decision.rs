//! Evaluation results returned by decision engines.

use serde::{Deserialize, Serialize};

/// Outcome of evaluating a tenant's policies against a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    allowed: bool,
    #[serde(default)]
    applied_policies: Vec<String>,
    #[serde(default)]
    risk_score: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    required_actions: Vec<String>,
    #[serde(default)]
    processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_reason: Option<String>,
}

impl PolicyEvaluation {
    /// Returns an allow decision with no matched policies.
    #[must_use]
    pub fn allow() -> Self {
        Self {
            allowed: true,
            applied_policies: Vec::new(),
            risk_score: 0.0,
            required_actions: Vec::new(),
            processing_time_ms: 0,
            block_reason: None,
        }
    }

    /// Returns a block decision with an explanatory reason.
    #[must_use]
    pub fn block(reason: impl Into<String>) -> Self {
        let mut evaluation = Self::allow();
        evaluation.mark_blocked(reason.into());
        evaluation
    }

    /// Records a matched policy by name.
    pub fn push_applied(&mut self, policy_name: impl Into<String>) {
        self.applied_policies.push(policy_name.into());
    }

    /// Adds an obligation such as `redact: ssn,email`.
    pub fn push_required_action(&mut self, action: impl Into<String>) {
        self.required_actions.push(action.into());
    }

    /// Disallows the request; the first reason wins.
    pub fn mark_blocked(&mut self, reason: String) {
        self.allowed = false;
        self.required_actions.push(format!("blocked: {reason}"));
        if self.block_reason.is_none() {
            self.block_reason = Some(reason);
        }
    }

    /// Sets the risk score, clamped to `0.0..=1.0`.
    pub fn set_risk_score(&mut self, score: f64) {
        self.risk_score = score.clamp(0.0, 1.0);
    }

    /// Sets the evaluation time.
    pub fn set_processing_time_ms(&mut self, millis: u64) {
        self.processing_time_ms = millis;
    }

    /// Returns the risk score with builder semantics.
    #[must_use]
    pub fn with_risk_score(mut self, score: f64) -> Self {
        self.set_risk_score(score);
        self
    }

    /// Returns true when the request may proceed.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Returns true when a policy blocked the request.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        !self.allowed
    }

    /// Names of matched policies in evaluation order.
    #[must_use]
    pub fn applied_policies(&self) -> &[String] {
        &self.applied_policies
    }

    /// Risk score between 0 and 1.
    #[must_use]
    pub fn risk_score(&self) -> f64 {
        self.risk_score
    }

    /// Obligations collected from matched policies.
    #[must_use]
    pub fn required_actions(&self) -> &[String] {
        &self.required_actions
    }

    /// Evaluation time in milliseconds.
    #[must_use]
    pub fn processing_time_ms(&self) -> u64 {
        self.processing_time_ms
    }

    /// Reason given by the first blocking policy.
    #[must_use]
    pub fn block_reason(&self) -> Option<&str> {
        self.block_reason.as_deref()
    }
}

impl Default for PolicyEvaluation {
    fn default() -> Self {
        Self::allow()
    }
}
