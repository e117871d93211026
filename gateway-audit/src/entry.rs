//! Audit entry shape and the derivations computed when one is built.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gateway_primitives::{AuditId, RequestId, TenantId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Maximum number of characters kept from a provider response.
pub const RESPONSE_SAMPLE_CHARS: usize = 200;

/// Outcome recorded for a governed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDecision {
    /// The request passed policy checks and was served.
    Allowed,
    /// A policy blocked the request.
    Blocked,
    /// The request was served with fields redacted from the response.
    Redacted,
    /// Routing or evaluation failed.
    Error,
}

impl AuditDecision {
    /// Wire name of the decision.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Blocked => "blocked",
            Self::Redacted => "redacted",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for AuditDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "blocked" => Ok(Self::Blocked),
            "redacted" => Ok(Self::Redacted),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown audit decision: {other}")),
        }
    }
}

/// Regulatory regimes a request may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceFlag {
    /// Query mentions patients or medical data.
    HipaaRelevant,
    /// Tenant is hosted in the EU.
    GdprApplicable,
    /// Query mentions accounts or transactions.
    SoxRelevant,
    /// Query asks for personal identifiers.
    PiiAccess,
}

const PII_KEYWORDS: [&str; 5] = ["ssn", "email", "phone", "address", "credit_card"];
const SENSITIVE_KEYWORDS: [&str; 7] = [
    "password",
    "secret",
    "key",
    "token",
    "ssn",
    "social_security",
    "credit_card",
];

/// Flags a request by keyword inspection of its query and tenant.
#[must_use]
pub fn detect_compliance_flags(query: &str, tenant: &TenantId) -> Vec<ComplianceFlag> {
    let lowered = query.to_lowercase();
    let mut flags = Vec::new();
    if lowered.contains("patient") || lowered.contains("medical") {
        flags.push(ComplianceFlag::HipaaRelevant);
    }
    if tenant.as_str().starts_with("eu_") {
        flags.push(ComplianceFlag::GdprApplicable);
    }
    if lowered.contains("account") || lowered.contains("transaction") {
        flags.push(ComplianceFlag::SoxRelevant);
    }
    if PII_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)) {
        flags.push(ComplianceFlag::PiiAccess);
    }
    flags
}

/// Rough structural complexity of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    /// No joins.
    Low,
    /// One or two joins.
    Medium,
    /// More than two joins.
    High,
}

impl QueryComplexity {
    /// Classifies the query by how often `join` appears.
    #[must_use]
    pub fn of(query: &str) -> Self {
        match query.to_lowercase().matches("join").count() {
            0 => Self::Low,
            1 | 2 => Self::Medium,
            _ => Self::High,
        }
    }
}

/// Policy evaluation summary carried on an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDetails {
    /// Names of the policies that matched.
    #[serde(default)]
    pub applied_policies: Vec<String>,
    /// Final risk score.
    pub risk_score: f64,
    /// Actions the engine asked for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_actions: Vec<String>,
    /// Evaluation time in milliseconds.
    pub processing_time_ms: u64,
}

/// Security snapshot derived from the query and the evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    /// Final risk score.
    pub risk_score: f64,
    /// Number of policies that matched.
    pub policies_applied: usize,
    /// Join-based complexity class.
    pub query_complexity: QueryComplexity,
    /// Whether the query names credentials or identifiers.
    pub sensitive_access: bool,
}

impl SecurityMetrics {
    /// Derives the snapshot for a query.
    #[must_use]
    pub fn assess(query: &str, details: &PolicyDetails) -> Self {
        let lowered = query.to_lowercase();
        Self {
            risk_score: details.risk_score,
            policies_applied: details.applied_policies.len(),
            query_complexity: QueryComplexity::of(query),
            sensitive_access: SENSITIVE_KEYWORDS.iter().any(|keyword| lowered.contains(keyword)),
        }
    }
}

/// SHA-256 of the query, hex encoded.
#[must_use]
pub fn hash_query(query: &str) -> String {
    hex::encode(Sha256::digest(query.as_bytes()))
}

/// Keeps the first [`RESPONSE_SAMPLE_CHARS`] characters, marking the cut with `...`.
#[must_use]
pub fn truncate_sample(response: &str) -> String {
    match response.char_indices().nth(RESPONSE_SAMPLE_CHARS) {
        Some((cut, _)) => format!("{}...", &response[..cut]),
        None => response.to_owned(),
    }
}

/// Identity of the caller behind a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditActor {
    /// User identifier.
    pub user_id: String,
    /// User email.
    pub email: String,
    /// User role.
    pub role: String,
}

/// Provider usage attached to served requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// Provider that served the request.
    pub provider: String,
    /// Model used.
    pub model: String,
    /// Provider latency in milliseconds.
    pub response_time_ms: u64,
    /// Tokens consumed.
    pub tokens_used: u64,
    /// Cost of the call.
    pub cost: f64,
}

/// Immutable record of one governed request.
///
/// The raw query never reaches this type; only its hash does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub(crate) id: AuditId,
    pub(crate) request_id: RequestId,
    pub(crate) timestamp: DateTime<Utc>,
    pub(crate) actor: AuditActor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) client_id: Option<String>,
    pub(crate) tenant_id: TenantId,
    pub(crate) request_type: String,
    pub(crate) query_hash: String,
    pub(crate) decision: AuditDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) policy_details: Option<PolicyDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) usage: Option<ProviderUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) response_sample: Option<String>,
    #[serde(default)]
    pub(crate) redacted_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) error_message: Option<String>,
    #[serde(default)]
    pub(crate) compliance_flags: Vec<ComplianceFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) security_metrics: Option<SecurityMetrics>,
}

impl AuditEntry {
    /// Starts an entry for the request.
    #[must_use]
    pub fn builder(request_id: RequestId, tenant_id: TenantId, decision: AuditDecision) -> AuditEntryBuilder {
        AuditEntryBuilder {
            request_id,
            tenant_id,
            decision,
            timestamp: Utc::now(),
            actor: AuditActor::default(),
            client_id: None,
            request_type: String::new(),
            query: String::new(),
            policy_details: None,
            usage: None,
            response_sample: None,
            redacted_fields: Vec::new(),
            error_message: None,
        }
    }

    /// Returns the audit identifier.
    #[must_use]
    pub fn id(&self) -> &AuditId {
        &self.id
    }

    /// Returns the request identifier.
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Returns when the entry was built.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the caller identity.
    #[must_use]
    pub fn actor(&self) -> &AuditActor {
        &self.actor
    }

    /// Returns the client identifier, if any.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Returns the tenant.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Returns the request type.
    #[must_use]
    pub fn request_type(&self) -> &str {
        &self.request_type
    }

    /// Returns the SHA-256 hex digest of the query.
    #[must_use]
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    /// Returns the recorded decision.
    #[must_use]
    pub fn decision(&self) -> AuditDecision {
        self.decision
    }

    /// Returns the evaluation summary, absent for early failures.
    #[must_use]
    pub fn policy_details(&self) -> Option<&PolicyDetails> {
        self.policy_details.as_ref()
    }

    /// Returns provider usage for served requests.
    #[must_use]
    pub fn usage(&self) -> Option<&ProviderUsage> {
        self.usage.as_ref()
    }

    /// Returns the truncated response sample.
    #[must_use]
    pub fn response_sample(&self) -> Option<&str> {
        self.response_sample.as_deref()
    }

    /// Returns fields removed from the response.
    #[must_use]
    pub fn redacted_fields(&self) -> &[String] {
        &self.redacted_fields
    }

    /// Returns the failure message for error entries.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns detected compliance flags.
    #[must_use]
    pub fn compliance_flags(&self) -> &[ComplianceFlag] {
        &self.compliance_flags
    }

    /// Returns the security snapshot, present whenever policy details are.
    #[must_use]
    pub fn security_metrics(&self) -> Option<&SecurityMetrics> {
        self.security_metrics.as_ref()
    }
}

/// Builder used to assemble [`AuditEntry`] values.
#[derive(Debug)]
pub struct AuditEntryBuilder {
    request_id: RequestId,
    tenant_id: TenantId,
    decision: AuditDecision,
    timestamp: DateTime<Utc>,
    actor: AuditActor,
    client_id: Option<String>,
    request_type: String,
    query: String,
    policy_details: Option<PolicyDetails>,
    usage: Option<ProviderUsage>,
    response_sample: Option<String>,
    redacted_fields: Vec<String>,
    error_message: Option<String>,
}

impl AuditEntryBuilder {
    /// Sets the caller identity.
    #[must_use]
    pub fn actor(mut self, actor: AuditActor) -> Self {
        self.actor = actor;
        self
    }

    /// Sets the client identifier.
    #[must_use]
    pub fn client(mut self, client_id: Option<String>) -> Self {
        self.client_id = client_id;
        self
    }

    /// Sets the request type.
    #[must_use]
    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = request_type.into();
        self
    }

    /// Supplies the raw query. Only derived values survive [`build`](Self::build).
    #[must_use]
    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    /// Attaches the evaluation summary.
    #[must_use]
    pub fn policy_details(mut self, details: PolicyDetails) -> Self {
        self.policy_details = Some(details);
        self
    }

    /// Attaches provider usage.
    #[must_use]
    pub fn usage(mut self, usage: ProviderUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Attaches a response sample, truncated on build.
    #[must_use]
    pub fn response(mut self, response: impl Into<String>) -> Self {
        self.response_sample = Some(response.into());
        self
    }

    /// Records redacted fields.
    #[must_use]
    pub fn redacted_fields(mut self, fields: Vec<String>) -> Self {
        self.redacted_fields = fields;
        self
    }

    /// Records the failure message.
    #[must_use]
    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Finalizes the entry, hashing the query and deriving flags and metrics.
    #[must_use]
    pub fn build(self) -> AuditEntry {
        let security_metrics = self
            .policy_details
            .as_ref()
            .map(|details| SecurityMetrics::assess(&self.query, details));
        AuditEntry {
            id: AuditId::generate(),
            request_id: self.request_id,
            timestamp: self.timestamp,
            actor: self.actor,
            client_id: self.client_id,
            compliance_flags: detect_compliance_flags(&self.query, &self.tenant_id),
            tenant_id: self.tenant_id,
            request_type: self.request_type,
            query_hash: hash_query(&self.query),
            decision: self.decision,
            policy_details: self.policy_details,
            usage: self.usage,
            response_sample: self.response_sample.as_deref().map(truncate_sample),
            redacted_fields: self.redacted_fields,
            error_message: self.error_message,
            security_metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(raw: &str) -> TenantId {
        TenantId::new(raw).unwrap()
    }

    #[test]
    fn raw_query_is_hashed_not_stored() {
        let query = "show patient records for account 42";
        let entry = AuditEntry::builder(RequestId::random(), tenant("acme"), AuditDecision::Allowed)
            .query(query)
            .build();

        assert_eq!(entry.query_hash().len(), 64);
        assert_eq!(entry.query_hash(), hash_query(query));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("patient records"));
    }

    #[test]
    fn response_samples_are_truncated_on_char_boundaries() {
        let long = "é".repeat(250);
        let sample = truncate_sample(&long);
        assert_eq!(sample.chars().count(), RESPONSE_SAMPLE_CHARS + 3);
        assert!(sample.ends_with("..."));
        assert_eq!(truncate_sample("short"), "short");
        assert_eq!(truncate_sample(&"a".repeat(200)), "a".repeat(200));
    }

    #[test]
    fn compliance_flags_follow_keywords_and_tenant_region() {
        let flags = detect_compliance_flags("Medical history and phone for account", &tenant("eu_clinic"));
        assert_eq!(
            flags,
            vec![
                ComplianceFlag::HipaaRelevant,
                ComplianceFlag::GdprApplicable,
                ComplianceFlag::SoxRelevant,
                ComplianceFlag::PiiAccess,
            ]
        );
        assert!(detect_compliance_flags("weather today", &tenant("us_acme")).is_empty());
    }

    #[test]
    fn security_metrics_need_policy_details() {
        let details = PolicyDetails {
            applied_policies: vec!["pii".into(), "sql".into()],
            risk_score: 0.7,
            ..PolicyDetails::default()
        };
        let entry = AuditEntry::builder(RequestId::random(), tenant("acme"), AuditDecision::Blocked)
            .query("select a join b join c join d where token = 1")
            .policy_details(details)
            .build();
        let metrics = entry.security_metrics().unwrap();
        assert_eq!(metrics.policies_applied, 2);
        assert_eq!(metrics.query_complexity, QueryComplexity::High);
        assert!(metrics.sensitive_access);

        let failed = AuditEntry::builder(RequestId::random(), tenant("acme"), AuditDecision::Error)
            .query("anything")
            .error_message("provider timeout")
            .build();
        assert!(failed.security_metrics().is_none());
        assert_eq!(failed.error_message(), Some("provider timeout"));
    }

    #[test]
    fn complexity_counts_joins() {
        assert_eq!(QueryComplexity::of("select 1"), QueryComplexity::Low);
        assert_eq!(QueryComplexity::of("a JOIN b"), QueryComplexity::Medium);
        assert_eq!(QueryComplexity::of("a join b join c"), QueryComplexity::Medium);
        assert_eq!(QueryComplexity::of("join join join"), QueryComplexity::High);
    }
}
