//! Policy resources, their tiers and version snapshots.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use gateway_primitives::{PolicyId, TenantId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Category of a policy. Drives nothing in evaluation; used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    /// Inspects request content.
    Content,
    /// Targets user attributes.
    User,
    /// Adjusts or gates on risk.
    Risk,
    /// Cost controls.
    Cost,
}

impl PolicyType {
    /// Every accepted type, in display order.
    pub const ALL: [Self; 4] = [Self::Content, Self::User, Self::Risk, Self::Cost];

    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::User => "user",
            Self::Risk => "risk",
            Self::Cost => "cost",
        }
    }
}

impl Display for PolicyType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_owned())
    }
}

/// Ownership tier of a policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyTier {
    /// Platform-wide, immutable through the API.
    System,
    /// Shared across an organization; enterprise only.
    Organization,
    /// Owned by a single tenant.
    #[default]
    Tenant,
}

impl PolicyTier {
    /// Wire name of the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Organization => "organization",
            Self::Tenant => "tenant",
        }
    }
}

impl Display for PolicyTier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "organization" => Ok(Self::Organization),
            "tenant" => Ok(Self::Tenant),
            other => Err(other.to_owned()),
        }
    }
}

/// A single predicate over a request fact.
///
/// The operator is kept as written so validation can report unknown names;
/// see [`crate::evaluator::ConditionOperator`] for the accepted set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Fact address: `query`, `request_type`, `user.<attr>` or `context.<attr>`.
    #[serde(default)]
    pub field: String,
    /// Operator name.
    #[serde(default)]
    pub operator: String,
    /// Comparison operand. Lists for `contains_any`, `in` and `not_in`.
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    /// Convenience constructor.
    #[must_use]
    pub fn new(field: impl Into<String>, operator: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: operator.into(),
            value,
        }
    }
}

/// Allow-listed action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    /// Reject the request.
    Block,
    /// Mask listed fields in the response.
    Redact,
    /// Raise an operator alert.
    Alert,
    /// Emit a log line.
    Log,
    /// Steer routing.
    Route,
    /// Scale the computed risk score.
    ModifyRisk,
}

impl ActionType {
    /// Every accepted action type.
    pub const ALL: [Self; 6] = [
        Self::Block,
        Self::Redact,
        Self::Alert,
        Self::Log,
        Self::Route,
        Self::ModifyRisk,
    ];

    /// Wire name of the action type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Redact => "redact",
            Self::Alert => "alert",
            Self::Log => "log",
            Self::Route => "route",
            Self::ModifyRisk => "modify_risk",
        }
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| s.to_owned())
    }
}

/// Effect applied when every condition of a policy holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action type name.
    #[serde(rename = "type", default)]
    pub action_type: String,
    /// Free-form configuration; `block` reads `message`.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
}

impl Action {
    /// Creates an action without configuration.
    #[must_use]
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            config: Map::new(),
        }
    }

    /// Adds a configuration entry.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Parsed action type, `None` when not in the allow-list.
    #[must_use]
    pub fn kind(&self) -> Option<ActionType> {
        self.action_type.parse().ok()
    }

    /// Returns a string configuration value.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A persisted, versioned policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Opaque identifier.
    pub id: PolicyId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Display name, unique per tenant for import matching.
    pub name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Policy category.
    #[serde(rename = "type")]
    pub policy_type: PolicyType,
    /// Ownership tier.
    #[serde(default)]
    pub tier: PolicyTier,
    /// Higher values evaluate first.
    pub priority: i32,
    /// Disabled policies are skipped by the decision engine.
    pub enabled: bool,
    /// AND-combined predicates.
    pub conditions: Vec<Condition>,
    /// Effects applied on match.
    pub actions: Vec<Action>,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Searchable labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Starts at 1, incremented on every successful update.
    pub version: i32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Actor that created the policy.
    #[serde(default)]
    pub created_by: String,
    /// Actor that last modified the policy.
    #[serde(default)]
    pub updated_by: String,
}

impl Policy {
    /// Returns true for system-tier policies, which the API never mutates.
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.tier == PolicyTier::System
    }

    /// Applies a partial update, bumping the version.
    ///
    /// Fields are expected to have passed [`crate::validation::validate_update`];
    /// an unparseable type is ignored. Returns the change type derived from the
    /// `enabled` transition.
    pub fn apply_update(
        &mut self,
        patch: &UpdatePolicyRequest,
        actor: &str,
        now: DateTime<Utc>,
    ) -> ChangeType {
        let was_enabled = self.enabled;

        if let Some(name) = &patch.name {
            self.name.clone_from(name);
        }
        if let Some(description) = &patch.description {
            self.description.clone_from(description);
        }
        if let Some(kind) = patch.policy_type.as_deref().and_then(|t| t.parse().ok()) {
            self.policy_type = kind;
        }
        if let Some(conditions) = &patch.conditions {
            self.conditions.clone_from(conditions);
        }
        if let Some(actions) = &patch.actions {
            self.actions.clone_from(actions);
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(category) = &patch.category {
            self.category = Some(category.clone());
        }
        if let Some(tags) = &patch.tags {
            self.tags.clone_from(tags);
        }

        self.version += 1;
        self.updated_at = now;
        actor.clone_into(&mut self.updated_by);

        ChangeType::for_transition(was_enabled, self.enabled)
    }

    /// Replaces the mutable fields with an imported draft, bumping the version.
    ///
    /// Identity, tier, tenant and creation metadata stay untouched.
    pub fn overwrite_from(&mut self, draft: &PolicyDraft, actor: &str, now: DateTime<Utc>) {
        self.name.clone_from(&draft.name);
        self.description.clone_from(&draft.description);
        if let Ok(kind) = draft.policy_type.parse() {
            self.policy_type = kind;
        }
        self.conditions.clone_from(&draft.conditions);
        self.actions.clone_from(&draft.actions);
        self.priority = draft.priority;
        self.enabled = draft.enabled;
        self.category.clone_from(&draft.category);
        self.tags.clone_from(&draft.tags);
        self.version += 1;
        self.updated_at = now;
        actor.clone_into(&mut self.updated_by);
    }
}

fn default_enabled() -> bool {
    true
}

/// Caller-supplied definition of a new policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDraft {
    /// Optional caller-chosen id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<PolicyId>,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Free text.
    #[serde(default)]
    pub description: String,
    /// Raw type name, checked by validation.
    #[serde(rename = "type", default)]
    pub policy_type: String,
    /// Requested tier; tenant when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<PolicyTier>,
    /// Evaluation priority.
    #[serde(default)]
    pub priority: i32,
    /// Defaults to true.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Predicates.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Effects.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Optional grouping label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Searchable labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl PolicyDraft {
    /// Starts a draft with the mandatory descriptive fields.
    #[must_use]
    pub fn new(name: impl Into<String>, policy_type: PolicyType) -> Self {
        Self {
            name: name.into(),
            policy_type: policy_type.as_str().to_owned(),
            enabled: true,
            ..Self::default()
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the requested tier.
    #[must_use]
    pub fn tier(mut self, tier: PolicyTier) -> Self {
        self.tier = Some(tier);
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Appends a condition.
    #[must_use]
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Appends an action.
    #[must_use]
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Tier the policy will be created with.
    #[must_use]
    pub fn effective_tier(&self) -> PolicyTier {
        self.tier.unwrap_or_default()
    }

    /// Materializes the draft as version 1 of a new policy.
    ///
    /// # Errors
    ///
    /// Returns the unparseable type name when the draft was not validated first.
    pub fn into_policy(
        self,
        tenant_id: TenantId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Policy, String> {
        let policy_type = self.policy_type.parse::<PolicyType>()?;
        let tier = self.effective_tier();
        Ok(Policy {
            id: self.id.unwrap_or_else(PolicyId::random),
            tenant_id,
            name: self.name,
            description: self.description,
            policy_type,
            tier,
            priority: self.priority,
            enabled: self.enabled,
            conditions: self.conditions,
            actions: self.actions,
            category: self.category,
            tags: self.tags,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: actor.to_owned(),
            updated_by: actor.to_owned(),
        })
    }
}

/// Partial update; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdatePolicyRequest {
    /// New name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// New raw type name.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub policy_type: Option<String>,
    /// Replacement condition list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Replacement action list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
    /// New priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// New enabled flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// New category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Replacement tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl UpdatePolicyRequest {
    /// Returns true when no field is provided.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.policy_type.is_none()
            && self.conditions.is_none()
            && self.actions.is_none()
            && self.priority.is_none()
            && self.enabled.is_none()
            && self.category.is_none()
            && self.tags.is_none()
    }
}

/// Kind of mutation captured by a version entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Initial creation.
    Create,
    /// Field changes without an enabled transition.
    Update,
    /// Disabled to enabled.
    Enable,
    /// Enabled to disabled.
    Disable,
    /// Removal; the snapshot holds the pre-delete state.
    Delete,
}

impl ChangeType {
    /// Derives the change type of an update from the enabled transition.
    #[must_use]
    pub fn for_transition(was_enabled: bool, is_enabled: bool) -> Self {
        match (was_enabled, is_enabled) {
            (true, false) => Self::Disable,
            (false, true) => Self::Enable,
            _ => Self::Update,
        }
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "enable" => Ok(Self::Enable),
            "disable" => Ok(Self::Disable),
            "delete" => Ok(Self::Delete),
            other => Err(other.to_owned()),
        }
    }
}

/// Immutable snapshot written alongside every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVersionEntry {
    /// Entry identifier.
    pub id: Uuid,
    /// Policy the snapshot belongs to.
    pub policy_id: PolicyId,
    /// Policy version at the time of the snapshot.
    pub version: i32,
    /// Full policy state.
    pub snapshot: Policy,
    /// Mutation kind.
    pub change_type: ChangeType,
    /// Short human-readable summary.
    pub change_summary: String,
    /// Actor that made the change.
    pub changed_by: String,
    /// When the change happened.
    pub changed_at: DateTime<Utc>,
}

impl PolicyVersionEntry {
    /// Captures the given policy state.
    #[must_use]
    pub fn capture(
        policy: &Policy,
        change_type: ChangeType,
        summary: impl Into<String>,
        actor: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id: policy.id.clone(),
            version: policy.version,
            snapshot: policy.clone(),
            change_type,
            change_summary: summary.into(),
            changed_by: actor.to_owned(),
            changed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_policy() -> Policy {
        PolicyDraft::new("Block secrets", PolicyType::Content)
            .condition(Condition::new("query", "contains", json!("password")))
            .action(Action::new("block"))
            .into_policy(TenantId::new("acme").unwrap(), "alice", Utc::now())
            .unwrap()
    }

    #[test]
    fn drafts_become_version_one_tenant_policies() {
        let policy = sample_policy();
        assert_eq!(policy.version, 1);
        assert_eq!(policy.tier, PolicyTier::Tenant);
        assert!(policy.enabled);
        assert_eq!(policy.created_by, "alice");
    }

    #[test]
    fn update_bumps_version_and_tracks_enabled_transitions() {
        let mut policy = sample_policy();
        let disable = UpdatePolicyRequest {
            enabled: Some(false),
            ..UpdatePolicyRequest::default()
        };
        assert_eq!(
            policy.apply_update(&disable, "bob", Utc::now()),
            ChangeType::Disable
        );
        assert_eq!(policy.version, 2);
        assert_eq!(policy.updated_by, "bob");

        let enable = UpdatePolicyRequest {
            enabled: Some(true),
            ..UpdatePolicyRequest::default()
        };
        assert_eq!(
            policy.apply_update(&enable, "bob", Utc::now()),
            ChangeType::Enable
        );

        let rename = UpdatePolicyRequest {
            name: Some("Renamed".into()),
            enabled: Some(true),
            ..UpdatePolicyRequest::default()
        };
        assert_eq!(
            policy.apply_update(&rename, "bob", Utc::now()),
            ChangeType::Update
        );
        assert_eq!(policy.version, 4);
        assert_eq!(policy.name, "Renamed");
    }

    #[test]
    fn policy_serializes_type_and_tier_in_snake_case() {
        let value = serde_json::to_value(sample_policy()).unwrap();
        assert_eq!(value["type"], "content");
        assert_eq!(value["tier"], "tenant");
        assert_eq!(value["actions"][0]["type"], "block");
    }

    #[test]
    fn empty_update_is_detected() {
        assert!(UpdatePolicyRequest::default().is_empty());
    }
}
