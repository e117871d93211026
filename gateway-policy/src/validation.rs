//! Field-level validation of policy drafts and updates.

use std::fmt::{self, Display, Formatter};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::evaluator::ConditionOperator;
use crate::model::{Action, ActionType, Condition, PolicyDraft, PolicyType, UpdatePolicyRequest};

/// Bounds on a policy name, in characters.
pub const NAME_LENGTH: std::ops::RangeInclusive<usize> = 3..=100;
/// Longest accepted description, in characters.
pub const MAX_DESCRIPTION_LENGTH: usize = 500;
/// Accepted priority range.
pub const PRIORITY_RANGE: std::ops::RangeInclusive<i32> = 0..=1000;

/// A single rejected field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field key such as `name` or `conditions[2]`.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl FieldError {
    /// Creates a field error.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Every violation found in one input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationError {
    errors: Vec<FieldError>,
}

impl ValidationError {
    /// Wraps a single field error.
    #[must_use]
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            errors: vec![FieldError::new(field, message)],
        }
    }

    /// Collected violations in check order.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    /// Returns true when the named field was rejected.
    #[must_use]
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|error| error.field == field)
    }

    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldError::new(field, message));
    }

    fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl FromIterator<FieldError> for ValidationError {
    fn from_iter<I: IntoIterator<Item = FieldError>>(iter: I) -> Self {
        Self {
            errors: iter.into_iter().collect(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "validation failed")?;
        for (index, error) in self.errors.iter().enumerate() {
            let sep = if index == 0 { ": " } else { "; " };
            write!(f, "{sep}{}: {}", error.field, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// Checks a draft before creation, accumulating every violation.
///
/// # Errors
///
/// Returns a [`ValidationError`] listing each rejected field.
pub fn validate_create(draft: &PolicyDraft) -> Result<(), ValidationError> {
    let mut errors = ValidationError::default();

    check_name(&draft.name, &mut errors);
    check_description(&draft.description, &mut errors);

    if draft.policy_type.is_empty() {
        errors.push("type", "Type is required");
    } else {
        check_type(&draft.policy_type, &mut errors);
    }

    if draft.conditions.is_empty() {
        errors.push("conditions", "At least one condition is required");
    } else {
        check_conditions(&draft.conditions, &mut errors);
    }

    if draft.actions.is_empty() {
        errors.push("actions", "At least one action is required");
    } else {
        check_actions(&draft.actions, &mut errors);
    }

    check_priority(draft.priority, &mut errors);

    errors.into_result()
}

/// Checks only the fields present in a partial update.
///
/// An explicitly empty condition or action list is rejected.
///
/// # Errors
///
/// Returns a [`ValidationError`] listing each rejected field.
pub fn validate_update(patch: &UpdatePolicyRequest) -> Result<(), ValidationError> {
    let mut errors = ValidationError::default();

    if let Some(name) = &patch.name {
        check_name(name, &mut errors);
    }
    if let Some(description) = &patch.description {
        check_description(description, &mut errors);
    }
    if let Some(policy_type) = &patch.policy_type {
        check_type(policy_type, &mut errors);
    }
    if let Some(conditions) = &patch.conditions {
        if conditions.is_empty() {
            errors.push("conditions", "At least one condition is required");
        }
        check_conditions(conditions, &mut errors);
    }
    if let Some(actions) = &patch.actions {
        if actions.is_empty() {
            errors.push("actions", "At least one action is required");
        }
        check_actions(actions, &mut errors);
    }
    if let Some(priority) = patch.priority {
        check_priority(priority, &mut errors);
    }

    errors.into_result()
}

fn check_name(name: &str, errors: &mut ValidationError) {
    if !NAME_LENGTH.contains(&name.chars().count()) {
        errors.push("name", "Name must be between 3 and 100 characters");
    }
}

fn check_description(description: &str, errors: &mut ValidationError) {
    if description.chars().count() > MAX_DESCRIPTION_LENGTH {
        errors.push("description", "Description must not exceed 500 characters");
    }
}

fn check_type(policy_type: &str, errors: &mut ValidationError) {
    if policy_type.parse::<PolicyType>().is_err() {
        errors.push("type", "Type must be one of: content, user, risk, cost");
    }
}

fn check_priority(priority: i32, errors: &mut ValidationError) {
    if !PRIORITY_RANGE.contains(&priority) {
        errors.push("priority", "Priority must be between 0 and 1000");
    }
}

fn check_conditions(conditions: &[Condition], errors: &mut ValidationError) {
    for (index, condition) in conditions.iter().enumerate() {
        if let Some(message) = condition_problem(condition) {
            errors.push(format!("conditions[{index}]"), message);
        }
    }
}

fn check_actions(actions: &[Action], errors: &mut ValidationError) {
    for (index, action) in actions.iter().enumerate() {
        if action.action_type.parse::<ActionType>().is_err() {
            errors.push(
                format!("actions[{index}]"),
                format!("invalid action type: {}", action.action_type),
            );
        }
    }
}

/// Describes the first problem with a condition, if any.
#[must_use]
pub fn condition_problem(condition: &Condition) -> Option<String> {
    if condition.field.trim().is_empty() {
        return Some("field is required".to_owned());
    }
    if condition.operator.trim().is_empty() {
        return Some("operator is required".to_owned());
    }
    let Ok(operator) = condition.operator.parse::<ConditionOperator>() else {
        return Some(format!("invalid operator: {}", condition.operator));
    };

    if operator == ConditionOperator::Regex {
        let Some(pattern) = condition.value.as_str() else {
            return Some("regex value must be a string pattern".to_owned());
        };
        if let Err(err) = Regex::new(pattern) {
            return Some(format!("invalid regex pattern: {err}"));
        }
    }

    if operator.takes_list() && !condition.value.is_array() {
        return Some(format!("value must be a list for operator {operator}"));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_draft() -> PolicyDraft {
        PolicyDraft::new("Block secrets", PolicyType::Content)
            .priority(100)
            .condition(Condition::new("query", "contains", json!("password")))
            .action(Action::new("block"))
    }

    #[test]
    fn accepts_a_well_formed_draft() {
        assert!(validate_create(&valid_draft()).is_ok());
    }

    #[test]
    fn accumulates_every_violation() {
        let draft = PolicyDraft {
            name: "ab".into(),
            description: "x".repeat(501),
            priority: 1001,
            ..PolicyDraft::default()
        };
        let err = validate_create(&draft).unwrap_err();
        let fields: Vec<&str> = err.errors().iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            ["name", "description", "type", "conditions", "actions", "priority"]
        );
        assert_eq!(err.errors()[2].message, "Type is required");
    }

    #[test]
    fn reports_condition_and_action_indices() {
        let draft = valid_draft()
            .condition(Condition::new("query", "like", json!("x")))
            .condition(Condition::new("query", "regex", json!("(")))
            .condition(Condition::new("query", "in", json!("single")))
            .action(Action::new("explode"));
        let err = validate_create(&draft).unwrap_err();

        assert!(err.has_field("conditions[1]"));
        assert!(err.has_field("conditions[2]"));
        assert!(err.has_field("conditions[3]"));
        assert!(err.has_field("actions[1]"));
        assert_eq!(err.errors()[0].message, "invalid operator: like");
        assert!(err.errors()[1].message.starts_with("invalid regex pattern"));
        assert_eq!(err.errors()[3].message, "invalid action type: explode");
    }

    #[test]
    fn names_are_measured_in_characters() {
        let draft = PolicyDraft {
            name: "ééé".into(),
            ..valid_draft()
        };
        assert!(validate_create(&draft).is_ok());
    }

    #[test]
    fn unknown_type_is_reported() {
        let draft = PolicyDraft {
            policy_type: "finance".into(),
            ..valid_draft()
        };
        let err = validate_create(&draft).unwrap_err();
        assert_eq!(
            err.errors()[0].message,
            "Type must be one of: content, user, risk, cost"
        );
    }

    #[test]
    fn updates_check_only_present_fields() {
        let patch = UpdatePolicyRequest {
            enabled: Some(false),
            ..UpdatePolicyRequest::default()
        };
        assert!(validate_update(&patch).is_ok());

        let patch = UpdatePolicyRequest {
            conditions: Some(Vec::new()),
            priority: Some(-1),
            ..UpdatePolicyRequest::default()
        };
        let err = validate_update(&patch).unwrap_err();
        assert!(err.has_field("conditions"));
        assert!(err.has_field("priority"));
    }
}
