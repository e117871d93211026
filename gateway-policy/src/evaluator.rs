//! Condition evaluation over request facts.
//!
//! Every operator compares the string forms of the fact and the operand.
//! A field outside `query`, `request_type`, `user.*` and `context.*` never
//! matches under any operator. A missing attribute inside the `user` or
//! `context` namespace fails the positive operators and satisfies the
//! negated ones.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use regex::Regex;
use serde_json::Value;
use tracing::trace;

use crate::contracts::{FactValue, PolicyRequest, render_number};
use crate::model::{Action, ActionType, Condition, Policy};

/// Operators accepted in a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionOperator {
    /// Exact string equality.
    Equals,
    /// Exact string inequality.
    NotEquals,
    /// Case-insensitive substring.
    Contains,
    /// Negated case-insensitive substring.
    NotContains,
    /// Case-insensitive substring of any list element.
    ContainsAny,
    /// Regular expression match.
    Regex,
    /// Exact match against a list element.
    In,
    /// Exact match against no list element.
    NotIn,
}

impl ConditionOperator {
    /// Every accepted operator.
    pub const ALL: [Self; 8] = [
        Self::Equals,
        Self::NotEquals,
        Self::Contains,
        Self::NotContains,
        Self::ContainsAny,
        Self::Regex,
        Self::In,
        Self::NotIn,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::ContainsAny => "contains_any",
            Self::Regex => "regex",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }

    /// Operators whose operand must be a list.
    #[must_use]
    pub const fn takes_list(self) -> bool {
        matches!(self, Self::ContainsAny | Self::In | Self::NotIn)
    }

    const fn is_negated(self) -> bool {
        matches!(self, Self::NotEquals | Self::NotContains | Self::NotIn)
    }
}

impl Display for ConditionOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| s.to_owned())
    }
}

/// String form of a condition operand.
fn render_operand(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Number(number) => number
            .as_f64()
            .map_or_else(|| number.to_string(), render_number),
        other => FactValue::from(other).to_string(),
    }
}

fn operand_list(value: &Value) -> Option<Vec<String>> {
    value
        .as_array()
        .map(|items| items.iter().map(render_operand).collect())
}

/// Evaluates a single condition against the request.
///
/// Unknown operators and unknown fields never match.
#[must_use]
pub fn evaluate_condition(condition: &Condition, request: &PolicyRequest) -> bool {
    if !PolicyRequest::is_addressable(&condition.field) {
        return false;
    }
    let Ok(operator) = condition.operator.parse::<ConditionOperator>() else {
        return false;
    };

    let Some(fact) = request.fact(&condition.field).render() else {
        return operator.is_negated();
    };

    match operator {
        ConditionOperator::Equals => fact == render_operand(&condition.value),
        ConditionOperator::NotEquals => fact != render_operand(&condition.value),
        ConditionOperator::Contains => contains_folded(&fact, &render_operand(&condition.value)),
        ConditionOperator::NotContains => {
            !contains_folded(&fact, &render_operand(&condition.value))
        }
        ConditionOperator::ContainsAny => operand_list(&condition.value)
            .is_some_and(|items| items.iter().any(|item| contains_folded(&fact, item))),
        ConditionOperator::Regex => condition
            .value
            .as_str()
            .and_then(|pattern| Regex::new(pattern).ok())
            .is_some_and(|re| re.is_match(&fact)),
        ConditionOperator::In => {
            operand_list(&condition.value).is_some_and(|items| items.contains(&fact))
        }
        ConditionOperator::NotIn => {
            operand_list(&condition.value).is_none_or(|items| !items.contains(&fact))
        }
    }
}

fn contains_folded(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Evaluates conditions with AND semantics, stopping at the first failure.
///
/// An empty list is vacuously true; validation keeps empty lists out of
/// persisted policies.
#[must_use]
pub fn evaluate_conditions(conditions: &[Condition], request: &PolicyRequest) -> bool {
    conditions.iter().enumerate().all(|(index, condition)| {
        let matched = evaluate_condition(condition, request);
        trace!(
            index,
            field = %condition.field,
            operator = %condition.operator,
            matched,
            "condition evaluated"
        );
        matched
    })
}

/// Outcome of evaluating one policy against a request.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyMatch {
    /// True when every condition held.
    pub matched: bool,
    /// Actions of a matching policy, verbatim; empty on no match.
    pub actions: Vec<Action>,
}

impl PolicyMatch {
    /// Returns true when a triggered action blocks the request.
    #[must_use]
    pub fn blocks(&self) -> bool {
        self.actions
            .iter()
            .any(|action| action.kind() == Some(ActionType::Block))
    }

    /// User-facing message of the first triggered block action.
    #[must_use]
    pub fn block_message(&self) -> Option<&str> {
        self.actions
            .iter()
            .filter(|action| action.kind() == Some(ActionType::Block))
            .find_map(|action| action.config_str("message"))
    }
}

/// Evaluates a policy, returning its actions when it matches.
#[must_use]
pub fn evaluate_policy(policy: &Policy, request: &PolicyRequest) -> PolicyMatch {
    let matched = evaluate_conditions(&policy.conditions, request);
    PolicyMatch {
        matched,
        actions: if matched {
            policy.actions.clone()
        } else {
            Vec::new()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::UserContext;
    use gateway_primitives::TenantId;
    use serde_json::json;

    fn request(query: &str) -> PolicyRequest {
        PolicyRequest::new(TenantId::new("acme").unwrap(), query)
            .with_request_type("llm_chat")
            .with_user(UserContext {
                role: "analyst".into(),
                ..UserContext::default()
            })
            .with_context("region", json!("eu-west"))
    }

    fn check(field: &str, operator: &str, value: Value, query: &str) -> bool {
        evaluate_condition(&Condition::new(field, operator, value), &request(query))
    }

    #[test]
    fn equality_operators_compare_exactly() {
        assert!(check("request_type", "equals", json!("llm_chat"), "hi"));
        assert!(!check("request_type", "equals", json!("LLM_CHAT"), "hi"));
        assert!(check("user.role", "not_equals", json!("admin"), "hi"));
    }

    #[test]
    fn contains_is_case_insensitive() {
        assert!(check("query", "contains", json!("PASSWORD"), "my password is x"));
        assert!(check("query", "not_contains", json!("secret"), "my password is x"));
        assert!(!check("query", "not_contains", json!("Password"), "my password is x"));
    }

    #[test]
    fn contains_any_requires_a_list() {
        assert!(check("query", "contains_any", json!(["ssn", "Credit"]), "credit card"));
        assert!(!check("query", "contains_any", json!(["ssn"]), "credit card"));
        assert!(!check("query", "contains_any", json!("credit"), "credit card"));
    }

    #[test]
    fn regex_matches_and_tolerates_bad_patterns() {
        assert!(check("query", "regex", json!(r"\d{3}-\d{2}-\d{4}"), "ssn 123-45-6789"));
        assert!(!check("query", "regex", json!("(unclosed"), "anything"));
        assert!(!check("query", "regex", json!(42), "42"));
    }

    #[test]
    fn membership_operators() {
        assert!(check("context.region", "in", json!(["eu-west", "eu-central"]), "q"));
        assert!(!check("context.region", "in", json!(["us-east"]), "q"));
        assert!(check("context.region", "not_in", json!(["us-east"]), "q"));
        assert!(!check("context.region", "in", json!("eu-west"), "q"));
        assert!(check("context.region", "not_in", json!("eu-west"), "q"));
    }

    #[test]
    fn unknown_fields_and_operators_never_match() {
        assert!(!check("headers.host", "equals", json!("x"), "q"));
        assert!(!check("headers.host", "not_equals", json!("x"), "q"));
        assert!(!check("headers.host", "not_contains", json!("x"), "q"));
        assert!(!check("headers.host", "not_in", json!(["x"]), "q"));
        assert!(!check("query", "starts_with", json!("q"), "q"));
    }

    #[test]
    fn absent_facts_satisfy_only_negated_operators() {
        assert!(!check("context.missing", "contains", json!("x"), "q"));
        assert!(check("context.missing", "not_contains", json!("x"), "q"));
        assert!(check("context.missing", "not_in", json!(["x"]), "q"));
    }

    #[test]
    fn empty_literal_facts_compare_as_empty_strings() {
        let request = PolicyRequest::new(TenantId::new("acme").unwrap(), "hello");
        let equals = Condition::new("request_type", "equals", json!(""));
        let member = Condition::new("request_type", "in", json!(["", "sql"]));
        let contains = Condition::new("user.email", "contains", json!(""));
        assert!(evaluate_condition(&equals, &request));
        assert!(evaluate_condition(&member, &request));
        assert!(evaluate_condition(&contains, &request));
    }

    #[test]
    fn numbers_compare_by_string_form() {
        let request = request("q").with_context("score", json!(7));
        let condition = Condition::new("context.score", "equals", json!(7.0));
        assert!(evaluate_condition(&condition, &request));
    }

    #[test]
    fn empty_condition_list_is_vacuously_true() {
        assert!(evaluate_conditions(&[], &request("anything")));
    }

    #[test]
    fn conditions_are_and_combined() {
        let conditions = vec![
            Condition::new("query", "contains", json!("password")),
            Condition::new("user.role", "equals", json!("admin")),
        ];
        assert!(!evaluate_conditions(&conditions, &request("password reset")));
    }
}
