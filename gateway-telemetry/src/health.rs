//! Aggregated health report.

use serde::Serialize;

/// Status of a single component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Whether the component is healthy.
    pub healthy: bool,
    /// Optional detail for unhealthy components.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentHealth {
    /// Healthy component.
    #[must_use]
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            message: None,
        }
    }

    /// Unhealthy component with a reason.
    #[must_use]
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Overall health: healthy only while every check is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// `"healthy"` or `"unhealthy"`.
    pub status: &'static str,
    /// Individual checks.
    pub checks: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Empty, healthy report.
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: "healthy",
            checks: Vec::new(),
        }
    }

    /// Adds a check, downgrading the report when it failed.
    pub fn add_check(&mut self, check: ComponentHealth) {
        if !check.healthy {
            self.status = "unhealthy";
        }
        self.checks.push(check);
    }

    /// Adds a check and returns the report.
    #[must_use]
    pub fn with_check(mut self, check: ComponentHealth) -> Self {
        self.add_check(check);
        self
    }

    /// Returns `true` when every check passed.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_failing_check_marks_the_report_unhealthy() {
        let report = HealthReport::new()
            .with_check(ComponentHealth::healthy("metrics"))
            .with_check(ComponentHealth::unhealthy("audit", "ping failed"));
        assert!(!report.is_healthy());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert!(json["checks"][0].get("message").is_none());
    }
}
