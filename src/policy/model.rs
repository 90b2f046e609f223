//! Policy data model (spec §3): declared policies, their compiled form,
//! and the violation/result shapes the evaluator produces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// `allowed = false` iff some violation is at least this severe
    /// (spec §3 invariant).
    pub fn blocks(self) -> bool {
        matches!(self, Severity::Error | Severity::Critical)
    }
}

/// A named, declarative rule (spec §3 "Policy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub description: String,
    pub rule_body: String,
    pub default_severity: Severity,
    pub enabled: bool,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Policy {
    pub fn new(name: impl Into<String>, rule_body: impl Into<String>, default_severity: Severity) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            rule_body: rule_body.into(),
            default_severity,
            enabled: true,
            tags: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// What the policy is being evaluated against, plus the surrounding
/// execution context (spec §4.8 "policy-input").
#[derive(Debug, Clone, Serialize)]
pub struct PolicyInput {
    pub subject: serde_json::Value,
    pub context: PolicyContext,
}

#[derive(Debug, Clone, Serialize)]
pub struct PolicyContext {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub environment: String,
    pub dry_run: bool,
    pub user: String,
    pub metadata: HashMap<String, String>,
}

impl Default for PolicyContext {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            operation: String::new(),
            environment: "development".into(),
            dry_run: false,
            user: String::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A single finding produced by one compiled rule against one input
/// (spec §3 "Policy violation").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub policy_name: String,
    pub resource_id: Option<String>,
    pub message: String,
    pub severity: Severity,
    pub remediation: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated outcome of one `evaluate*` call (spec §3 "Policy result").
#[derive(Debug, Clone, Serialize)]
pub struct PolicyResult {
    pub allowed: bool,
    pub violations: Vec<PolicyViolation>,
    pub warnings: Vec<PolicyViolation>,
    pub evaluated_policy_names: Vec<String>,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

impl PolicyResult {
    /// Splits raw findings into blocking violations vs. warnings and
    /// derives `allowed` (spec §3 invariant, §4.8 "aggregate is false iff").
    pub fn aggregate(evaluated_policy_names: Vec<String>, findings: Vec<PolicyViolation>, duration: Duration) -> Self {
        let (violations, warnings): (Vec<_>, Vec<_>) = findings.into_iter().partition(|v| v.severity.blocks());
        Self {
            allowed: violations.is_empty(),
            violations,
            warnings,
            evaluated_policy_names,
            duration,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_blocks_only_error_and_critical() {
        assert!(!Severity::Info.blocks());
        assert!(!Severity::Warning.blocks());
        assert!(Severity::Error.blocks());
        assert!(Severity::Critical.blocks());
    }

    #[test]
    fn aggregate_is_disallowed_when_any_blocking_violation_present() {
        let findings = vec![
            PolicyViolation {
                policy_name: "p1".into(),
                resource_id: None,
                message: "warn".into(),
                severity: Severity::Warning,
                remediation: None,
                timestamp: Utc::now(),
            },
            PolicyViolation {
                policy_name: "p2".into(),
                resource_id: None,
                message: "bad".into(),
                severity: Severity::Error,
                remediation: None,
                timestamp: Utc::now(),
            },
        ];
        let result = PolicyResult::aggregate(vec!["p1".into(), "p2".into()], findings, Duration::from_millis(1));
        assert!(!result.allowed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn aggregate_is_allowed_when_only_warnings() {
        let findings = vec![PolicyViolation {
            policy_name: "p1".into(),
            resource_id: None,
            message: "warn".into(),
            severity: Severity::Warning,
            remediation: None,
            timestamp: Utc::now(),
        }];
        let result = PolicyResult::aggregate(vec!["p1".into()], findings, Duration::from_millis(1));
        assert!(result.allowed);
    }
}
