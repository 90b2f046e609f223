//! The five built-in policies always loaded at construction time
//! (spec §4.8 "Built-in policy set"). Implemented as native Rust closures
//! rather than compiled rule text — the grammar in [`crate::policy::rule`]
//! exists for operator-authored policies, not these.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::policy::compiler::CompiledPolicy;
use crate::policy::model::{Policy, PolicyInput, PolicyViolation, Severity};

const VALID_ENVIRONMENTS: &[&str] = &["development", "staging", "production", "test"];
const PRE_RELEASE_MARKERS: &[&str] = &["alpha", "beta", "rc"];

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap());

fn violation(policy_name: &str, message: impl Into<String>, severity: Severity, resource_id: Option<String>) -> PolicyViolation {
    PolicyViolation {
        policy_name: policy_name.to_string(),
        resource_id,
        message: message.into(),
        severity,
        remediation: None,
        timestamp: Utc::now(),
    }
}

/// 1. *resource-naming*: `name` present, lowercase `[a-z0-9-]+`, length
/// 3-63, no leading/trailing hyphen.
fn resource_naming(input: &PolicyInput) -> Vec<PolicyViolation> {
    let Some(name) = input.subject.get("name").and_then(Value::as_str) else {
        return Vec::new();
    };
    let resource_id = input.subject.get("id").and_then(Value::as_str).map(String::from);
    let mut issues = Vec::new();
    if name.is_empty() {
        issues.push("resource name must not be empty".to_string());
    } else {
        if name.len() < 3 || name.len() > 63 {
            issues.push(format!("resource name '{name}' must be 3-63 characters"));
        }
        if name.starts_with('-') || name.ends_with('-') {
            issues.push(format!("resource name '{name}' must not start or end with a hyphen"));
        }
        if !NAME_PATTERN.is_match(name) {
            issues.push(format!("resource name '{name}' must match [a-z0-9-]+"));
        }
    }
    issues
        .into_iter()
        .map(|msg| violation("resource-naming", msg, Severity::Error, resource_id.clone()))
        .collect()
}

/// 2. *required-labels*: `env` and `owner` present and non-empty; `env`
/// is one of the four recognized environment names.
fn required_labels(input: &PolicyInput) -> Vec<PolicyViolation> {
    let Some(labels) = input.subject.get("labels").and_then(Value::as_object) else {
        return Vec::new();
    };
    let resource_id = input.subject.get("id").and_then(Value::as_str).map(String::from);
    let mut violations = Vec::new();
    for required in ["env", "owner"] {
        let value = labels.get(required).and_then(Value::as_str).unwrap_or("");
        if value.is_empty() {
            violations.push(violation(
                "required-labels",
                format!("label '{required}' is required and must be non-empty"),
                Severity::Error,
                resource_id.clone(),
            ));
        }
    }
    if let Some(env) = labels.get("env").and_then(Value::as_str) {
        if !env.is_empty() && !VALID_ENVIRONMENTS.contains(&env) {
            violations.push(violation(
                "required-labels",
                format!("label 'env' value '{env}' is not one of {VALID_ENVIRONMENTS:?}"),
                Severity::Error,
                resource_id.clone(),
            ));
        }
    }
    violations
}

/// 3. *state-drift*: when both are present, the fraction of top-level keys
/// that differ between desired and actual state must not exceed 10%.
/// Intentionally shallow per the documented open-question resolution —
/// see DESIGN.md.
fn state_drift(input: &PolicyInput) -> Vec<PolicyViolation> {
    let desired = input.subject.get("desired_state").and_then(Value::as_object);
    let actual = input.subject.get("actual_state").and_then(Value::as_object);
    let (Some(desired), Some(actual)) = (desired, actual) else {
        return Vec::new();
    };
    if desired.is_empty() && actual.is_empty() {
        return Vec::new();
    }
    let mut keys: std::collections::HashSet<&String> = desired.keys().collect();
    keys.extend(actual.keys());
    let differing = keys.iter().filter(|k| desired.get(**k) != actual.get(**k)).count();
    let fraction = differing as f64 / keys.len() as f64;
    if fraction > 0.10 {
        let resource_id = input.subject.get("id").and_then(Value::as_str).map(String::from);
        vec![violation(
            "state-drift",
            format!("{:.0}% of top-level keys differ between desired and actual state (> 10% threshold)", fraction * 100.0),
            Severity::Warning,
            resource_id,
        )]
    } else {
        Vec::new()
    }
}

/// 4. *operation-restrictions*: destructive ops forbidden in production
/// unless dry-run; `critical` resources may never be deleted; plans
/// deleting > 5 resources warn.
fn operation_restrictions(input: &PolicyInput) -> Vec<PolicyViolation> {
    let Some(units) = input.subject.get("units").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut violations = Vec::new();
    let mut delete_count = 0;
    for unit in units {
        let operation = unit.get("operation").and_then(Value::as_str).unwrap_or("");
        let resource_id = unit.get("resource_id").and_then(Value::as_str).map(String::from);
        let critical = unit.get("critical").and_then(Value::as_str).map(|v| v == "true").unwrap_or(false);
        let destructive = matches!(operation, "delete" | "recreate");

        if operation == "delete" {
            delete_count += 1;
        }
        if critical && operation == "delete" {
            violations.push(violation(
                "operation-restrictions",
                "resource marked critical=\"true\" may never be deleted",
                Severity::Critical,
                resource_id.clone(),
            ));
        }
        if destructive && input.context.environment == "production" && !input.context.dry_run {
            violations.push(violation(
                "operation-restrictions",
                format!("destructive operation '{operation}' is forbidden in production outside dry-run"),
                Severity::Error,
                resource_id,
            ));
        }
    }
    if delete_count > 5 {
        violations.push(violation(
            "operation-restrictions",
            format!("plan deletes {delete_count} resources, exceeding the 5-resource review threshold"),
            Severity::Warning,
            None,
        ));
    }
    violations
}

/// 5. *provider-versioning*: plan units should declare a provider version
/// meeting declared minimums; pre-release versions in production warn.
fn provider_versioning(input: &PolicyInput) -> Vec<PolicyViolation> {
    let Some(units) = input.subject.get("units").and_then(Value::as_array) else {
        return Vec::new();
    };
    let minimums = input.subject.get("provider_minimums").and_then(Value::as_object);
    let mut violations = Vec::new();
    for unit in units {
        let provider = unit.get("provider").and_then(Value::as_str).unwrap_or("");
        let resource_id = unit.get("resource_id").and_then(Value::as_str).map(String::from);
        let version = unit.get("provider_version").and_then(Value::as_str);
        let Some(version) = version else {
            violations.push(violation(
                "provider-versioning",
                format!("plan unit for provider '{provider}' does not declare a provider version"),
                Severity::Warning,
                resource_id,
            ));
            continue;
        };
        if let Some(minimums) = minimums {
            if let Some(min_version) = minimums.get(provider).and_then(Value::as_str) {
                if version_less_than(version, min_version) {
                    violations.push(violation(
                        "provider-versioning",
                        format!("provider '{provider}' version '{version}' is below the required minimum '{min_version}'"),
                        Severity::Warning,
                        resource_id.clone(),
                    ));
                }
            }
        }
        if input.context.environment == "production" && PRE_RELEASE_MARKERS.iter().any(|m| version.contains(m)) {
            violations.push(violation(
                "provider-versioning",
                format!("provider '{provider}' pre-release version '{version}' is used in production"),
                Severity::Warning,
                resource_id,
            ));
        }
    }
    violations
}

fn version_less_than(a: &str, b: &str) -> bool {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(va), Ok(vb)) => va < vb,
        _ => a < b,
    }
}

/// Constructs the five always-loaded policies (spec §4.8).
pub fn builtin_policies() -> Vec<CompiledPolicy> {
    vec![
        CompiledPolicy::native(
            Policy::new("resource-naming", "<native>", Severity::Error),
            "builtin.resource_naming",
            Arc::new(resource_naming),
        ),
        CompiledPolicy::native(
            Policy::new("required-labels", "<native>", Severity::Error),
            "builtin.required_labels",
            Arc::new(required_labels),
        ),
        CompiledPolicy::native(
            Policy::new("state-drift", "<native>", Severity::Warning),
            "builtin.state_drift",
            Arc::new(state_drift),
        ),
        CompiledPolicy::native(
            Policy::new("operation-restrictions", "<native>", Severity::Critical),
            "builtin.operation_restrictions",
            Arc::new(operation_restrictions),
        ),
        CompiledPolicy::native(
            Policy::new("provider-versioning", "<native>", Severity::Warning),
            "builtin.provider_versioning",
            Arc::new(provider_versioning),
        ),
    ]
}
