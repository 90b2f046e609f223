//! Policy Evaluator (C6, spec §4.8 "Evaluator").
//!
//! Runs every enabled compiled policy against one input and aggregates
//! the result. A single policy panicking or otherwise misbehaving must
//! not tear down the rest of the evaluation — each policy's closure is
//! run behind `catch_unwind` and downgraded to a warning on panic, the
//! same isolation posture the teacher's `ExecutionEngine` applies to a
//! single failing task within a cohort.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::warn;

use crate::model::plan::Plan;
use crate::model::resource::Resource;
use crate::policy::model::{PolicyContext, PolicyInput, PolicyResult, PolicyViolation, Severity};
use crate::policy::store::PolicyStore;

#[derive(Clone)]
pub struct PolicyEvaluator {
    store: Arc<PolicyStore>,
}

impl PolicyEvaluator {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    /// Evaluates an arbitrary configuration document against every
    /// enabled policy (spec §4.8 "evaluate(config)").
    pub fn evaluate(&self, config: &serde_json::Value, context: PolicyContext) -> PolicyResult {
        self.run(config.clone(), context)
    }

    /// Evaluates a plan's units against every enabled policy (spec §4.8
    /// "evaluate-plan").
    pub fn evaluate_plan(&self, plan: &Plan, context: PolicyContext) -> PolicyResult {
        self.run(self.plan_subject(plan), context)
    }

    /// Evaluates a single resource against every enabled policy (spec
    /// §4.8 "evaluate-resource").
    pub fn evaluate_resource(&self, resource: &Resource, context: PolicyContext) -> PolicyResult {
        self.run(to_value(resource), context)
    }

    fn plan_subject(&self, plan: &Plan) -> serde_json::Value {
        let units: Vec<serde_json::Value> = plan
            .units
            .iter()
            .map(|unit| {
                // `critical` is sourced from the resource's own labels, carried
                // through on `desired_state.labels` — a plan unit has no
                // dedicated criticality field of its own.
                let critical = unit
                    .desired_state
                    .get("labels")
                    .and_then(|labels| labels.get("critical"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("false");
                serde_json::json!({
                    "id": unit.id,
                    "resource_id": unit.resource_id,
                    "operation": operation_name(&unit.operation),
                    "provider": unit.provider,
                    "provider_version": unit.provider_version,
                    "critical": critical,
                })
            })
            .collect();
        serde_json::json!({ "id": plan.id, "units": units })
    }

    fn run(&self, subject: serde_json::Value, context: PolicyContext) -> PolicyResult {
        let start = Instant::now();
        let input = PolicyInput { subject, context };
        let policies = self.store.enabled();
        let mut evaluated = Vec::with_capacity(policies.len());
        let mut findings: Vec<PolicyViolation> = Vec::new();

        for compiled in &policies {
            evaluated.push(compiled.policy.name.clone());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| compiled.evaluate(&input)));
            match outcome {
                Ok(violations) => findings.extend(violations),
                Err(_) => {
                    warn!(policy = %compiled.policy.name, "policy evaluation panicked, downgrading to warning");
                    findings.push(PolicyViolation {
                        policy_name: compiled.policy.name.clone(),
                        resource_id: None,
                        message: "policy evaluation failed internally and was skipped".to_string(),
                        severity: Severity::Warning,
                        remediation: None,
                        timestamp: chrono::Utc::now(),
                    });
                }
            }
        }

        PolicyResult::aggregate(evaluated, findings, start.elapsed())
    }
}

fn operation_name(operation: &crate::model::plan::Operation) -> &'static str {
    use crate::model::plan::Operation;
    match operation {
        Operation::Create => "create",
        Operation::Read => "read",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Noop => "noop",
    }
}

fn to_value<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::builtins::builtin_policies;
    use crate::policy::store::PolicyStore;

    fn evaluator_with_builtins() -> PolicyEvaluator {
        let store = Arc::new(PolicyStore::new());
        for policy in builtin_policies() {
            store.insert(policy);
        }
        PolicyEvaluator::new(store)
    }

    #[test]
    fn evaluate_resource_runs_all_builtins() {
        let evaluator = evaluator_with_builtins();
        let result = evaluator.evaluate(
            &serde_json::json!({"id": "r1", "name": "Bad_Name", "labels": {}}),
            PolicyContext::default(),
        );
        assert_eq!(result.evaluated_policy_names.len(), 5);
        assert!(!result.allowed);
    }

    #[test]
    fn evaluate_clean_config_is_allowed() {
        let evaluator = evaluator_with_builtins();
        let result = evaluator.evaluate(
            &serde_json::json!({"id": "r1", "name": "web-server", "labels": {"env": "development", "owner": "team-a"}}),
            PolicyContext::default(),
        );
        assert!(result.allowed);
        assert!(result.violations.is_empty());
    }
}
