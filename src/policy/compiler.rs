//! Policy Compiler (C5, spec §4.8 "Compiler").
//!
//! Extracts a policy's namespace and prepares a reusable evaluation handle
//! bound to `data.<namespace>.deny`. Native (built-in) policies skip text
//! parsing entirely and carry their Rust closure directly.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::policy::model::{Policy, PolicyInput, PolicyViolation};
use crate::policy::rule::{evaluate_clauses, extract_namespace, parse_rule_body, DenyClause};

/// A native policy's evaluation function. Returns raw messages; the caller
/// attaches severity/resource/timestamp the same way a declarative clause's
/// default severity would.
pub type NativeRule = Arc<dyn Fn(&PolicyInput) -> Vec<PolicyViolation> + Send + Sync>;

#[derive(Clone)]
pub enum RuleKind {
    Declarative(Vec<DenyClause>),
    Native(NativeRule),
}

/// A policy bound to its extracted namespace and prepared evaluation
/// handle (spec §3 "Compiled policy").
#[derive(Clone)]
pub struct CompiledPolicy {
    pub policy: Policy,
    pub namespace: String,
    pub query: String,
    pub rule: RuleKind,
}

impl CompiledPolicy {
    /// Compiles a declarative policy by parsing its rule body (spec §4.8
    /// "package/namespace header" + "deny rule").
    pub fn compile(policy: Policy) -> Result<Self> {
        let namespace = extract_namespace(&policy.rule_body);
        let clauses = parse_rule_body(&policy.rule_body)?;
        let query = format!("data.{namespace}.deny");
        Ok(Self {
            policy,
            namespace,
            query,
            rule: RuleKind::Declarative(clauses),
        })
    }

    /// Wraps a native closure as a compiled policy without text parsing.
    pub fn native(policy: Policy, namespace: &str, rule: NativeRule) -> Self {
        let query = format!("data.{namespace}.deny");
        Self {
            policy,
            namespace: namespace.to_string(),
            query,
            rule: RuleKind::Native(rule),
        }
    }

    /// Runs the prepared evaluation handle against `input`, normalizing a
    /// declarative clause's bare message into a full [`PolicyViolation`]
    /// (spec §4.8 "normalized: if the result is a bare string...").
    pub fn evaluate(&self, input: &PolicyInput) -> Vec<PolicyViolation> {
        match &self.rule {
            RuleKind::Native(f) => f(input),
            RuleKind::Declarative(clauses) => {
                let wrapped: Value = serde_json::json!({ "input": input });
                evaluate_clauses(clauses, &wrapped)
                    .into_iter()
                    .map(|message| PolicyViolation {
                        policy_name: self.policy.name.clone(),
                        resource_id: None,
                        message,
                        severity: self.policy.default_severity,
                        remediation: None,
                        timestamp: chrono::Utc::now(),
                    })
                    .collect()
            }
        }
    }
}
