//! Minimal declarative rule language for policies loaded from files
//! (spec §4.8 "Compiler"). Built-in policies are native Rust closures
//! ([`crate::policy::builtins`]); this module exists for operator-authored
//! policies loaded via `load-from-paths`.
//!
//! Grammar, one clause per `deny` block:
//! ```text
//! package <namespace>
//!
//! deny["<message>"] { <path> <op> <literal> }
//! deny["<message>"] { not <path> <op> <literal> }
//! ```
//! `<path>` is a dot-separated lookup into the JSON policy input (e.g.
//! `input.subject.name`). `<op>` is one of `==`, `!=`, `contains`,
//! `lt`, `gt`. `<literal>` is a quoted string, a bare number, or `true`/
//! `false`. A clause with no condition body (`deny["msg"] { true }`)
//! always fires.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{OpError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Eq,
    NotEq,
    Contains,
    Lt,
    Gt,
}

#[derive(Debug, Clone)]
pub struct Condition {
    pub path: String,
    pub op: Op,
    pub literal: Literal,
    pub negate: bool,
}

#[derive(Debug, Clone)]
pub struct DenyClause {
    pub message: String,
    pub condition: Option<Condition>,
}

static CLAUSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)deny\s*\[\s*"([^"]*)"\s*\]\s*\{\s*(.*?)\s*\}"#).unwrap()
});

static CONDITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(not\s+)?([a-zA-Z0-9_.]+)\s*(==|!=|contains|lt|gt)\s*(.+)$"#).unwrap()
});

/// Extracts the `package <name>` namespace header, falling back to
/// `"default"` when absent (spec §4.8 "fallback namespace if absent").
pub fn extract_namespace(body: &str) -> String {
    for line in body.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("package ") {
            let name = rest.trim();
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "default".to_string()
}

/// Parses every `deny[...]{...}` clause in a rule body.
pub fn parse_rule_body(body: &str) -> Result<Vec<DenyClause>> {
    let mut clauses = Vec::new();
    for caps in CLAUSE_RE.captures_iter(body) {
        let message = caps[1].to_string();
        let raw_condition = caps[2].trim();
        let condition = if raw_condition.is_empty() || raw_condition == "true" {
            None
        } else {
            Some(parse_condition(raw_condition)?)
        };
        clauses.push(DenyClause { message, condition });
    }
    if clauses.is_empty() {
        return Err(OpError::validation("rule body contains no 'deny' clauses", None));
    }
    Ok(clauses)
}

fn parse_condition(raw: &str) -> Result<Condition> {
    let caps = CONDITION_RE
        .captures(raw)
        .ok_or_else(|| OpError::validation(format!("unparsable policy condition: '{raw}'"), None))?;
    let negate = caps.get(1).is_some();
    let path = caps[2].to_string();
    let op = match &caps[3] {
        "==" => Op::Eq,
        "!=" => Op::NotEq,
        "contains" => Op::Contains,
        "lt" => Op::Lt,
        "gt" => Op::Gt,
        other => return Err(OpError::validation(format!("unknown operator '{other}'"), None)),
    };
    let literal = parse_literal(caps[4].trim())?;
    Ok(Condition { path, op, literal, negate })
}

fn parse_literal(raw: &str) -> Result<Literal> {
    if let Some(inner) = raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        return Ok(Literal::Str(inner.to_string()));
    }
    if raw == "true" {
        return Ok(Literal::Bool(true));
    }
    if raw == "false" {
        return Ok(Literal::Bool(false));
    }
    raw.parse::<f64>()
        .map(Literal::Num)
        .map_err(|_| OpError::validation(format!("unparsable policy literal: '{raw}'"), None))
}

/// Resolves a dotted path (`input.subject.name`) against a JSON value
/// rooted at `input`.
fn resolve_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn eval_condition(condition: &Condition, input: &Value) -> bool {
    let resolved = resolve_path(input, &condition.path);
    let matched = match (&condition.literal, resolved) {
        (Literal::Str(expected), Some(Value::String(actual))) => match condition.op {
            Op::Eq => actual == expected,
            Op::NotEq => actual != expected,
            Op::Contains => actual.contains(expected.as_str()),
            Op::Lt | Op::Gt => false,
        },
        (Literal::Num(expected), Some(value)) => {
            let actual = value.as_f64();
            match (condition.op, actual) {
                (Op::Eq, Some(a)) => a == *expected,
                (Op::NotEq, Some(a)) => a != *expected,
                (Op::Lt, Some(a)) => a < *expected,
                (Op::Gt, Some(a)) => a > *expected,
                _ => false,
            }
        }
        (Literal::Bool(expected), Some(Value::Bool(actual))) => match condition.op {
            Op::Eq => actual == expected,
            Op::NotEq => actual != expected,
            _ => false,
        },
        (_, None) => matches!(condition.op, Op::NotEq),
        _ => false,
    };
    if condition.negate {
        !matched
    } else {
        matched
    }
}

/// Runs every clause against `input`, returning the messages of clauses
/// whose condition is satisfied (an unconditional clause always fires).
pub fn evaluate_clauses(clauses: &[DenyClause], input: &Value) -> Vec<String> {
    clauses
        .iter()
        .filter(|clause| clause.condition.as_ref().map(|c| eval_condition(c, input)).unwrap_or(true))
        .map(|clause| clause.message.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_package_namespace() {
        let body = "package my-team.rules\n\ndeny[\"x\"] { true }";
        assert_eq!(extract_namespace(body), "my-team.rules");
    }

    #[test]
    fn falls_back_to_default_namespace() {
        assert_eq!(extract_namespace("deny[\"x\"] { true }"), "default");
    }

    #[test]
    fn unconditional_clause_always_fires() {
        let clauses = parse_rule_body("deny[\"always\"] { true }").unwrap();
        let fired = evaluate_clauses(&clauses, &json!({"input": {}}));
        assert_eq!(fired, vec!["always".to_string()]);
    }

    #[test]
    fn equality_condition_matches_string_field() {
        let clauses = parse_rule_body(r#"deny["bad name"] { input.subject.name == "" }"#).unwrap();
        let fired = evaluate_clauses(&clauses, &json!({"input": {"subject": {"name": ""}}}));
        assert_eq!(fired, vec!["bad name".to_string()]);
        let not_fired = evaluate_clauses(&clauses, &json!({"input": {"subject": {"name": "ok"}}}));
        assert!(not_fired.is_empty());
    }

    #[test]
    fn negated_condition_inverts_match() {
        let clauses = parse_rule_body(r#"deny["not admin"] { not input.subject.role == "admin" }"#).unwrap();
        let fired = evaluate_clauses(&clauses, &json!({"input": {"subject": {"role": "user"}}}));
        assert_eq!(fired.len(), 1);
        let not_fired = evaluate_clauses(&clauses, &json!({"input": {"subject": {"role": "admin"}}}));
        assert!(not_fired.is_empty());
    }

    #[test]
    fn numeric_comparison_operators_work() {
        let clauses = parse_rule_body(r#"deny["too many"] { input.count gt 5 }"#).unwrap();
        assert_eq!(evaluate_clauses(&clauses, &json!({"input": {"count": 10}})).len(), 1);
        assert!(evaluate_clauses(&clauses, &json!({"input": {"count": 1}})).is_empty());
    }

    #[test]
    fn empty_rule_body_is_rejected() {
        assert!(parse_rule_body("package foo\n").is_err());
    }
}
