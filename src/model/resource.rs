//! Resource and dependency-edge types (spec §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpError, Result};

static ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

/// The three dependency-edge kinds a resource may declare (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Target must succeed before the source may run.
    Require,
    /// Target's change should trigger source handlers, non-blocking.
    Notify,
    /// Target must reach any terminal state before the source runs.
    Order,
}

impl DependencyKind {
    /// `require` and `order` contribute to level assignment; `notify` does not.
    pub fn gates_level(self) -> bool {
        !matches!(self, DependencyKind::Notify)
    }
}

/// A single dependency edge: `(target-resource-id, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub target_id: String,
    pub kind: DependencyKind,
}

impl DependencyEdge {
    pub fn new(target_id: impl Into<String>, kind: DependencyKind) -> Self {
        Self {
            target_id: target_id.into(),
            kind,
        }
    }
}

/// Lifecycle status of a `Resource` as last observed by a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Pending,
    Applied,
    Failed,
    Tainted,
}

/// A declaratively-described target entity (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// `namespace.kind`
    pub type_tag: String,
    pub name: String,
    pub config: Value,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub dependencies: Vec<DependencyEdge>,
    pub selector: Option<String>,
    pub provider_override: Option<String>,
    pub status: ResourceStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    pub fn new(id: impl Into<String>, type_tag: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_resource_id(&id)?;
        let now = Utc::now();
        Ok(Self {
            id,
            type_tag: type_tag.into(),
            name: name.into(),
            config: Value::Object(Default::default()),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            dependencies: Vec::new(),
            selector: None,
            provider_override: None,
            status: ResourceStatus::Pending,
            version: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_dependency(mut self, edge: DependencyEdge) -> Self {
        self.dependencies.push(edge);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Validates the resource identifier against spec §3: `^[a-zA-Z0-9_-]+$`.
pub fn validate_resource_id(id: &str) -> Result<()> {
    if id.is_empty() || !ID_PATTERN.is_match(id) {
        return Err(OpError::validation(
            format!("resource id '{id}' does not match ^[a-zA-Z0-9_-]+$"),
            Some(id.to_string()),
        ));
    }
    Ok(())
}

/// Checks the `Config`-level invariant that resource ids are unique.
pub fn validate_unique_ids<'a>(resources: impl IntoIterator<Item = &'a Resource>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for r in resources {
        if !seen.insert(r.id.as_str()) {
            return Err(OpError::validation(
                format!("duplicate resource id '{}'", r.id),
                Some(r.id.clone()),
            ));
        }
    }
    Ok(())
}
