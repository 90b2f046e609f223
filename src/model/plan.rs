//! Plan, plan-unit and execution-graph types (spec §3, §4.1).

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpError, Result};
use crate::model::resource::DependencyKind;

/// The operation a plan unit performs on its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Noop,
}

impl Operation {
    pub fn is_destructive(self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// Mirrors a resource dependency edge at the plan-unit level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitEdge {
    pub target_unit_id: String,
    pub kind: DependencyKind,
}

/// The smallest executable work item: one operation on one resource through
/// one provider binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanUnit {
    pub id: String,
    pub resource_id: String,
    pub operation: Operation,
    pub desired_state: Value,
    pub provider: String,
    pub provider_version: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub edges: Vec<UnitEdge>,
    pub result: Option<crate::model::run::ExecutionResult>,
}

impl PlanUnit {
    pub fn new(id: impl Into<String>, resource_id: impl Into<String>, operation: Operation, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_id: resource_id.into(),
            operation,
            desired_state: Value::Object(Default::default()),
            provider: provider.into(),
            provider_version: None,
            timeout: Duration::from_secs(300),
            max_retries: 0,
            edges: Vec::new(),
            result: None,
        }
    }

    pub fn with_edge(mut self, target_unit_id: impl Into<String>, kind: DependencyKind) -> Self {
        self.edges.push(UnitEdge {
            target_unit_id: target_unit_id.into(),
            kind,
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// `require`/`order` predecessors only — the edges that gate execution.
    pub fn blocking_predecessors(&self) -> impl Iterator<Item = &UnitEdge> {
        self.edges.iter().filter(|e| e.kind.gates_level())
    }
}

/// One node of the execution graph: a plan unit plus its derived level.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub unit_id: String,
    pub level: u32,
}

/// Directed acyclic graph derived from plan-unit dependencies (spec §4.1).
///
/// Built once per plan and immutable afterwards. Every edge goes from a
/// lower-level to a strictly-higher-level node.
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    levels: HashMap<String, u32>,
    depth: u32,
}

impl ExecutionGraph {
    /// Builds the graph from a set of plan units, levelizing by `require`/
    /// `order` edges and detecting cycles via three-color DFS.
    pub fn build(units: &[PlanUnit]) -> Result<Self> {
        let ids: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
        let mut blocking_adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for u in units {
            let preds: Vec<&str> = u
                .blocking_predecessors()
                .map(|e| e.target_unit_id.as_str())
                .collect();
            for p in &preds {
                if !ids.contains(p) {
                    return Err(OpError::validation(
                        format!("plan unit '{}' depends on unknown unit '{}'", u.id, p),
                        Some(u.id.clone()),
                    ));
                }
            }
            blocking_adj.insert(u.id.as_str(), preds);
        }

        detect_cycle(units, &blocking_adj)?;

        let levels = compute_levels(units, &blocking_adj);
        let depth = levels.values().copied().max().map(|m| m + 1).unwrap_or(0);

        Ok(Self { levels, depth })
    }

    pub fn level_of(&self, unit_id: &str) -> Option<u32> {
        self.levels.get(unit_id).copied()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Groups unit ids by ascending level — the cohorts the scheduler dispatches.
    pub fn cohorts(&self) -> Vec<Vec<String>> {
        let mut cohorts: Vec<Vec<String>> = vec![Vec::new(); self.depth as usize];
        for (id, level) in &self.levels {
            cohorts[*level as usize].push(id.clone());
        }
        cohorts
    }
}

/// Three-color DFS cycle detection over the `require`/`order` sub-graph.
/// Fails with `OpError::CycleDetected` naming every node on the discovered cycle.
fn detect_cycle(units: &[PlanUnit], blocking_adj: &HashMap<&str, Vec<&str>>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color: HashMap<&str, Color> = units.iter().map(|u| (u.id.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        blocking_adj: &HashMap<&'a str, Vec<&'a str>>,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        color.insert(node, Color::Gray);
        stack.push(node);

        if let Some(preds) = blocking_adj.get(node) {
            for &p in preds {
                match color.get(p).copied().unwrap_or(Color::White) {
                    Color::White => visit(p, blocking_adj, color, stack)?,
                    Color::Gray => {
                        let start = stack.iter().position(|&n| n == p).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(p.to_string());
                        return Err(OpError::cycle_detected(cycle));
                    }
                    Color::Black => {}
                }
            }
        }

        stack.pop();
        color.insert(node, Color::Black);
        Ok(())
    }

    for u in units {
        if color[u.id.as_str()] == Color::White {
            visit(u.id.as_str(), blocking_adj, &mut color, &mut stack)?;
        }
    }
    Ok(())
}

/// `level(node) = 0` if no incoming blocking edges; otherwise
/// `1 + max(level(predecessor))`. Computed bottom-up via repeated relaxation
/// over the (already known-acyclic) blocking sub-graph.
fn compute_levels(units: &[PlanUnit], blocking_adj: &HashMap<&str, Vec<&str>>) -> HashMap<String, u32> {
    let mut levels: HashMap<String, u32> = HashMap::new();
    let mut memo: HashMap<&str, u32> = HashMap::new();

    fn level_of<'a>(node: &'a str, blocking_adj: &HashMap<&'a str, Vec<&'a str>>, memo: &mut HashMap<&'a str, u32>) -> u32 {
        if let Some(&lvl) = memo.get(node) {
            return lvl;
        }
        let preds = blocking_adj.get(node).cloned().unwrap_or_default();
        let lvl = if preds.is_empty() {
            0
        } else {
            1 + preds
                .iter()
                .map(|p| level_of(p, blocking_adj, memo))
                .max()
                .unwrap_or(0)
        };
        memo.insert(node, lvl);
        lvl
    }

    for u in units {
        let lvl = level_of(u.id.as_str(), blocking_adj, &mut memo);
        levels.insert(u.id.clone(), lvl);
    }
    levels
}

/// An ordered collection of plan units plus their derived execution graph.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: String,
    pub units: Vec<PlanUnit>,
    pub graph: ExecutionGraph,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn build(id: impl Into<String>, units: Vec<PlanUnit>) -> Result<Self> {
        let graph = ExecutionGraph::build(&units)?;
        Ok(Self {
            id: id.into(),
            units,
            graph,
            created_at: Utc::now(),
        })
    }

    pub fn unit(&self, id: &str) -> Option<&PlanUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// BFS-ordered ids of the `require` predecessors that must succeed before `unit_id`.
    pub fn require_predecessors(&self, unit_id: &str) -> Vec<&str> {
        self.unit(unit_id)
            .map(|u| {
                u.edges
                    .iter()
                    .filter(|e| e.kind == DependencyKind::Require)
                    .map(|e| e.target_unit_id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn order_predecessors(&self, unit_id: &str) -> Vec<&str> {
        self.unit(unit_id)
            .map(|u| {
                u.edges
                    .iter()
                    .filter(|e| e.kind == DependencyKind::Order)
                    .map(|e| e.target_unit_id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reachability from `unit_id` following blocking edges, used only for
    /// diagnostics (e.g. explaining why a plan was rejected).
    pub fn blocking_closure(&self, unit_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(unit_id.to_string());
        while let Some(n) = queue.pop_front() {
            if let Some(u) = self.unit(&n) {
                for e in u.blocking_predecessors() {
                    if seen.insert(e.target_unit_id.clone()) {
                        queue.push_back(e.target_unit_id.clone());
                    }
                }
            }
        }
        seen
    }
}
