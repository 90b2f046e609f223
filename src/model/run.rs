//! Run and execution-result types (spec §3, §4.2).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OpError;

/// Per-unit terminal (or in-flight) status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UnitStatus::Pending | UnitStatus::Running)
    }
}

/// A snapshot of an `OpError` suitable for attaching to a terminal `ExecutionResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub code: String,
    pub message: String,
    pub resource_id: Option<String>,
}

impl From<&OpError> for ErrorSnapshot {
    fn from(e: &OpError) -> Self {
        Self {
            code: e.code().to_string(),
            message: e.to_string(),
            resource_id: e.resource_id().map(|s| s.to_string()),
        }
    }
}

/// Per-unit record, created when the scheduler begins a unit and finalized
/// when it reaches any terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub unit_id: String,
    pub status: UnitStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorSnapshot>,
    pub new_state: Option<Value>,
}

impl ExecutionResult {
    pub fn started(unit_id: impl Into<String>) -> Self {
        Self {
            unit_id: unit_id.into(),
            status: UnitStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
            new_state: None,
        }
    }

    pub fn finish(&mut self, status: UnitStatus, error: Option<ErrorSnapshot>, new_state: Option<Value>) {
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.error = error;
        self.new_state = new_state;
    }

    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .map(|end| (end - self.started_at).to_std().unwrap_or_default())
    }
}

/// Terminal status of a `Run`, chosen by the table in spec §4.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Partial,
    Failed,
    Cancelled,
}

/// Summary counters maintained across a run's lifetime (spec §3, §8 invariant 1).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: u32,
    pub pending: u32,
    pub running: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl RunSummary {
    /// Implements the spec §4.2 terminal-status decision table.
    pub fn terminal_status(&self, cancellation_requested: bool) -> RunStatus {
        if cancellation_requested {
            return RunStatus::Cancelled;
        }
        if self.failed > 0 && self.succeeded > 0 {
            RunStatus::Partial
        } else if self.failed > 0 {
            RunStatus::Failed
        } else if self.skipped > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Succeeded
        }
    }
}

/// One complete execution attempt of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub plan_id: String,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: RunSummary,
    pub actor: Option<String>,
    pub metadata: HashMap<String, Value>,
}

impl Run {
    pub fn new_pending(id: impl Into<String>, plan_id: impl Into<String>, actor: Option<String>, total: u32) -> Self {
        Self {
            id: id.into(),
            plan_id: plan_id.into(),
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            summary: RunSummary {
                total,
                pending: total,
                ..Default::default()
            },
            actor,
            metadata: HashMap::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(s), Some(e)) => Some((e - s).to_std().unwrap_or_default()),
            _ => None,
        }
    }
}
