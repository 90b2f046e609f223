//! Run/event surface (C10): event schema and the pluggable publisher trait
//! (spec §6 "Event stream", §9 design notes).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    RunStarted,
    PlanUnitStarted,
    PlanUnitCompleted,
    PlanUnitFailed,
    Warning,
    RunCompleted,
    RunFailed,
}

/// An event conforming to the single schema spec §6 defines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub plan_unit_id: Option<String>,
    pub message: String,
    pub level: EventLevel,
}

impl Event {
    pub fn new(run_id: impl Into<String>, event_type: EventType, level: EventLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            timestamp: Utc::now(),
            run_id: run_id.into(),
            plan_unit_id: None,
            message: message.into(),
            level,
        }
    }

    pub fn for_unit(mut self, unit_id: impl Into<String>) -> Self {
        self.plan_unit_id = Some(unit_id.into());
        self
    }
}

/// Pluggable behaviour the scheduler calls asynchronously and never blocks
/// on; publisher errors are always swallowed (spec §4.2, §5, §7).
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: Event);
}

/// Default publisher: logs via `tracing` at a level matching the event's own.
/// This is the implementation the CLI binary wires up (§9.5).
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventPublisher;

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: Event) {
        match event.level {
            EventLevel::Info => tracing::info!(run_id = %event.run_id, unit = ?event.plan_unit_id, "{}", event.message),
            EventLevel::Warning => tracing::warn!(run_id = %event.run_id, unit = ?event.plan_unit_id, "{}", event.message),
            EventLevel::Error => tracing::error!(run_id = %event.run_id, unit = ?event.plan_unit_id, "{}", event.message),
        }
    }
}

/// In-memory recorder used by tests (spec §9 design notes: "in-memory
/// recorder for tests" is one of the named pluggable implementations).
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

impl EventPublisher for RecordingEventPublisher {
    fn publish(&self, event: Event) {
        self.events.lock().push(event);
    }
}
