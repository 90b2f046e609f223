//! The data model (spec §3): resources, plans, runs, and the micro-runner
//! wire envelope.

pub mod plan;
pub mod resource;
pub mod run;
pub mod runner;

pub use plan::{ExecutionGraph, GraphNode, Operation, Plan, PlanUnit, UnitEdge};
pub use resource::{DependencyEdge, DependencyKind, Resource, ResourceStatus};
pub use run::{ErrorSnapshot, ExecutionResult, Run, RunStatus, RunSummary, UnitStatus};
