//! The parallel execution scheduler (C8) — the central core (spec §4.2, §5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{OpError, Result};
use crate::model::{ExecutionResult, Plan, PlanUnit, Run, RunStatus, RunSummary, UnitStatus};
use crate::scheduler::backoff::{base_delay, compute_backoff};
use crate::scheduler::events::{Event, EventLevel, EventPublisher, EventType};
use crate::scheduler::run_store::RunStore;

/// Options controlling one `schedule` call (spec §4.2).
#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub max_parallel: Option<usize>,
    pub fail_fast: bool,
    pub dry_run: bool,
    pub delay: Option<Duration>,
    pub user: Option<String>,
}

impl Default for ScheduleOptions {
    fn default() -> Self {
        Self {
            max_parallel: None,
            fail_fast: false,
            dry_run: false,
            delay: None,
            user: None,
        }
    }
}

/// The capability interface the scheduler dispatches plan-unit operations
/// through — a provider registry/runtime pair in production, a fake in
/// tests (spec §9 design notes: "consumed as capability interfaces, not
/// concrete types").
#[async_trait::async_trait]
pub trait ProviderDispatch: Send + Sync {
    async fn dispatch(&self, unit: &PlanUnit) -> Result<Value>;
}

struct RunState {
    run: RwLock<Run>,
    unit_status: RwLock<HashMap<String, UnitStatus>>,
    unit_results: RwLock<HashMap<String, ExecutionResult>>,
    cancelled: AtomicBool,
}

impl RunState {
    fn new(run: Run) -> Self {
        Self {
            run: RwLock::new(run),
            unit_status: RwLock::new(HashMap::new()),
            unit_results: RwLock::new(HashMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    fn status_of(&self, unit_id: &str) -> UnitStatus {
        self.unit_status
            .read()
            .get(unit_id)
            .copied()
            .unwrap_or(UnitStatus::Pending)
    }

    fn set_status(&self, unit_id: &str, status: UnitStatus) {
        self.unit_status.write().insert(unit_id.to_string(), status);
    }

    fn set_result(&self, result: ExecutionResult) {
        self.unit_results.write().insert(result.unit_id.clone(), result);
    }

    /// Tallies the current unit-status map into a `RunSummary` (spec §8
    /// invariant 1). `Cancelled` units are folded into `skipped`, since the
    /// spec's `Run` fields have no separate cancelled counter — see DESIGN.md.
    fn summarize(&self, total: u32) -> RunSummary {
        let statuses = self.unit_status.read();
        let mut s = RunSummary {
            total,
            ..Default::default()
        };
        for status in statuses.values() {
            match status {
                UnitStatus::Pending => s.pending += 1,
                UnitStatus::Running => s.running += 1,
                UnitStatus::Succeeded => s.succeeded += 1,
                UnitStatus::Failed => s.failed += 1,
                UnitStatus::Skipped | UnitStatus::Cancelled => s.skipped += 1,
            }
        }
        s.pending += total.saturating_sub(statuses.len() as u32);
        s
    }
}

/// Level-by-level parallel driver with retry, cancellation, and summary
/// (C8, spec §4.2).
pub struct Scheduler {
    max_parallel_default: usize,
    backoff_cap: Duration,
    run_store: Arc<dyn RunStore>,
    publisher: Arc<dyn EventPublisher>,
    dispatch: Arc<dyn ProviderDispatch>,
    runs: DashMap<String, Arc<RunState>>,
}

impl Scheduler {
    pub fn new(
        max_parallel_default: usize,
        backoff_cap: Duration,
        run_store: Arc<dyn RunStore>,
        publisher: Arc<dyn EventPublisher>,
        dispatch: Arc<dyn ProviderDispatch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_parallel_default: if max_parallel_default == 0 { 10 } else { max_parallel_default },
            backoff_cap,
            run_store,
            publisher,
            dispatch,
            runs: DashMap::new(),
        })
    }

    /// `schedule(plan, options) -> run-id`. Validates the plan, creates a
    /// pending run, persists it, and begins asynchronous execution.
    pub async fn schedule(self: &Arc<Self>, plan: Plan, options: ScheduleOptions) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let total = plan.units.len() as u32;
        let run = Run::new_pending(run_id.clone(), plan.id.clone(), options.user.clone(), total);
        self.run_store.save_run(&run).await?;

        let state = Arc::new(RunState::new(run));
        self.runs.insert(run_id.clone(), state.clone());

        let this = self.clone();
        let plan = Arc::new(plan);
        let returned_id = run_id.clone();
        tokio::spawn(async move {
            this.drive(run_id, plan, options, state).await;
        });

        Ok(returned_id)
    }

    pub async fn get_status(&self, run_id: &str) -> Result<Run> {
        if let Some(state) = self.runs.get(run_id) {
            return Ok(state.run.read().clone());
        }
        self.run_store.get_run(run_id).await
    }

    /// Flags the run for graceful termination; observed cooperatively.
    pub fn cancel(&self, run_id: &str) -> Result<()> {
        let state = self
            .runs
            .get(run_id)
            .ok_or_else(|| OpError::validation(format!("run '{run_id}' not found"), None))?;
        state.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drive(self: Arc<Self>, run_id: String, plan: Arc<Plan>, options: ScheduleOptions, state: Arc<RunState>) {
        {
            let mut run = state.run.write();
            run.start();
        }
        let started_snapshot = state.run.read().clone();
        let _ = self.run_store.save_run(&started_snapshot).await;
        self.publisher.publish(Event::new(&run_id, EventType::RunStarted, EventLevel::Info, "run started"));

        if let Some(delay) = options.delay {
            tokio::time::sleep(delay).await;
        }

        let cohorts = plan.graph.cohorts();
        let mut fail_fast_triggered = false;

        for (level, unit_ids) in cohorts.iter().enumerate() {
            if state.cancelled.load(Ordering::SeqCst) {
                break;
            }
            if fail_fast_triggered {
                break;
            }
            debug!(run_id = %run_id, level, count = unit_ids.len(), "dispatching cohort");

            let configured = options.max_parallel.filter(|m| *m > 0).unwrap_or(self.max_parallel_default);
            let pool_size = configured.min(self.max_parallel_default).min(unit_ids.len().max(1));
            let semaphore = Arc::new(Semaphore::new(pool_size.max(1)));

            let mut handles = Vec::with_capacity(unit_ids.len());
            for unit_id in unit_ids {
                let unit = match plan.unit(unit_id) {
                    Some(u) => u.clone(),
                    None => continue,
                };
                let this = self.clone();
                let plan = plan.clone();
                let state = state.clone();
                let run_id = run_id.clone();
                let dry_run = options.dry_run;
                let semaphore = semaphore.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    if state.cancelled.load(Ordering::SeqCst) {
                        state.set_status(&unit.id, UnitStatus::Cancelled);
                        return;
                    }
                    this.execute_unit(&run_id, &plan, &unit, &state, dry_run).await;
                }));
            }

            for h in handles {
                let _ = h.await;
            }

            let cohort_failed = unit_ids.iter().any(|id| state.status_of(id) == UnitStatus::Failed);
            if options.fail_fast && cohort_failed {
                fail_fast_triggered = true;
                self.cancel_remaining(&cohorts, level + 1, &state);
            }
        }

        if state.cancelled.load(Ordering::SeqCst) {
            self.cancel_remaining(&cohorts, 0, &state);
        }

        let total = plan.units.len() as u32;
        let summary = state.summarize(total);
        let final_status = summary.terminal_status(state.cancelled.load(Ordering::SeqCst));

        {
            let mut run = state.run.write();
            run.summary = summary;
            run.finish(final_status);
        }
        let snapshot = state.run.read().clone();
        let _ = self.run_store.save_run(&snapshot).await;

        let (event_type, level, msg) = if final_status == RunStatus::Failed {
            (EventType::RunFailed, EventLevel::Error, "run failed")
        } else {
            (EventType::RunCompleted, EventLevel::Info, "run completed")
        };
        self.publisher.publish(Event::new(&run_id, event_type, level, msg));
    }

    fn cancel_remaining(&self, cohorts: &[Vec<String>], from_level: usize, state: &RunState) {
        for cohort in cohorts.iter().skip(from_level) {
            for unit_id in cohort {
                if !state.status_of(unit_id).is_terminal() {
                    state.set_status(unit_id, UnitStatus::Cancelled);
                }
            }
        }
    }

    async fn execute_unit(&self, run_id: &str, plan: &Plan, unit: &PlanUnit, state: &RunState, dry_run: bool) {
        if let Some(reason) = self.check_gating(plan, unit, state) {
            state.set_status(&unit.id, UnitStatus::Skipped);
            let mut result = ExecutionResult::started(&unit.id);
            result.finish(
                UnitStatus::Skipped,
                Some(crate::model::ErrorSnapshot {
                    code: "DEPENDENCY_FAILED".into(),
                    message: reason,
                    resource_id: Some(unit.resource_id.clone()),
                }),
                None,
            );
            state.set_result(result);
            return;
        }

        state.set_status(&unit.id, UnitStatus::Running);
        let mut result = ExecutionResult::started(&unit.id);
        self.publisher.publish(
            Event::new(run_id, EventType::PlanUnitStarted, EventLevel::Info, format!("unit '{}' started", unit.id)).for_unit(&unit.id),
        );

        enum Outcome {
            Succeeded(Value),
            Failed(OpError),
            Cancelled,
        }

        let mut attempt: u32 = 0;
        let outcome = loop {
            if state.cancelled.load(Ordering::SeqCst) {
                break Outcome::Cancelled;
            }

            let attempt_result = if dry_run {
                Ok(unit.desired_state.clone())
            } else {
                match tokio::time::timeout(unit.timeout, self.dispatch.dispatch(unit)).await {
                    Ok(inner) => inner,
                    Err(_) => Err(OpError::timeout(
                        format!("unit '{}' attempt {} exceeded its timeout", unit.id, attempt + 1),
                        Some(unit.resource_id.clone()),
                    )),
                }
            };

            match attempt_result {
                Ok(new_state) => break Outcome::Succeeded(new_state),
                Err(e) => {
                    let retryable = e.is_retryable();
                    if !retryable || attempt >= unit.max_retries {
                        break Outcome::Failed(e);
                    }

                    let base = base_delay(e.class());
                    let delay = compute_backoff(base, attempt, self.backoff_cap);
                    warn!(run_id, unit = %unit.id, attempt, ?delay, "retrying after classified error: {e}");
                    self.publisher.publish(
                        Event::new(run_id, EventType::Warning, EventLevel::Warning, format!("unit '{}' attempt {} failed: {e}", unit.id, attempt + 1))
                            .for_unit(&unit.id),
                    );

                    if state.cancelled.load(Ordering::SeqCst) {
                        break Outcome::Cancelled;
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };

        match outcome {
            Outcome::Succeeded(new_state) => {
                state.set_status(&unit.id, UnitStatus::Succeeded);
                result.finish(UnitStatus::Succeeded, None, Some(new_state));
                state.set_result(result);
                self.publisher.publish(
                    Event::new(run_id, EventType::PlanUnitCompleted, EventLevel::Info, format!("unit '{}' succeeded", unit.id)).for_unit(&unit.id),
                );
            }
            Outcome::Cancelled => {
                state.set_status(&unit.id, UnitStatus::Cancelled);
                result.finish(
                    UnitStatus::Cancelled,
                    Some(crate::model::ErrorSnapshot {
                        code: "CANCELLED".into(),
                        message: "execution cancelled".into(),
                        resource_id: Some(unit.resource_id.clone()),
                    }),
                    None,
                );
                state.set_result(result);
            }
            Outcome::Failed(e) => {
                state.set_status(&unit.id, UnitStatus::Failed);
                result.finish(UnitStatus::Failed, Some((&e).into()), None);
                state.set_result(result);
                self.publisher.publish(
                    Event::new(run_id, EventType::PlanUnitFailed, EventLevel::Error, format!("unit '{}' failed: {e}", unit.id)).for_unit(&unit.id),
                );
                info!(run_id, unit = %unit.id, "unit terminal status: failed");
            }
        }
    }

    /// Re-checks dependency satisfaction against the current shared status
    /// map (spec §4.2). Returns `Some(reason)` if the unit must be skipped.
    fn check_gating(&self, plan: &Plan, unit: &PlanUnit, state: &RunState) -> Option<String> {
        for pred in plan.require_predecessors(&unit.id) {
            if state.status_of(pred) != UnitStatus::Succeeded {
                return Some("Dependencies failed".to_string());
            }
        }
        for pred in plan.order_predecessors(&unit.id) {
            if !state.status_of(pred).is_terminal() {
                return Some("Dependencies failed".to_string());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DependencyKind, Operation, Plan, PlanUnit};
    use crate::scheduler::events::RecordingEventPublisher;
    use crate::scheduler::run_store::InMemoryRunStore;
    use std::sync::atomic::AtomicU32;

    struct AlwaysSucceeds;
    #[async_trait::async_trait]
    impl ProviderDispatch for AlwaysSucceeds {
        async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
            Ok(unit.desired_state.clone())
        }
    }

    struct AlwaysFails;
    #[async_trait::async_trait]
    impl ProviderDispatch for AlwaysFails {
        async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
            Err(OpError::validation(format!("unit {} always fails", unit.id), Some(unit.resource_id.clone())))
        }
    }

    struct ThrottledThenSucceeds {
        remaining_failures: AtomicU32,
    }
    #[async_trait::async_trait]
    impl ProviderDispatch for ThrottledThenSucceeds {
        async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(OpError::Throttled {
                    code: "THROTTLED",
                    message: "rate limited".into(),
                    resource_id: Some(unit.resource_id.clone()),
                })
            } else {
                Ok(unit.desired_state.clone())
            }
        }
    }

    fn unit(id: &str) -> PlanUnit {
        PlanUnit::new(id, id, Operation::Create, "test-provider")
    }

    async fn new_scheduler(dispatch: Arc<dyn ProviderDispatch>) -> (Arc<Scheduler>, Arc<RecordingEventPublisher>) {
        let publisher = Arc::new(RecordingEventPublisher::new());
        let scheduler = Scheduler::new(
            10,
            Duration::from_secs(60),
            Arc::new(InMemoryRunStore::new()),
            publisher.clone(),
            dispatch,
        );
        (scheduler, publisher)
    }

    #[tokio::test]
    async fn empty_plan_succeeds_with_zero_counters() {
        let (scheduler, _pub) = new_scheduler(Arc::new(AlwaysSucceeds)).await;
        let plan = Plan::build("p1", vec![]).unwrap();
        let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();

        for _ in 0..50 {
            let run = scheduler.get_status(&run_id).await.unwrap();
            if run.status != RunStatus::Pending && run.status != RunStatus::Running {
                assert_eq!(run.status, RunStatus::Succeeded);
                assert_eq!(run.summary.total, 0);
                assert_eq!(run.summary.pending, 0);
                assert_eq!(run.summary.running, 0);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never completed");
    }

    #[tokio::test]
    async fn require_vs_order_scenario() {
        // X fails, Y requires X (skipped), Z orders X (succeeds once X terminal)
        let x = unit("x");
        let y = unit("y").with_edge("x", DependencyKind::Require);
        let z = unit("z").with_edge("x", DependencyKind::Order);
        let plan = Plan::build("p2", vec![x, y, z]).unwrap();

        struct FailsOnlyX;
        #[async_trait::async_trait]
        impl ProviderDispatch for FailsOnlyX {
            async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
                if unit.id == "x" {
                    Err(OpError::validation("x fails", Some("x".into())))
                } else {
                    Ok(unit.desired_state.clone())
                }
            }
        }

        let (scheduler, _pub) = new_scheduler(Arc::new(FailsOnlyX)).await;
        let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();

        let run = wait_for_terminal(&scheduler, &run_id).await;
        assert_eq!(run.summary.failed, 1);
        assert_eq!(run.summary.succeeded, 1); // z
        assert_eq!(run.summary.skipped, 1); // y
    }

    #[tokio::test(start_paused = true)]
    async fn retry_then_succeed_with_throttled_backoff() {
        let p = unit("p").with_max_retries(3);
        let plan = Plan::build("p3", vec![p]).unwrap();
        let dispatch = Arc::new(ThrottledThenSucceeds {
            remaining_failures: AtomicU32::new(3),
        });
        let (scheduler, publisher) = new_scheduler(dispatch).await;
        let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();

        let run = wait_for_terminal(&scheduler, &run_id).await;
        assert_eq!(run.status, RunStatus::Succeeded);

        let warnings = publisher
            .events()
            .into_iter()
            .filter(|e| e.event_type == EventType::Warning)
            .count();
        assert_eq!(warnings, 3);
    }

    #[tokio::test]
    async fn fail_fast_cancels_later_cohorts() {
        let a = unit("a");
        let b = unit("b").with_edge("a", DependencyKind::Require);
        let plan = Plan::build("p4", vec![a, b]).unwrap();
        let (scheduler, _pub) = new_scheduler(Arc::new(AlwaysFails)).await;
        let run_id = scheduler
            .schedule(
                plan,
                ScheduleOptions {
                    fail_fast: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let run = wait_for_terminal(&scheduler, &run_id).await;
        assert_eq!(run.summary.failed, 1);
        assert_eq!(run.summary.skipped, 1);
    }

    #[tokio::test]
    async fn cancellation_marks_later_cohorts_cancelled() {
        let a = unit("a");
        let b = unit("b").with_edge("a", DependencyKind::Require);
        let plan = Plan::build("p5", vec![a, b]).unwrap();
        let (scheduler, _pub) = new_scheduler(Arc::new(AlwaysSucceeds)).await;
        let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();
        scheduler.cancel(&run_id).unwrap();

        let run = wait_for_terminal(&scheduler, &run_id).await;
        assert_eq!(run.status, RunStatus::Cancelled);
    }

    async fn wait_for_terminal(scheduler: &Arc<Scheduler>, run_id: &str) -> Run {
        for _ in 0..6000 {
            let run = scheduler.get_status(run_id).await.unwrap();
            if run.status != RunStatus::Pending && run.status != RunStatus::Running {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never completed");
    }
}
