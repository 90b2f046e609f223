//! Scheduler scenarios that need more than one unit in flight at once —
//! the inline suite in `scheduler::executor` already covers gating,
//! fail-fast, cancellation and classified retry, so this file focuses on
//! cohort concurrency (spec §4.2 "units at the same level run in
//! parallel, bounded by `max_parallel`") and the timeout/retry boundary
//! (spec §8 boundary case: a unit whose deadline is shorter than its
//! backoff is still attempted `max_retries + 1` times).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openfroyo_core::error::{OpError, Result};
use openfroyo_core::model::{DependencyKind, Operation, Plan, PlanUnit, Run, RunStatus};
use openfroyo_core::scheduler::{InMemoryRunStore, ProviderDispatch, ScheduleOptions, Scheduler, TracingEventPublisher};
use serde_json::Value;

fn unit(id: &str) -> PlanUnit {
    PlanUnit::new(id, id, Operation::Create, "test-provider")
}

/// Diamond: b and c both require a; d requires both b and c. b and c land
/// in the same cohort and are the only units whose concurrency is under
/// test here.
fn diamond_plan() -> Plan {
    let a = unit("a");
    let b = unit("b").with_edge("a", DependencyKind::Require);
    let c = unit("c").with_edge("a", DependencyKind::Require);
    let d = unit("d").with_edge("b", DependencyKind::Require).with_edge("c", DependencyKind::Require);
    Plan::build("diamond", vec![a, b, c, d]).unwrap()
}

struct ConcurrencyTracker {
    current: AtomicUsize,
    max_observed: AtomicUsize,
    hold: Duration,
}

impl ConcurrencyTracker {
    fn new(hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
            hold,
        })
    }
}

#[async_trait]
impl ProviderDispatch for ConcurrencyTracker {
    async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(unit.desired_state.clone())
    }
}

async fn wait_for_terminal(scheduler: &Arc<Scheduler>, run_id: &str) -> Run {
    for _ in 0..500 {
        let run = scheduler.get_status(run_id).await.unwrap();
        if run.status != RunStatus::Pending && run.status != RunStatus::Running {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run never completed");
}

#[tokio::test]
async fn diamond_cohort_runs_up_to_max_parallel_concurrently() {
    let tracker = ConcurrencyTracker::new(Duration::from_millis(80));
    let scheduler = Scheduler::new(10, Duration::from_secs(5), Arc::new(InMemoryRunStore::new()), Arc::new(TracingEventPublisher), tracker.clone());

    let run_id = scheduler
        .schedule(
            diamond_plan(),
            ScheduleOptions {
                max_parallel: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let run = wait_for_terminal(&scheduler, &run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(tracker.max_observed.load(Ordering::SeqCst), 2, "b and c must overlap under max_parallel=2");
}

#[tokio::test]
async fn max_parallel_one_forces_strict_seriality() {
    let tracker = ConcurrencyTracker::new(Duration::from_millis(30));
    let scheduler = Scheduler::new(10, Duration::from_secs(5), Arc::new(InMemoryRunStore::new()), Arc::new(TracingEventPublisher), tracker.clone());

    let run_id = scheduler
        .schedule(
            diamond_plan(),
            ScheduleOptions {
                max_parallel: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let run = wait_for_terminal(&scheduler, &run_id).await;
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(tracker.max_observed.load(Ordering::SeqCst), 1, "no two units may overlap under max_parallel=1");
}

struct AlwaysTimesOut {
    attempts: AtomicU32,
    sleep_past_deadline: Duration,
}

#[async_trait]
impl ProviderDispatch for AlwaysTimesOut {
    async fn dispatch(&self, _unit: &PlanUnit) -> Result<Value> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.sleep_past_deadline).await;
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn unit_with_tight_deadline_is_still_attempted_max_retries_plus_one_times() {
    let dispatch = Arc::new(AlwaysTimesOut {
        attempts: AtomicU32::new(0),
        sleep_past_deadline: Duration::from_millis(500),
    });
    let scheduler = Scheduler::new(10, Duration::from_secs(5), Arc::new(InMemoryRunStore::new()), Arc::new(TracingEventPublisher), dispatch.clone());

    let slow = unit("slow").with_timeout(Duration::from_millis(50)).with_max_retries(2);
    let plan = Plan::build("tight-deadline", vec![slow]).unwrap();
    let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();

    let run = wait_for_terminal(&scheduler, &run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(dispatch.attempts.load(Ordering::SeqCst), 3, "max_retries=2 must yield exactly 3 attempts");

    let result = run.summary.failed;
    assert_eq!(result, 1);
}

#[tokio::test]
async fn independent_cohort_zero_units_still_run_concurrently_without_cross_talk() {
    // Two independent units at the same level, no edges between them, must
    // not gate on each other even when one fails.
    struct FailFirst;
    #[async_trait]
    impl ProviderDispatch for FailFirst {
        async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
            if unit.id == "only-fails" {
                Err(OpError::validation("boom", Some(unit.id.clone())))
            } else {
                Ok(unit.desired_state.clone())
            }
        }
    }

    let a = unit("only-fails");
    let b = unit("independent");
    let plan = Plan::build("independent-cohort", vec![a, b]).unwrap();
    let scheduler = Scheduler::new(10, Duration::from_secs(5), Arc::new(InMemoryRunStore::new()), Arc::new(TracingEventPublisher), Arc::new(FailFirst));
    let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await.unwrap();

    let run = wait_for_terminal(&scheduler, &run_id).await;
    assert_eq!(run.summary.failed, 1);
    assert_eq!(run.summary.succeeded, 1);
}
