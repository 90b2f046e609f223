//! Demo entrypoint (spec §9.5): wires a scheduler with an in-memory run
//! store and a tracing event publisher against a tiny stub "echo"
//! provider, then runs one plan to completion. Mirrors the shape of the
//! teacher's own `main.rs` — load config, init tracing, build the
//! capability interfaces, drive one representative workload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openfroyo_core::error::Result;
use openfroyo_core::model::{DependencyKind, Operation, Plan, PlanUnit, RunStatus};
use openfroyo_core::policy::new_store_with_builtins;
use openfroyo_core::policy::{PolicyContext, PolicyEvaluator};
use openfroyo_core::scheduler::{InMemoryRunStore, ProviderDispatch, ScheduleOptions, Scheduler, TracingEventPublisher};
use openfroyo_core::OrchestratorConfig;
use serde_json::Value;
use tracing::info;

/// A provider dispatch that echoes the desired state back as the new
/// state — good enough to exercise the scheduler's level-by-level drive
/// loop without a real WASM provider artifact.
struct EchoDispatch;

#[async_trait]
impl ProviderDispatch for EchoDispatch {
    async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
        info!(unit_id = %unit.id, operation = ?unit.operation, "echo provider dispatching");
        Ok(unit.desired_state.clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let config = OrchestratorConfig::load("openfroyo.toml")?;
    info!(max_parallel = config.scheduler.max_parallel, "starting openfroyod demo run");

    let policy_store = new_store_with_builtins();
    let evaluator = PolicyEvaluator::new(policy_store);

    let web = PlanUnit::new("web", "web-server", Operation::Create, "demo-echo")
        .with_timeout(Duration::from_secs(30));
    let db = PlanUnit::new("db", "database", Operation::Create, "demo-echo")
        .with_timeout(Duration::from_secs(30));
    let migration = PlanUnit::new("migration", "database-migration", Operation::Update, "demo-echo")
        .with_edge("db", DependencyKind::Require)
        .with_timeout(Duration::from_secs(30));

    let plan = Plan::build("demo-plan", vec![web, db, migration])?;

    let mut context = PolicyContext::default();
    context.operation = "apply".into();
    let policy_result = evaluator.evaluate_plan(&plan, context);
    info!(allowed = policy_result.allowed, violations = policy_result.violations.len(), "policy evaluation complete");
    if !policy_result.allowed {
        for violation in &policy_result.violations {
            tracing::error!(policy = %violation.policy_name, message = %violation.message, "blocking policy violation");
        }
        anyhow::bail!("plan rejected by policy evaluation");
    }

    let run_store = Arc::new(InMemoryRunStore::new());
    let publisher = Arc::new(TracingEventPublisher);
    let dispatch = Arc::new(EchoDispatch);

    let scheduler = Scheduler::new(
        config.scheduler.max_parallel,
        config.scheduler.backoff_cap(),
        run_store,
        publisher,
        dispatch,
    );

    let run_id = scheduler.schedule(plan, ScheduleOptions::default()).await?;
    info!(run_id = %run_id, "run scheduled");

    loop {
        let run = scheduler.get_status(&run_id).await?;
        if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
            info!(run_id = %run_id, status = ?run.status, succeeded = run.summary.succeeded, failed = run.summary.failed, "run finished");
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
