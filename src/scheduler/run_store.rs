//! Run persistence interface (spec §6 "Run persistence").
//!
//! The real implementation (a SQL/KV store) is an external collaborator;
//! this crate only defines the trait and an in-memory implementation used
//! by tests and the demo binary.

use dashmap::DashMap;

use crate::error::{OpError, Result};
use crate::model::Run;

#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    async fn save_run(&self, run: &Run) -> Result<()>;
    async fn get_run(&self, run_id: &str) -> Result<Run>;
}

/// Concurrent in-memory store, grounded on the teacher's `dashmap`-backed
/// connection and session caches.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: DashMap<String, Run>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn save_run(&self, run: &Run) -> Result<()> {
        self.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.runs
            .get(run_id)
            .map(|r| r.clone())
            .ok_or_else(|| OpError::validation(format!("run '{run_id}' not found"), None))
    }
}
