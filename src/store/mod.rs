//! Run persistence layer
//!
//! The authoritative record of every run. In-memory for development and
//! tests; Postgres when a database URL is configured.

pub mod postgres;

use crate::error::RunbookError;
use crate::models::{
    DecisionPacket, PaymentRequest, Run, RunFilter, RunStatus, RunSummary, StepRecord,
};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub use postgres::PgRunStore;

/// Terminal state written once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub decision_packet: DecisionPacket,
    pub error: Option<String>,
    pub audit_digest: Option<String>,
}

/// Trait for run persistence
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run. Fails with `RunAlreadyExists` if the id is taken.
    async fn create(&self, run: Run) -> Result<Run>;
    async fn get(&self, run_id: &str) -> Result<Option<Run>>;
    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<()>;
    async fn upsert_step(&self, run_id: &str, record: StepRecord) -> Result<()>;
    async fn set_payment(&self, run_id: &str, payment: PaymentRequest) -> Result<()>;
    async fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<Run>;
    /// Newest first.
    async fn list(&self, filter: RunFilter) -> Result<Vec<RunSummary>>;
}

/// Apply the terminal outcome to a run record.
pub(crate) fn apply_outcome(run: &mut Run, outcome: RunOutcome) -> Result<()> {
    run.transition(outcome.status, Utc::now())?;
    run.decision_packet = Some(outcome.decision_packet);
    run.error = outcome.error;
    run.audit_digest = outcome.audit_digest;
    Ok(())
}

/// Completed and failed runs are read-only.
pub(crate) fn ensure_mutable(run: &Run) -> Result<()> {
    if run.status.is_terminal() {
        return Err(RunbookError::StoreError(format!(
            "Run {} is {} and can no longer change",
            run.run_id, run.status
        )));
    }
    Ok(())
}

/// Filter, order and page a set of runs.
pub(crate) fn select(runs: impl Iterator<Item = Run>, filter: RunFilter) -> Vec<RunSummary> {
    let mut items: Vec<RunSummary> = runs
        .filter(|run| filter.status.map(|s| run.status == s).unwrap_or(true))
        .map(|run| run.summary())
        .collect();

    // newest first; id breaks ties so paging is stable
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.run_id.cmp(&a.run_id))
    });

    items
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit)
        .collect()
}

/// In-memory run store for development
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<String, Run>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn with_run<F>(&self, run_id: &str, mutate: F) -> Result<Run>
    where
        F: FnOnce(&mut Run) -> Result<()> + Send,
    {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| RunbookError::RunNotFound(run_id.to_string()))?;

        // mutate a copy so a rejected change leaves the record untouched
        let mut updated = run.clone();
        mutate(&mut updated)?;
        *run = updated.clone();
        Ok(updated)
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: Run) -> Result<Run> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(RunbookError::RunAlreadyExists(run.run_id));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(run)
    }

    async fn get(&self, run_id: &str) -> Result<Option<Run>> {
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).cloned())
    }

    async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        self.with_run(run_id, |run| run.transition(status, Utc::now()))
            .await
            .map(|_| ())
    }

    async fn upsert_step(&self, run_id: &str, record: StepRecord) -> Result<()> {
        self.with_run(run_id, |run| {
            ensure_mutable(run)?;
            run.upsert_step(record)
        })
        .await
        .map(|_| ())
    }

    async fn set_payment(&self, run_id: &str, payment: PaymentRequest) -> Result<()> {
        self.with_run(run_id, |run| {
            ensure_mutable(run)?;
            run.payment = Some(payment);
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<Run> {
        self.with_run(run_id, |run| apply_outcome(run, outcome)).await
    }

    async fn list(&self, filter: RunFilter) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        Ok(select(runs.values().cloned(), filter))
    }
}
