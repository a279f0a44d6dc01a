//! Per-run execution context
//!
//! Step bookkeeping for the one task driving a run: every step transition is
//! written to the run store and the event log, and subscribers are woken.
//! Each write is bounded by the configured write timeout; a write that cannot
//! finish is an internal failure of the run.

use crate::agents::AgentFailure;
use crate::error::RunbookError;
use crate::events::{EventBody, EventLog, NewEvent, RunEvent};
use crate::models::{PaymentRequest, RunId, Step, StepError, StepRecord};
use crate::store::RunStore;
use crate::stream::StreamBroadcaster;
use crate::Result;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub struct RunContext {
    run_id: RunId,
    started: Instant,
    log: Arc<dyn EventLog>,
    store: Arc<dyn RunStore>,
    broadcaster: Arc<StreamBroadcaster>,
    write_timeout: Duration,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        log: Arc<dyn EventLog>,
        store: Arc<dyn RunStore>,
        broadcaster: Arc<StreamBroadcaster>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            run_id,
            started: Instant::now(),
            log,
            store,
            broadcaster,
            write_timeout,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Run `fut` within the write timeout.
    pub async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.write_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                error!(run_id = %self.run_id, write = what, "Write timed out");
                Err(RunbookError::WriteTimeout(
                    self.write_timeout.as_millis() as u64,
                    what.to_string(),
                ))
            }
        }
    }

    /// Append one event and wake subscribers.
    pub async fn emit(&self, step: Step, agent: &str, body: EventBody) -> Result<RunEvent> {
        let kind = body.kind();
        let event = NewEvent::new(step, agent, self.elapsed_ms(), body);
        let appended = self
            .bounded("event append", self.log.append(&self.run_id, event))
            .await?;

        debug!(run_id = %self.run_id, seq = appended.seq, step = %step, kind, "Event appended");
        self.broadcaster.publish(&self.run_id, appended.seq).await;
        Ok(appended)
    }

    pub async fn save_payment(&self, payment: PaymentRequest) -> Result<()> {
        self.bounded("payment update", self.store.set_payment(&self.run_id, payment))
            .await
    }

    async fn save_step(&self, record: StepRecord) -> Result<()> {
        self.bounded("step update", self.store.upsert_step(&self.run_id, record))
            .await
    }

    // =============================
    // Step Transitions
    // =============================

    pub async fn begin_step(&self, step: Step, agent: &str, message: String) -> Result<StepRecord> {
        let record = StepRecord::started(step, agent, Utc::now());
        self.emit(step, agent, EventBody::StepStarted { message }).await?;
        self.save_step(record.clone()).await?;
        Ok(record)
    }

    pub async fn complete_step(
        &self,
        mut record: StepRecord,
        summary: String,
        result: Value,
        trace_id: Option<String>,
        attempts: u32,
    ) -> Result<StepRecord> {
        record.complete(Utc::now(), summary.clone(), result.clone());
        self.save_step(record.clone()).await?;

        let agent = record.agent.clone();
        self.emit(
            record.step,
            &agent,
            EventBody::StepCompleted {
                summary,
                result,
                trace_id,
                attempts,
            },
        )
        .await?;
        Ok(record)
    }

    /// Record an exhausted agent failure together with its substitution.
    pub async fn fail_step(
        &self,
        mut record: StepRecord,
        failure: &AgentFailure,
        summary: String,
        substitution: Value,
    ) -> Result<StepRecord> {
        warn!(
            run_id = %self.run_id,
            step = %record.step,
            agent = %record.agent,
            attempts = failure.attempts,
            error = %failure.error,
            "Step failed, substituting conservative result"
        );

        let error = StepError {
            class: failure.error.class(),
            message: failure.error.to_string(),
            attempts: failure.attempts,
        };
        record.fail(Utc::now(), summary, error, substitution.clone());
        self.save_step(record.clone()).await?;

        let agent = record.agent.clone();
        self.emit(
            record.step,
            &agent,
            EventBody::StepFailed {
                error_class: failure.error.class(),
                error: failure.error.to_string(),
                attempts: failure.attempts,
                substitution,
            },
        )
        .await?;
        Ok(record)
    }
}
