//! Run orchestrator
//!
//! Drives the fixed pipeline for every run:
//!
//! intake → sanctions → liquidity → procedures → summarize
//!
//! One task per run, steps strictly sequential. Agent failures are
//! substituted and never abort a run; only internal failures (store or
//! event log) end a run as `failed`.

use crate::agents::{
    AgentFailure, ComplianceAgents, LiquidityRequest, ProceduresRequest, SanctionsRequest,
};
use crate::audit::{event_log_digest, verify_run, AuditVerification};
use crate::config::Settings;
use crate::decision::{
    format_money, internal_failure_packet, substitute_liquidity, substitute_procedures,
    substitute_sanctions, DecisionEngine, Verdict,
};
use crate::error::RunbookError;
use crate::events::{EventBody, EventLog, InMemoryEventLog, RunEvent, ORCHESTRATOR};
use crate::execution::RunContext;
use crate::intake::PaymentIntakeParser;
use crate::models::{
    DecisionPacket, LiquidityResult, PaymentOverrides, PaymentRequest, ProceduresResult, Run,
    RunFilter, RunId, RunStatus, RunSummary, SanctionsDecision, SanctionsResult, Step,
};
use crate::store::{InMemoryRunStore, PgRunStore, RunOutcome, RunStore};
use crate::stream::{EventStream, StreamBroadcaster};
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

const MAX_RUN_ID_LEN: usize = 128;
const FINALIZE_ATTEMPTS: u32 = 3;
const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(20);
pub const MAX_LIST_LIMIT: usize = 200;

/// Reply to a start request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// False when the run id already existed (idempotent replay).
    pub created: bool,
}

/// Terminal result, or the current status while the run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub decision_packet: Option<DecisionPacket>,
    pub error: Option<String>,
}

/// Run record plus its full event log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub events: Vec<RunEvent>,
    pub audit: Option<AuditVerification>,
}

#[derive(Clone)]
pub struct RunOrchestrator {
    agents: Arc<ComplianceAgents>,
    engine: DecisionEngine,
    store: Arc<dyn RunStore>,
    log: Arc<dyn EventLog>,
    broadcaster: Arc<StreamBroadcaster>,
    write_timeout: Duration,
}

impl RunOrchestrator {
    pub fn new(
        agents: ComplianceAgents,
        engine: DecisionEngine,
        store: Arc<dyn RunStore>,
        log: Arc<dyn EventLog>,
        write_timeout: Duration,
    ) -> Self {
        let broadcaster = Arc::new(StreamBroadcaster::new(log.clone()));
        Self {
            agents: Arc::new(agents),
            engine,
            store,
            log,
            broadcaster,
            write_timeout,
        }
    }

    /// In-memory store and log.
    pub fn in_memory(agents: ComplianceAgents, settings: &Settings) -> Self {
        Self::new(
            agents,
            DecisionEngine::new(settings.reject_breach_after_cutoff),
            Arc::new(InMemoryRunStore::new()),
            Arc::new(InMemoryEventLog::new()),
            settings.write_timeout,
        )
    }

    /// Agents, store and log as configured.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let agents = ComplianceAgents::from_settings(settings)?;

        match &settings.database_url {
            Some(url) => {
                let pg = Arc::new(PgRunStore::connect_lazy(url)?);
                Ok(Self::new(
                    agents,
                    DecisionEngine::new(settings.reject_breach_after_cutoff),
                    pg.clone(),
                    pg,
                    settings.write_timeout,
                ))
            }
            None => Ok(Self::in_memory(agents, settings)),
        }
    }

    // =============================
    // Lifecycle Surface
    // =============================

    /// Accept a run and start it in the background.
    ///
    /// Starting an id that already exists never starts a second execution;
    /// it reports the existing run instead.
    pub async fn start(
        &self,
        message: String,
        overrides: PaymentOverrides,
        run_id: Option<RunId>,
    ) -> Result<StartOutcome> {
        if message.trim().is_empty() {
            return Err(RunbookError::InvalidRequest("message must not be empty".to_string()));
        }

        let run_id = match run_id {
            Some(id) => validate_run_id(id)?,
            None => Uuid::new_v4().to_string(),
        };

        // the channel exists before the run is visible, so no subscriber
        // can find the run without also finding its channel
        let opened = self.broadcaster.open(&run_id).await;
        let run = Run::new(run_id.clone(), message.clone(), overrides.clone(), Utc::now());

        match self.store.create(run).await {
            Ok(_) => {}
            Err(RunbookError::RunAlreadyExists(_)) => {
                if opened {
                    // the existing run already finished and released its channel
                    self.broadcaster.close(&run_id).await;
                }
                let existing = self
                    .store
                    .get(&run_id)
                    .await?
                    .ok_or_else(|| RunbookError::RunNotFound(run_id.clone()))?;

                info!(
                    run_id = %run_id,
                    status = %existing.status,
                    "Start replayed for existing run",
                );
                return Ok(StartOutcome {
                    run_id,
                    status: existing.status,
                    created: false,
                });
            }
            Err(e) => {
                if opened {
                    self.broadcaster.close(&run_id).await;
                }
                return Err(e);
            }
        }

        info!(run_id = %run_id, "Run accepted");

        let this = self.clone();
        let span = info_span!("run", run_id = %run_id);
        let task_run_id = run_id.clone();
        tokio::spawn(
            async move { this.drive(task_run_id, message, overrides).await }.instrument(span),
        );

        Ok(StartOutcome {
            run_id,
            status: RunStatus::Pending,
            created: true,
        })
    }

    /// The agents used by every run, for direct invocation.
    pub fn agents(&self) -> &ComplianceAgents {
        &self.agents
    }

    pub async fn result(&self, run_id: &str) -> Result<RunResult> {
        let run = self.get_run(run_id).await?;
        Ok(RunResult {
            run_id: run.run_id,
            status: run.status,
            decision_packet: run.decision_packet,
            error: run.error,
        })
    }

    pub async fn list(&self, mut filter: RunFilter) -> Result<Vec<RunSummary>> {
        filter.limit = filter.limit.min(MAX_LIST_LIMIT);
        self.store.list(filter).await
    }

    pub async fn detail(&self, run_id: &str) -> Result<RunDetail> {
        let run = self.get_run(run_id).await?;
        let events = self.log.read_from(run_id, 1).await?;
        let audit = run
            .status
            .is_terminal()
            .then(|| verify_run(&run, &events));

        Ok(RunDetail { run, events, audit })
    }

    /// Ordered events from `from_seq`, live until the run ends.
    pub async fn subscribe(&self, run_id: &str, from_seq: u64) -> Result<EventStream> {
        self.get_run(run_id).await?;
        Ok(self.broadcaster.subscribe(run_id, from_seq).await)
    }

    async fn get_run(&self, run_id: &str) -> Result<Run> {
        self.store
            .get(run_id)
            .await?
            .ok_or_else(|| RunbookError::RunNotFound(run_id.to_string()))
    }

    // =============================
    // Pipeline
    // =============================

    async fn drive(self, run_id: RunId, message: String, overrides: PaymentOverrides) {
        let ctx = RunContext::new(
            run_id.clone(),
            self.log.clone(),
            self.store.clone(),
            self.broadcaster.clone(),
            self.write_timeout,
        );

        match self.execute(&ctx, &message, &overrides).await {
            Ok(packet) => self.complete_run(&ctx, packet).await,
            Err(e) => self.fail_run(&ctx, e).await,
        }

        self.broadcaster.close(&run_id).await;
    }

    /// Runs every step up to and including the `final` event.
    async fn execute(
        &self,
        ctx: &RunContext,
        message: &str,
        overrides: &PaymentOverrides,
    ) -> Result<DecisionPacket> {
        ctx.bounded("status update", self.store.update_status(ctx.run_id(), RunStatus::Running))
            .await?;

        let payment = self.intake(ctx, message, overrides).await?;
        let sanctions = self.sanctions(ctx, &payment).await?;

        let (liquidity, procedures) = if sanctions.result.decision == SanctionsDecision::Block {
            ctx.emit(
                Step::Sanctions,
                ORCHESTRATOR,
                EventBody::Branch {
                    condition: "sanctions.decision == BLOCK".to_string(),
                    target: Step::Summarize,
                    reason: "Sanctions match: liquidity and procedures are not consulted".to_string(),
                },
            )
            .await?;
            (None, None)
        } else {
            let liquidity = self.liquidity(ctx, &payment).await?;
            let procedures = self.procedures(ctx, &payment, &sanctions, &liquidity).await?;
            (Some(liquidity), Some(procedures))
        };

        let packet = self
            .summarize(ctx, &sanctions, liquidity.as_ref(), procedures.as_ref())
            .await?;

        let amount = Some((payment.amount, payment.currency.as_str()));
        ctx.emit(
            Step::Summarize,
            ORCHESTRATOR,
            EventBody::final_decision(packet.clone(), amount),
        )
        .await?;

        Ok(packet)
    }

    /// Store the packet already streamed in the `final` event.
    ///
    /// Subscribers have seen the decision, so a failing store is retried
    /// with the same packet and never turned into a failed run.
    async fn complete_run(&self, ctx: &RunContext, packet: DecisionPacket) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.finalize_completed(ctx, &packet).await {
                Ok(()) => {
                    info!(
                        run_id = %ctx.run_id(),
                        decision = %packet.decision,
                        elapsed_ms = ctx.elapsed_ms(),
                        "Run completed"
                    );
                    return;
                }
                Err(e) => {
                    warn!(run_id = %ctx.run_id(), attempt, error = %e, "Run finalize failed");
                }
            }

            // a timed-out write may still have landed
            if let Ok(Some(run)) = self.store.get(ctx.run_id()).await {
                if run.status.is_terminal() {
                    return;
                }
            }
            if attempt < FINALIZE_ATTEMPTS {
                tokio::time::sleep(FINALIZE_RETRY_DELAY * attempt).await;
            }
        }

        error!(
            run_id = %ctx.run_id(),
            decision = %packet.decision,
            "Decision streamed but run record could not be finalized"
        );
    }

    async fn finalize_completed(&self, ctx: &RunContext, packet: &DecisionPacket) -> Result<()> {
        let events = ctx
            .bounded("event read", self.log.read_from(ctx.run_id(), 1))
            .await?;
        let outcome = RunOutcome {
            status: RunStatus::Completed,
            decision_packet: packet.clone(),
            error: None,
            audit_digest: Some(event_log_digest(&events)),
        };
        ctx.bounded("run finalize", self.store.finalize(ctx.run_id(), outcome))
            .await?;
        Ok(())
    }

    async fn intake(
        &self,
        ctx: &RunContext,
        message: &str,
        overrides: &PaymentOverrides,
    ) -> Result<PaymentRequest> {
        let record = ctx
            .begin_step(Step::Intake, ORCHESTRATOR, "Parsing payment request".to_string())
            .await?;

        let outcome = PaymentIntakeParser::parse(message, overrides, Utc::now());
        let payment = outcome.payment.clone();

        let mut summary = format!(
            "Parsed {} to {}",
            format_money(payment.amount, &payment.currency),
            payment.beneficiary_name
        );
        if outcome.is_partial() {
            summary.push_str(&format!(" (partial: {} field(s) defaulted)", outcome.warnings.len()));
            warn!(
                run_id = %ctx.run_id(),
                warnings = ?outcome.warnings,
                "Partial intake extraction",
            );
        }

        ctx.save_payment(payment.clone()).await?;
        ctx.complete_step(record, summary, to_json(&outcome)?, None, 0)
            .await?;
        Ok(payment)
    }

    async fn sanctions(
        &self,
        ctx: &RunContext,
        payment: &PaymentRequest,
    ) -> Result<Verdict<SanctionsResult>> {
        let agent = self.agents.sanctions.name().to_string();
        let record = ctx
            .begin_step(
                Step::Sanctions,
                &agent,
                format!("Screening {} against sanctions lists", payment.beneficiary_name),
            )
            .await?;

        match self.agents.screen_sanctions(&SanctionsRequest::for_payment(payment)).await {
            Ok(outcome) => {
                let result = to_json(&outcome.result)?;
                self.tool_call(
                    ctx,
                    Step::Sanctions,
                    &agent,
                    "sanctions_screening",
                    outcome.trace_id.as_deref(),
                    result.clone(),
                )
                .await?;

                let summary = format!(
                    "Sanctions {} ({}% confidence)",
                    outcome.result.decision, outcome.result.confidence
                );
                ctx.complete_step(
                    record,
                    summary,
                    result,
                    outcome.trace_id.clone(),
                    outcome.attempts,
                )
                .await?;
                Ok(Verdict::new(outcome.result, outcome.trace_id))
            }
            Err(failure) => {
                let substitute = substitute_sanctions(&payment.beneficiary_name, &failure.error);
                let summary = failed_summary(
                    "Sanctions screening",
                    &failure,
                    "escalating for manual review",
                );
                ctx.fail_step(record, &failure, summary, to_json(&substitute)?)
                    .await?;
                Ok(Verdict::substituted(substitute))
            }
        }
    }

    async fn liquidity(
        &self,
        ctx: &RunContext,
        payment: &PaymentRequest,
    ) -> Result<Verdict<LiquidityResult>> {
        let agent = self.agents.liquidity.name().to_string();
        let record = ctx
            .begin_step(
                Step::Liquidity,
                &agent,
                format!(
                    "Assessing liquidity for {} on {}",
                    format_money(payment.amount, &payment.currency),
                    payment.entity
                ),
            )
            .await?;

        match self.agents.assess_liquidity(&LiquidityRequest::for_payment(payment)).await {
            Ok(outcome) => {
                let result = to_json(&outcome.result)?;
                self.tool_call(
                    ctx,
                    Step::Liquidity,
                    &agent,
                    "liquidity_assessment",
                    outcome.trace_id.as_deref(),
                    result.clone(),
                )
                .await?;

                let mut summary = format!("Liquidity {}", outcome.result.status);
                if let Some(gap) = outcome.result.gap() {
                    summary.push_str(&format!(
                        " (buffer gap {})",
                        format_money(gap, &outcome.result.currency)
                    ));
                }
                ctx.complete_step(
                    record,
                    summary,
                    result,
                    outcome.trace_id.clone(),
                    outcome.attempts,
                )
                .await?;
                Ok(Verdict::new(outcome.result, outcome.trace_id))
            }
            Err(failure) => {
                let substitute = substitute_liquidity(
                    payment.amount,
                    &payment.currency,
                    &failure.error,
                );
                let summary = failed_summary(
                    "Liquidity assessment",
                    &failure,
                    "escalating with system degradation note",
                );
                ctx.fail_step(record, &failure, summary, to_json(&substitute)?)
                    .await?;
                Ok(Verdict::substituted(substitute))
            }
        }
    }

    async fn procedures(
        &self,
        ctx: &RunContext,
        payment: &PaymentRequest,
        sanctions: &Verdict<SanctionsResult>,
        liquidity: &Verdict<LiquidityResult>,
    ) -> Result<Verdict<ProceduresResult>> {
        let agent = self.agents.procedures.name().to_string();
        let record = ctx
            .begin_step(Step::Procedures, &agent, "Looking up operational procedures".to_string())
            .await?;

        let request = ProceduresRequest {
            payment: payment.clone(),
            sanctions: sanctions.result.clone(),
            liquidity: Some(liquidity.result.clone()),
        };

        match self.agents.lookup_procedures(&request).await {
            Ok(outcome) => {
                let result = to_json(&outcome.result)?;
                self.tool_call(
                    ctx,
                    Step::Procedures,
                    &agent,
                    "procedures_lookup",
                    outcome.trace_id.as_deref(),
                    result.clone(),
                )
                .await?;

                let summary = format!(
                    "Procedures: {} ({} citation(s))",
                    outcome.result.final_action,
                    outcome.result.citations.len()
                );
                ctx.complete_step(
                    record,
                    summary,
                    result,
                    outcome.trace_id.clone(),
                    outcome.attempts,
                )
                .await?;
                Ok(Verdict::new(outcome.result, outcome.trace_id))
            }
            Err(failure) => {
                let substitute = substitute_procedures(&failure.error);
                let summary = failed_summary(
                    "Procedures lookup",
                    &failure,
                    "holding for manual review",
                );
                ctx.fail_step(record, &failure, summary, to_json(&substitute)?)
                    .await?;
                Ok(Verdict::substituted(substitute))
            }
        }
    }

    async fn summarize(
        &self,
        ctx: &RunContext,
        sanctions: &Verdict<SanctionsResult>,
        liquidity: Option<&Verdict<LiquidityResult>>,
        procedures: Option<&Verdict<ProceduresResult>>,
    ) -> Result<DecisionPacket> {
        let record = ctx
            .begin_step(Step::Summarize, ORCHESTRATOR, "Combining step results".to_string())
            .await?;

        let packet = self.engine.decide(sanctions, liquidity, procedures);
        let summary = format!("Decision {}", packet.decision);

        ctx.complete_step(record, summary, to_json(&packet)?, None, 0)
            .await?;
        Ok(packet)
    }

    async fn tool_call(
        &self,
        ctx: &RunContext,
        step: Step,
        agent: &str,
        tool: &str,
        trace_id: Option<&str>,
        output: Value,
    ) -> Result<()> {
        ctx.emit(
            step,
            agent,
            EventBody::ToolCall {
                tool: tool.to_string(),
                tool_run_id: trace_id.unwrap_or_default().to_string(),
                output,
            },
        )
        .await
        .map(|_| ())
    }

    /// Best effort: record the failure, then mark the run failed.
    async fn fail_run(&self, ctx: &RunContext, err: RunbookError) {
        error!(run_id = %ctx.run_id(), error = %err, kind = err.kind(), "Run failed");

        let reason = err.to_string();
        let body = EventBody::Error {
            error: reason.clone(),
            error_type: err.kind().to_string(),
            recoverable: false,
        };
        if let Err(e) = ctx.emit(Step::Summarize, ORCHESTRATOR, body).await {
            warn!(run_id = %ctx.run_id(), error = %e, "Could not append error event");
        }

        let audit_digest = ctx
            .bounded("event read", self.log.read_from(ctx.run_id(), 1))
            .await
            .ok()
            .map(|events| event_log_digest(&events));

        let outcome = RunOutcome {
            status: RunStatus::Failed,
            decision_packet: internal_failure_packet(&reason),
            error: Some(reason),
            audit_digest,
        };
        if let Err(e) = ctx
            .bounded("run finalize", self.store.finalize(ctx.run_id(), outcome))
            .await
        {
            error!(run_id = %ctx.run_id(), error = %e, "Could not mark run failed");
        }
    }
}

fn validate_run_id(id: String) -> Result<RunId> {
    let trimmed = id.trim();
    let valid = !trimmed.is_empty()
        && trimmed.len() <= MAX_RUN_ID_LEN
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'));

    if !valid {
        return Err(RunbookError::InvalidRequest(format!("invalid run_id '{}'", id)));
    }
    Ok(trimmed.to_string())
}

fn failed_summary(what: &str, failure: &AgentFailure, fallback: &str) -> String {
    format!(
        "{} failed after {} attempt(s): {}; {}",
        what, failure.attempts, failure.error, fallback
    )
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::retry::FakeClock;
    use crate::agents::testing::{Scripted, ScriptedTransport};
    use crate::agents::{AgentTransport, StubAgentTransport};
    use crate::error::{AgentError, ErrorClass};
    use crate::models::{FinalDecision, StepRecord, StepStatus};
    use futures_util::StreamExt;
    use serde_json::json;

    fn settings() -> Settings {
        Settings {
            agent_timeout: Duration::from_millis(50),
            ..Settings::default()
        }
    }

    fn orchestrator_with(transport: Arc<dyn AgentTransport>) -> RunOrchestrator {
        let settings = settings();
        let agents = ComplianceAgents::with_transport(transport, &settings)
            .with_clock(Arc::new(FakeClock::new()));
        RunOrchestrator::in_memory(agents, &settings)
    }

    fn stub_orchestrator() -> RunOrchestrator {
        orchestrator_with(Arc::new(StubAgentTransport::from_settings(&settings())))
    }

    async fn wait_terminal(orch: &RunOrchestrator, run_id: &str) -> RunResult {
        for _ in 0..400 {
            let result = orch.result(run_id).await.unwrap();
            if result.status.is_terminal() {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {} did not finish", run_id);
    }

    async fn run_to_end(orch: &RunOrchestrator, message: &str) -> (RunResult, Vec<RunEvent>) {
        let started = orch
            .start(message.to_string(), PaymentOverrides::default(), None)
            .await
            .unwrap();
        let events: Vec<RunEvent> = orch
            .subscribe(&started.run_id, 1)
            .await
            .unwrap()
            .collect()
            .await;
        (wait_terminal(orch, &started.run_id).await, events)
    }

    fn kinds(events: &[RunEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.body.kind()).collect()
    }

    fn assert_gap_free(events: &[RunEvent]) {
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
    }

    fn approver_roles(result: &RunResult) -> Vec<String> {
        result
            .decision_packet
            .as_ref()
            .map(|p| p.approvals_required.iter().map(|a| a.role.clone()).collect())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_clean_release() {
        let orch = stub_orchestrator();
        let (result, events) = run_to_end(
            &orch,
            "Urgent: pay $50,000 USD to Acme Trading LLC",
        )
        .await;

        assert_eq!(result.status, RunStatus::Completed);
        let packet = result.decision_packet.as_ref().unwrap();
        assert_eq!(packet.decision, FinalDecision::Release);
        assert_eq!(approver_roles(&result), vec!["Payments Operator"]);
        assert_eq!(packet.citations.len(), 2);

        assert_gap_free(&events);
        assert_eq!(kinds(&events).last(), Some(&"final"));
        assert_eq!(kinds(&events).iter().filter(|k| **k == "tool_call").count(), 3);
    }

    #[tokio::test]
    async fn test_sanctions_block_short_circuits() {
        let orch = stub_orchestrator();
        let (result, events) = run_to_end(&orch, "Wire $900,000 to Bank Maskan").await;

        let packet = result.decision_packet.as_ref().unwrap();
        assert_eq!(packet.decision, FinalDecision::RejectSanctions);
        assert_eq!(approver_roles(&result), vec!["Compliance Officer"]);

        let branch = events.iter().find(|e| e.body.kind() == "branch").unwrap();
        assert!(matches!(branch.body, EventBody::Branch { target: Step::Summarize, .. }));
        assert!(events.iter().all(|e| e.step != Step::Liquidity && e.step != Step::Procedures));

        let detail = orch.detail(&result.run_id).await.unwrap();
        let steps: Vec<Step> = detail.run.steps.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![Step::Intake, Step::Sanctions, Step::Summarize]);
    }

    #[tokio::test]
    async fn test_liquidity_breach_holds() {
        let orch = stub_orchestrator();
        let (result, _) = run_to_end(
            &orch,
            "Emergency payment of $250,000 USD to Acme Trading LLC",
        )
        .await;

        let packet = result.decision_packet.as_ref().unwrap();
        assert_eq!(packet.decision, FinalDecision::HoldPendingApproval);
        assert_eq!(approver_roles(&result), vec!["Treasury Manager"]);
        assert!(packet.rationale.iter().any(|r| r.contains("$125,000")));
    }

    #[tokio::test]
    async fn test_sanctions_timeout_escalates_and_completes() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .script("sanctions-screening-agent", vec![Scripted::Hang])
                .script(
                    "liquidity-screening-agent",
                    vec![Scripted::Reply(json!({"status": "SUFFICIENT", "requested_amount": 1000.0}))],
                )
                .script(
                    "operational-procedures-agent",
                    vec![Scripted::Reply(json!({"final_action": "ESCALATE"}))],
                ),
        );
        let orch = orchestrator_with(transport.clone());
        let (result, events) = run_to_end(&orch, "Pay 10,000 USD to Acme Trading LLC").await;

        assert_eq!(result.status, RunStatus::Completed);
        let packet = result.decision_packet.as_ref().unwrap();
        assert_eq!(packet.decision, FinalDecision::EscalateCompliance);
        assert!(packet
            .rationale
            .iter()
            .any(|r| r.to_lowercase().contains("manual review required")));
        assert_eq!(transport.call_count("sanctions-screening-agent"), 3);

        let failed = events.iter().find(|e| e.body.kind() == "step_failed").unwrap();
        assert_eq!(failed.step, Step::Sanctions);
        match &failed.body {
            EventBody::StepFailed { error_class, attempts, .. } => {
                assert_eq!(*error_class, ErrorClass::Timeout);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected body {:?}", other),
        }

        let detail = orch.detail(&result.run_id).await.unwrap();
        let sanctions: &StepRecord = detail.run.step(Step::Sanctions).unwrap();
        assert_eq!(sanctions.status, StepStatus::Failed);
        assert!(detail.audit.unwrap().valid);
    }

    #[tokio::test]
    async fn test_duplicate_start_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new().script(
            "sanctions-screening-agent",
            vec![Scripted::Fail(AgentError::Rejected { status: 400, reason: "no".into() })],
        ));
        let orch = orchestrator_with(transport.clone());

        let (first, second) = tokio::join!(
            orch.start(
                "Pay 5,000 USD to Acme Trading LLC".into(),
                PaymentOverrides::default(),
                Some("run-e".into()),
            ),
            orch.start(
                "Pay 5,000 USD to Acme Trading LLC".into(),
                PaymentOverrides::default(),
                Some("run-e".into()),
            ),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.run_id, second.run_id);
        assert_eq!([first.created, second.created].iter().filter(|c| **c).count(), 1);

        let a: Vec<RunEvent> = orch.subscribe("run-e", 1).await.unwrap().collect().await;
        let b: Vec<RunEvent> = orch.subscribe("run-e", 1).await.unwrap().collect().await;
        assert_eq!(a, b);
        assert_gap_free(&a);
        assert_eq!(a.iter().filter(|e| e.body.kind() == "final").count(), 1);

        wait_terminal(&orch, "run-e").await;
        assert_eq!(transport.call_count("sanctions-screening-agent"), 1);

        // a replay after completion still reports the original run
        let again = orch
            .start("different".into(), PaymentOverrides::default(), Some("run-e".into()))
            .await
            .unwrap();
        assert!(!again.created);
        assert_eq!(again.status, RunStatus::Completed);
        let replay: Vec<RunEvent> = orch.subscribe("run-e", 1).await.unwrap().collect().await;
        assert_eq!(replay, a);
    }

    #[tokio::test]
    async fn test_decisions_replay_identically() {
        let orch = stub_orchestrator();
        let overrides = PaymentOverrides {
            payment_id: Some("TXN-FIXED".into()),
            timestamp_utc: Some("2026-03-02T09:00:00Z".into()),
            ..Default::default()
        };

        let mut packets = Vec::new();
        for _ in 0..2 {
            let started = orch
                .start("Pay $250,000 to Acme Trading LLC".into(), overrides.clone(), None)
                .await
                .unwrap();
            packets.push(wait_terminal(&orch, &started.run_id).await.decision_packet.unwrap());
        }
        assert_eq!(
            serde_json::to_vec(&packets[0]).unwrap(),
            serde_json::to_vec(&packets[1]).unwrap()
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_superset() {
        let orch = stub_orchestrator();
        let started = orch
            .start("Pay $50,000 to Acme Trading LLC".into(), PaymentOverrides::default(), None)
            .await
            .unwrap();

        let mut early = orch.subscribe(&started.run_id, 1).await.unwrap();
        let first_two = vec![early.next().await.unwrap(), early.next().await.unwrap()];

        wait_terminal(&orch, &started.run_id).await;
        let full: Vec<RunEvent> = orch.subscribe(&started.run_id, 1).await.unwrap().collect().await;
        assert!(full.len() > 2);
        assert_eq!(&full[..2], &first_two[..]);

        let tail: Vec<RunEvent> = orch.subscribe(&started.run_id, 3).await.unwrap().collect().await;
        assert_eq!(&full[2..], &tail[..]);
    }

    #[tokio::test]
    async fn test_unknown_run_and_bad_requests() {
        let orch = stub_orchestrator();
        assert!(matches!(orch.result("missing").await, Err(RunbookError::RunNotFound(_))));
        assert!(matches!(orch.subscribe("missing", 1).await, Err(RunbookError::RunNotFound(_))));
        assert!(matches!(
            orch.start("  ".into(), PaymentOverrides::default(), None).await,
            Err(RunbookError::InvalidRequest(_))
        ));
        assert!(matches!(
            orch.start("pay".into(), PaymentOverrides::default(), Some("bad id!".into())).await,
            Err(RunbookError::InvalidRequest(_))
        ));
    }

    /// Store that refuses to record the parsed payment.
    struct BrokenPaymentStore(InMemoryRunStore);

    #[async_trait::async_trait]
    impl RunStore for BrokenPaymentStore {
        async fn create(&self, run: Run) -> Result<Run> {
            self.0.create(run).await
        }
        async fn get(&self, run_id: &str) -> Result<Option<Run>> {
            self.0.get(run_id).await
        }
        async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
            self.0.update_status(run_id, status).await
        }
        async fn upsert_step(&self, run_id: &str, record: StepRecord) -> Result<()> {
            self.0.upsert_step(run_id, record).await
        }
        async fn set_payment(&self, _run_id: &str, _payment: PaymentRequest) -> Result<()> {
            Err(RunbookError::StoreError("disk full".into()))
        }
        async fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<Run> {
            self.0.finalize(run_id, outcome).await
        }
        async fn list(&self, filter: RunFilter) -> Result<Vec<RunSummary>> {
            self.0.list(filter).await
        }
    }

    #[tokio::test]
    async fn test_internal_failure_fails_run_with_packet() {
        let settings = settings();
        let agents = ComplianceAgents::with_transport(
            Arc::new(StubAgentTransport::from_settings(&settings)),
            &settings,
        );
        let orch = RunOrchestrator::new(
            agents,
            DecisionEngine::default(),
            Arc::new(BrokenPaymentStore(InMemoryRunStore::new())),
            Arc::new(InMemoryEventLog::new()),
            settings.write_timeout,
        );

        let (result, events) = run_to_end(&orch, "Pay $50,000 to Acme Trading LLC").await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap_or_default().contains("disk full"));
        let packet = result.decision_packet.unwrap();
        assert_eq!(packet.decision, FinalDecision::EscalateCompliance);
        assert!(packet.rationale[0].starts_with("Internal orchestration failure"));

        assert_eq!(kinds(&events).last(), Some(&"error"));
        assert_gap_free(&events);
    }

    /// Store whose `finalize` fails a set number of times.
    struct FlakyFinalizeStore {
        inner: InMemoryRunStore,
        failures_left: std::sync::atomic::AtomicU32,
    }

    impl FlakyFinalizeStore {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryRunStore::new(),
                failures_left: std::sync::atomic::AtomicU32::new(failures),
            }
        }
    }

    #[async_trait::async_trait]
    impl RunStore for FlakyFinalizeStore {
        async fn create(&self, run: Run) -> Result<Run> {
            self.inner.create(run).await
        }
        async fn get(&self, run_id: &str) -> Result<Option<Run>> {
            self.inner.get(run_id).await
        }
        async fn update_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
            self.inner.update_status(run_id, status).await
        }
        async fn upsert_step(&self, run_id: &str, record: StepRecord) -> Result<()> {
            self.inner.upsert_step(run_id, record).await
        }
        async fn set_payment(&self, run_id: &str, payment: PaymentRequest) -> Result<()> {
            self.inner.set_payment(run_id, payment).await
        }
        async fn finalize(&self, run_id: &str, outcome: RunOutcome) -> Result<Run> {
            use std::sync::atomic::Ordering;
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(RunbookError::StoreError("connection reset".into()));
            }
            self.inner.finalize(run_id, outcome).await
        }
        async fn list(&self, filter: RunFilter) -> Result<Vec<RunSummary>> {
            self.inner.list(filter).await
        }
    }

    fn flaky_orchestrator(failures: u32) -> RunOrchestrator {
        let settings = settings();
        let agents = ComplianceAgents::with_transport(
            Arc::new(StubAgentTransport::from_settings(&settings)),
            &settings,
        );
        RunOrchestrator::new(
            agents,
            DecisionEngine::default(),
            Arc::new(FlakyFinalizeStore::new(failures)),
            Arc::new(InMemoryEventLog::new()),
            settings.write_timeout,
        )
    }

    fn streamed_packet(events: &[RunEvent]) -> DecisionPacket {
        match events.last().map(|e| &e.body) {
            Some(EventBody::Final { decision_packet, .. }) => decision_packet.clone(),
            other => panic!("stream did not end with final: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finalize_retry_stores_streamed_decision() {
        let orch = flaky_orchestrator(2);
        let (result, events) = run_to_end(&orch, "Pay $50,000 to Acme Trading LLC").await;

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.decision_packet, Some(streamed_packet(&events)));

        let detail = orch.detail(&result.run_id).await.unwrap();
        assert!(detail.events.iter().all(|e| e.body.kind() != "error"));
        assert!(detail.audit.unwrap().valid);
    }

    #[tokio::test]
    async fn test_finalize_outage_never_contradicts_final_event() {
        let orch = flaky_orchestrator(u32::MAX);
        let started = orch
            .start("Pay $50,000 to Acme Trading LLC".into(), PaymentOverrides::default(), None)
            .await
            .unwrap();
        let events: Vec<RunEvent> = orch
            .subscribe(&started.run_id, 1)
            .await
            .unwrap()
            .collect()
            .await;
        streamed_packet(&events);

        // let every finalize attempt run out
        tokio::time::sleep(Duration::from_millis(300)).await;

        let result = orch.result(&started.run_id).await.unwrap();
        assert_ne!(result.status, RunStatus::Failed);
        assert!(result.decision_packet.is_none());

        let detail = orch.detail(&started.run_id).await.unwrap();
        assert_eq!(detail.events.len(), events.len());
        assert_eq!(kinds(&detail.events).last(), Some(&"final"));
    }

    #[tokio::test]
    async fn test_list_caps_limit() {
        let orch = stub_orchestrator();
        for _ in 0..3 {
            let started = orch
                .start("Pay $1,000 to Acme Trading LLC".into(), PaymentOverrides::default(), None)
                .await
                .unwrap();
            wait_terminal(&orch, &started.run_id).await;
        }
        let runs = orch
            .list(RunFilter {
                status: Some(RunStatus::Completed),
                limit: 10_000,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.decision == Some(FinalDecision::Release)));
    }
}
