//! Core data models for the emergency payment runbook

use crate::error::{ErrorClass, RunbookError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Opaque run identifier (caller- or system-generated).
pub type RunId = String;

//
// ================= Pipeline Steps =================
//

/// The fixed, totally ordered pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Intake,
    Sanctions,
    Liquidity,
    Procedures,
    Summarize,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Intake => "intake",
            Step::Sanctions => "sanctions",
            Step::Liquidity => "liquidity",
            Step::Procedures => "procedures",
            Step::Summarize => "summarize",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//
// ================= Status Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Status only ever moves forward: pending -> running -> {completed | failed}.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RunbookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(RunbookError::InvalidRequest(format!(
                "Invalid status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

//
// ================= Step Record =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub class: ErrorClass,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    pub step: Step,
    pub status: StepStatus,
    pub agent: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub summary: String,
    pub result: Option<Value>,
    pub error: Option<StepError>,
}

impl StepRecord {
    pub fn started(step: Step, agent: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            step,
            status: StepStatus::Running,
            agent: agent.into(),
            started_at: now,
            ended_at: None,
            elapsed_ms: None,
            summary: String::new(),
            result: None,
            error: None,
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>, summary: String, result: Value) {
        self.finish(now, StepStatus::Completed);
        self.summary = summary;
        self.result = Some(result);
    }

    pub fn fail(
        &mut self,
        now: DateTime<Utc>,
        summary: String,
        error: StepError,
        substitute: Value,
    ) {
        self.finish(now, StepStatus::Failed);
        self.summary = summary;
        self.error = Some(error);
        self.result = Some(substitute);
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Failed)
    }

    // end time never precedes start time, even if the wall clock stepped back
    fn finish(&mut self, now: DateTime<Utc>, status: StepStatus) {
        let ended = now.max(self.started_at);
        self.ended_at = Some(ended);
        self.elapsed_ms = Some((ended - self.started_at).num_milliseconds().max(0) as u64);
        self.status = status;
    }
}

//
// ================= Payment =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PaymentOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_utc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beneficiary_country: Option<String>,
}

/// Normalized payment request produced by the intake step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentRequest {
    pub payment_id: String,
    pub beneficiary_name: String,
    pub beneficiary_country: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub timestamp_utc: String,
    pub entity: String,
    pub account_id: String,
    pub channel: String,
    pub freeform_notes: Option<String>,
}

//
// ================= Agent Results =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SanctionsDecision {
    Clear,
    #[serde(alias = "REVIEW_REQUIRED")]
    Escalate,
    Block,
}

impl fmt::Display for SanctionsDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SanctionsDecision::Clear => "CLEAR",
            SanctionsDecision::Escalate => "ESCALATE",
            SanctionsDecision::Block => "BLOCK",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SanctionsResult {
    pub beneficiary_screened: String,
    pub decision: SanctionsDecision,
    #[serde(default)]
    pub confidence: u8,
    #[serde(default = "unknown")]
    pub match_type: String,
    #[serde(default)]
    pub match_details: Option<Value>,
    #[serde(default)]
    pub recommendation: String,
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidityStatus {
    #[serde(alias = "NO_BREACH")]
    Sufficient,
    Breach,
    Insufficient,
    Unavailable,
}

impl fmt::Display for LiquidityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LiquidityStatus::Sufficient => "SUFFICIENT",
            LiquidityStatus::Breach => "BREACH",
            LiquidityStatus::Insufficient => "INSUFFICIENT",
            LiquidityStatus::Unavailable => "UNAVAILABLE",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LiquidityRecommendation {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidityResult {
    pub status: LiquidityStatus,
    pub requested_amount: f64,
    #[serde(default = "usd")]
    pub currency: String,
    #[serde(default)]
    pub available_balance: Option<f64>,
    #[serde(default)]
    pub buffer_threshold: Option<f64>,
    /// Gap as reported by the agent; used only when balances are absent.
    #[serde(default, rename = "gap")]
    pub reported_gap: Option<f64>,
    #[serde(default)]
    pub first_breach_time: Option<String>,
    #[serde(default)]
    pub recommendation: LiquidityRecommendation,
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub note: Option<String>,
}

impl LiquidityResult {
    pub fn is_breach(&self) -> bool {
        matches!(self.status, LiquidityStatus::Breach | LiquidityStatus::Insufficient)
    }

    /// Buffer shortfall: requested - (available - buffer), only when positive.
    pub fn gap(&self) -> Option<f64> {
        match (self.available_balance, self.buffer_threshold) {
            (Some(available), Some(buffer)) => {
                let gap = self.requested_amount - (available - buffer);
                (gap > 0.0).then_some(gap)
            }
            _ => self.reported_gap.filter(|gap| *gap > 0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Approval {
    pub role: String,
    #[serde(default)]
    pub authority: String,
    #[serde(default = "default_sla_hours")]
    pub sla_hours: u32,
}

impl Approval {
    pub fn new(role: &str, authority: &str, sla_hours: u32) -> Self {
        Self {
            role: role.to_string(),
            authority: authority.to_string(),
            sla_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChecklistItem {
    #[serde(alias = "step")]
    pub step_number: u32,
    pub action: String,
    #[serde(default)]
    pub responsible: String,
    #[serde(default)]
    pub documentation_required: String,
}

impl ChecklistItem {
    pub fn new(step_number: u32, action: &str, responsible: &str, documentation: &str) -> Self {
        Self {
            step_number,
            action: action.to_string(),
            responsible: responsible.to_string(),
            documentation_required: documentation.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub source: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub reference: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CutoffAssessment {
    pub cutoff_time: String,
    pub missed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProceduresResult {
    #[serde(default = "hold")]
    pub final_action: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub policy_reference: Option<String>,
    #[serde(default)]
    pub required_approvals: Vec<Approval>,
    #[serde(default)]
    pub workflow_steps: Vec<ChecklistItem>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub policies_consulted: Vec<String>,
    #[serde(default)]
    pub cutoff: Option<CutoffAssessment>,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub documentation_outstanding: Vec<String>,
    #[serde(default)]
    pub degraded: bool,
}

fn unknown() -> String {
    "UNKNOWN".to_string()
}

fn usd() -> String {
    "USD".to_string()
}

fn hold() -> String {
    "HOLD".to_string()
}

fn default_sla_hours() -> u32 {
    4
}

//
// ================= Decision =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalDecision {
    Release,
    ReleaseWithConditions,
    HoldPendingApproval,
    HoldPendingDocumentation,
    Escalate,
    EscalateCompliance,
    RejectSanctions,
    RejectLiquidity,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DecisionCategory {
    Release,
    Hold,
    Escalate,
    Reject,
}

impl FinalDecision {
    pub fn category(&self) -> DecisionCategory {
        match self {
            FinalDecision::Release | FinalDecision::ReleaseWithConditions => {
                DecisionCategory::Release
            }
            FinalDecision::HoldPendingApproval | FinalDecision::HoldPendingDocumentation => {
                DecisionCategory::Hold
            }
            FinalDecision::Escalate | FinalDecision::EscalateCompliance => {
                DecisionCategory::Escalate
            }
            FinalDecision::RejectSanctions | FinalDecision::RejectLiquidity => {
                DecisionCategory::Reject
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalDecision::Release => "RELEASE",
            FinalDecision::ReleaseWithConditions => "RELEASE_WITH_CONDITIONS",
            FinalDecision::HoldPendingApproval => "HOLD_PENDING_APPROVAL",
            FinalDecision::HoldPendingDocumentation => "HOLD_PENDING_DOCUMENTATION",
            FinalDecision::Escalate => "ESCALATE",
            FinalDecision::EscalateCompliance => "ESCALATE_COMPLIANCE",
            FinalDecision::RejectSanctions => "REJECT_SANCTIONS",
            FinalDecision::RejectLiquidity => "REJECT_LIQUIDITY",
        }
    }
}

impl fmt::Display for FinalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlates the packet with each upstream agent's own trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditNote {
    pub rule: String,
    pub sanctions_trace_id: Option<String>,
    pub liquidity_trace_id: Option<String>,
    pub procedures_trace_id: Option<String>,
    pub policies_consulted: Vec<String>,
    pub degraded_steps: Vec<Step>,
}

/// Terminal artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionPacket {
    pub decision: FinalDecision,
    pub rationale: Vec<String>,
    pub approvals_required: Vec<Approval>,
    pub procedure_checklist: Vec<ChecklistItem>,
    pub citations: Vec<Citation>,
    pub sod_constraints: Vec<String>,
    pub cutoff_actions: Vec<String>,
    pub audit_note: AuditNote,
}

//
// ================= Run =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: RunId,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: String,
    pub overrides: PaymentOverrides,
    pub payment: Option<PaymentRequest>,
    pub steps: Vec<StepRecord>,
    pub decision_packet: Option<DecisionPacket>,
    pub error: Option<String>,
    pub audit_digest: Option<String>,
}

impl Run {
    pub fn new(
        run_id: RunId,
        message: String,
        overrides: PaymentOverrides,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            status: RunStatus::Pending,
            created_at: now,
            completed_at: None,
            message,
            overrides,
            payment: None,
            steps: Vec::new(),
            decision_packet: None,
            error: None,
            audit_digest: None,
        }
    }

    pub fn transition(&mut self, next: RunStatus, now: DateTime<Utc>) -> crate::Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(RunbookError::InvalidTransition {
                run_id: self.run_id.clone(),
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    pub fn step(&self, step: Step) -> Option<&StepRecord> {
        self.steps.iter().find(|record| record.step == step)
    }

    /// Insert or replace the record for `record.step`.
    ///
    /// A new step may only be appended once every earlier record is terminal.
    pub fn upsert_step(&mut self, record: StepRecord) -> crate::Result<()> {
        if let Some(existing) = self.steps.iter_mut().find(|r| r.step == record.step) {
            *existing = record;
            return Ok(());
        }

        if let Some(last) = self.steps.last() {
            if last.step >= record.step || !last.is_terminal() {
                return Err(RunbookError::StoreError(format!(
                    "Step {} cannot follow {} ({:?}) in run {}",
                    record.step, last.step, last.status, self.run_id
                )));
            }
        }

        self.steps.push(record);
        Ok(())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            decision: self.decision_packet.as_ref().map(|p| p.decision),
            beneficiary: self.payment.as_ref().map(|p| p.beneficiary_name.clone()),
            amount: self.payment.as_ref().map(|p| p.amount),
            currency: self.payment.as_ref().map(|p| p.currency.clone()),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub decision: Option<FinalDecision>,
    pub beneficiary: Option<String>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_moves_forward_only() {
        let mut run = Run::new("r1".into(), "pay".into(), PaymentOverrides::default(), Utc::now());
        assert!(run.transition(RunStatus::Running, Utc::now()).is_ok());
        assert!(run.transition(RunStatus::Pending, Utc::now()).is_err());
        assert!(run.transition(RunStatus::Completed, Utc::now()).is_ok());
        assert!(run.completed_at.is_some());
        assert!(run.transition(RunStatus::Failed, Utc::now()).is_err());
        assert!(run.transition(RunStatus::Running, Utc::now()).is_err());
    }

    #[test]
    fn test_step_end_never_precedes_start() {
        let start = Utc::now();
        let mut record = StepRecord::started(Step::Sanctions, "sanctions-agent", start);
        record.complete(start - Duration::seconds(5), "ok".into(), Value::Null);
        assert_eq!(record.ended_at, Some(start));
        assert_eq!(record.elapsed_ms, Some(0));
    }

    #[test]
    fn test_steps_appended_in_pipeline_order() {
        let now = Utc::now();
        let mut run = Run::new("r2".into(), "pay".into(), PaymentOverrides::default(), now);

        run.upsert_step(StepRecord::started(Step::Intake, "orchestrator", now)).unwrap();
        // intake still running
        assert!(run
            .upsert_step(StepRecord::started(Step::Sanctions, "sanctions-agent", now))
            .is_err());

        let mut intake = run.step(Step::Intake).cloned().unwrap();
        intake.complete(now, "parsed".into(), Value::Null);
        run.upsert_step(intake).unwrap();
        run.upsert_step(StepRecord::started(Step::Sanctions, "sanctions-agent", now)).unwrap();
        assert_eq!(run.steps.len(), 2);

        let mut sanctions = run.step(Step::Sanctions).cloned().unwrap();
        sanctions.complete(now, "block".into(), Value::Null);
        run.upsert_step(sanctions).unwrap();

        // a short-circuited run jumps straight to summarize
        run.upsert_step(StepRecord::started(Step::Summarize, "orchestrator", now)).unwrap();
        assert_eq!(run.steps.len(), 3);

        // re-writing an existing step replaces it rather than duplicating it
        let mut summarize = run.step(Step::Summarize).cloned().unwrap();
        summarize.complete(now, "done".into(), Value::Null);
        run.upsert_step(summarize).unwrap();
        assert_eq!(run.steps.len(), 3);

        // but an earlier step that was never recorded cannot appear afterwards
        assert!(run
            .upsert_step(StepRecord::started(Step::Liquidity, "liquidity-agent", now))
            .is_err());
    }

    #[test]
    fn test_liquidity_gap() {
        let result = LiquidityResult {
            status: LiquidityStatus::Breach,
            requested_amount: 425_000.0,
            currency: "USD".into(),
            available_balance: Some(2_300_000.0),
            buffer_threshold: Some(2_000_000.0),
            reported_gap: None,
            first_breach_time: None,
            recommendation: LiquidityRecommendation::default(),
            degraded: false,
            note: None,
        };
        assert_eq!(result.gap(), Some(125_000.0));

        let ok = LiquidityResult {
            requested_amount: 100_000.0,
            status: LiquidityStatus::Sufficient,
            ..result
        };
        assert_eq!(ok.gap(), None);
    }

    #[test]
    fn test_decision_wire_names() {
        let json = serde_json::to_string(&FinalDecision::HoldPendingApproval).unwrap();
        assert_eq!(json, "\"HOLD_PENDING_APPROVAL\"");
        let parsed: FinalDecision = serde_json::from_str("\"REJECT_SANCTIONS\"").unwrap();
        assert_eq!(parsed, FinalDecision::RejectSanctions);
        assert_eq!(FinalDecision::ReleaseWithConditions.category(), DecisionCategory::Release);
    }

    #[test]
    fn test_review_required_alias() {
        let decision: SanctionsDecision = serde_json::from_str("\"REVIEW_REQUIRED\"").unwrap();
        assert_eq!(decision, SanctionsDecision::Escalate);
    }
}
