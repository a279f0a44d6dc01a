//! Run event log
//!
//! Append-only, per-run, gap-free sequenced events. The same log feeds the
//! live stream and the after-the-fact result/detail views, which is why
//! ordering uses the sequence number and never the timestamp.

use crate::decision::format_money;
use crate::error::{ErrorClass, RunbookError};
use crate::models::{DecisionPacket, FinalDecision, RunId, Step};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Agent name used for locally computed steps.
pub const ORCHESTRATOR: &str = "orchestrator";

/// Kind-specific event payload. `type` and `payload` at the wire boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventBody {
    StepStarted {
        message: String,
    },
    StepCompleted {
        summary: String,
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_id: Option<String>,
        #[serde(default)]
        attempts: u32,
    },
    StepFailed {
        error_class: ErrorClass,
        error: String,
        attempts: u32,
        /// The conservative result used in place of the agent's answer.
        substitution: Value,
    },
    ToolCall {
        tool: String,
        tool_run_id: String,
        output: Value,
    },
    Branch {
        condition: String,
        target: Step,
        reason: String,
    },
    Final {
        decision: FinalDecision,
        summary: String,
        decision_packet: DecisionPacket,
    },
    Error {
        error: String,
        error_type: String,
        recoverable: bool,
    },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::StepStarted { .. } => "step_started",
            EventBody::StepCompleted { .. } => "step_completed",
            EventBody::StepFailed { .. } => "step_failed",
            EventBody::ToolCall { .. } => "tool_call",
            EventBody::Branch { .. } => "branch",
            EventBody::Final { .. } => "final",
            EventBody::Error { .. } => "error",
        }
    }

    /// `final` and `error` end a run's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventBody::Final { .. } | EventBody::Error { .. })
    }

    pub fn final_decision(packet: DecisionPacket, amount: Option<(f64, &str)>) -> Self {
        let summary = match amount {
            Some((value, currency)) => format!(
                "{} ({}) for {}",
                packet.decision,
                category_label(packet.decision),
                format_money(value, currency)
            ),
            None => format!("{} ({})", packet.decision, category_label(packet.decision)),
        };
        EventBody::Final {
            decision: packet.decision,
            summary,
            decision_packet: packet,
        }
    }
}

fn category_label(decision: FinalDecision) -> &'static str {
    match decision.category() {
        crate::models::DecisionCategory::Release => "release",
        crate::models::DecisionCategory::Hold => "hold",
        crate::models::DecisionCategory::Escalate => "escalate",
        crate::models::DecisionCategory::Reject => "reject",
    }
}

/// Event before the log assigns it a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub step: Step,
    pub agent: String,
    pub elapsed_ms: u64,
    pub body: EventBody,
}

impl NewEvent {
    pub fn new(step: Step, agent: impl Into<String>, elapsed_ms: u64, body: EventBody) -> Self {
        Self {
            step,
            agent: agent.into(),
            elapsed_ms,
            body,
        }
    }
}

/// Wire shape: `{run_id, seq, type, step, agent, ts, elapsed_ms, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunEvent {
    pub run_id: RunId,
    pub seq: u64,
    pub step: Step,
    pub agent: String,
    /// ISO-8601 wall clock at append time.
    pub ts: String,
    pub elapsed_ms: u64,
    #[serde(flatten)]
    pub body: EventBody,
}

impl RunEvent {
    pub fn from_new(run_id: &str, seq: u64, event: NewEvent) -> Self {
        Self {
            run_id: run_id.to_string(),
            seq,
            step: event.step,
            agent: event.agent,
            ts: Utc::now().to_rfc3339(),
            elapsed_ms: event.elapsed_ms,
            body: event.body,
        }
    }

    /// `data: <json>\n\n` text/event-stream frame.
    pub fn to_sse_frame(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

// =============================
// Event Log
// =============================

#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Append an event; the log assigns the next sequence number atomically.
    async fn append(&self, run_id: &str, event: NewEvent) -> Result<RunEvent>;

    /// Events with `seq >= from_seq`, in order. Empty when caught up.
    async fn read_from(&self, run_id: &str, from_seq: u64) -> Result<Vec<RunEvent>>;
}

/// In-memory event log for development and tests
pub struct InMemoryEventLog {
    events: Arc<RwLock<HashMap<RunId, Vec<RunEvent>>>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, run_id: &str, event: NewEvent) -> Result<RunEvent> {
        if run_id.is_empty() {
            return Err(RunbookError::EventLogError("empty run id".to_string()));
        }

        // numbering and push happen under one write lock
        let mut events = self.events.write().await;
        let log = events.entry(run_id.to_string()).or_default();
        let appended = RunEvent::from_new(run_id, log.len() as u64 + 1, event);
        log.push(appended.clone());

        Ok(appended)
    }

    async fn read_from(&self, run_id: &str, from_seq: u64) -> Result<Vec<RunEvent>> {
        let events = self.events.read().await;
        let skip = from_seq.saturating_sub(1) as usize;

        Ok(events
            .get(run_id)
            .map(|log| log.iter().skip(skip).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(step: Step) -> NewEvent {
        NewEvent::new(
            step,
            ORCHESTRATOR,
            0,
            EventBody::StepStarted {
                message: format!("{} started", step),
            },
        )
    }

    #[tokio::test]
    async fn test_sequence_is_gap_free_under_concurrent_appends() {
        let log = Arc::new(InMemoryEventLog::new());

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let log = log.clone();
                tokio::spawn(async move { log.append("run-1", started(Step::Intake)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let events = log.read_from("run-1", 1).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=50).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_runs_are_numbered_independently() {
        let log = InMemoryEventLog::new();
        log.append("a", started(Step::Intake)).await.unwrap();
        log.append("a", started(Step::Sanctions)).await.unwrap();
        let first_b = log.append("b", started(Step::Intake)).await.unwrap();
        assert_eq!(first_b.seq, 1);

        let tail = log.read_from("a", 2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].step, Step::Sanctions);
        assert!(log.read_from("a", 3).await.unwrap().is_empty());
        assert!(log.read_from("missing", 1).await.unwrap().is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let event = RunEvent {
            run_id: "run-9".into(),
            seq: 4,
            step: Step::Sanctions,
            agent: "sanctions-screening-agent".into(),
            ts: "2026-01-01T00:00:00+00:00".into(),
            elapsed_ms: 120,
            body: EventBody::Branch {
                condition: "sanctions == BLOCK".into(),
                target: Step::Summarize,
                reason: "Sanctions hit".into(),
            },
        };

        let json: Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "branch");
        assert_eq!(json["seq"], 4);
        assert_eq!(json["step"], "sanctions");
        assert_eq!(json["payload"]["target"], "summarize");
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
        for key in ["run_id", "seq", "type", "step", "agent", "ts", "elapsed_ms", "payload"] {
            assert!(keys.contains(&key), "missing {}", key);
        }

        let frame = event.to_sse_frame().unwrap();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));

        let back: RunEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
