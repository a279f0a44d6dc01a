//! Dry-run agents
//!
//! Deterministic stand-ins for the three compliance agents, used when no
//! agent gateway is configured.

use super::{AgentReply, AgentTransport, LiquidityRequest, ProceduresRequest, SanctionsRequest};
use crate::config::Settings;
use crate::error::AgentError;
use crate::models::{
    Approval, ChecklistItem, Citation, LiquidityRecommendation, LiquidityResult, LiquidityStatus,
    ProceduresResult, SanctionsDecision, SanctionsResult,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

const WATCHLIST: [&str; 2] = ["MASKAN", "SINALOA"];
const REVIEW_MARKER: &str = "REVIEW";

const START_OF_DAY_BALANCE: f64 = 3_500_000.0;
const COMMITTED_OUTFLOWS: f64 = 1_375_000.0;
const USD_BUFFER: f64 = 2_000_000.0;
const OTHER_BUFFER: f64 = 1_500_000.0;

pub struct StubAgentTransport {
    sanctions: String,
    liquidity: String,
    procedures: String,
}

impl StubAgentTransport {
    pub fn new(
        sanctions: impl Into<String>,
        liquidity: impl Into<String>,
        procedures: impl Into<String>,
    ) -> Self {
        Self {
            sanctions: sanctions.into(),
            liquidity: liquidity.into(),
            procedures: procedures.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.sanctions_agent.clone(),
            settings.liquidity_agent.clone(),
            settings.procedures_agent.clone(),
        )
    }
}

#[async_trait]
impl AgentTransport for StubAgentTransport {
    async fn invoke(&self, agent: &str, request: &Value) -> Result<AgentReply, AgentError> {
        let (payment_id, body) = if agent == self.sanctions {
            let req: SanctionsRequest = decode(request)?;
            (req.payment_id.clone(), encode(&screen(&req))?)
        } else if agent == self.liquidity {
            let req: LiquidityRequest = decode(request)?;
            (req.payment_id.clone(), encode(&assess(&req))?)
        } else if agent == self.procedures {
            let req: ProceduresRequest = decode(request)?;
            (req.payment.payment_id.clone(), encode(&lookup(&req))?)
        } else {
            return Err(AgentError::Rejected {
                status: 404,
                reason: format!("unknown agent '{}'", agent),
            });
        };

        Ok(AgentReply {
            body,
            trace_id: format!("stub-{}-{}", agent, payment_id),
        })
    }
}

fn decode<T: DeserializeOwned>(request: &Value) -> Result<T, AgentError> {
    serde_json::from_value(request.clone()).map_err(|e| AgentError::Rejected {
        status: 422,
        reason: e.to_string(),
    })
}

fn encode<T: Serialize>(result: &T) -> Result<Value, AgentError> {
    serde_json::to_value(result).map_err(|e| AgentError::Malformed(e.to_string()))
}

// =============================
// Sanctions
// =============================

fn screen(req: &SanctionsRequest) -> SanctionsResult {
    let name = req.beneficiary_name.to_uppercase();

    let (decision, confidence, match_type, match_details, recommendation) =
        if let Some(hit) = WATCHLIST.iter().find(|entry| name.contains(*entry)) {
            (
                SanctionsDecision::Block,
                98,
                "EXACT",
                Some(json!({"list": "OFAC SDN", "entry": hit})),
                "Block payment and file regulatory report",
            )
        } else if name.contains(REVIEW_MARKER) {
            (
                SanctionsDecision::Escalate,
                62,
                "FUZZY",
                Some(json!({"list": "EU Consolidated", "similarity": 0.81})),
                "Escalate for manual sanctions review",
            )
        } else {
            (SanctionsDecision::Clear, 95, "NONE", None, "No watchlist match; proceed")
        };

    SanctionsResult {
        beneficiary_screened: req.beneficiary_name.clone(),
        decision,
        confidence,
        match_type: match_type.to_string(),
        match_details,
        recommendation: recommendation.to_string(),
        degraded: false,
    }
}

// =============================
// Liquidity
// =============================

fn assess(req: &LiquidityRequest) -> LiquidityResult {
    let available = START_OF_DAY_BALANCE - COMMITTED_OUTFLOWS;
    let buffer = if req.currency.eq_ignore_ascii_case("USD") {
        USD_BUFFER
    } else {
        OTHER_BUFFER
    };
    let headroom = available - buffer;
    let breach = req.amount > headroom;

    let recommendation = if breach {
        LiquidityRecommendation {
            action: "HOLD".to_string(),
            reason: format!(
                "Payment exceeds buffer headroom of {:.2} {}",
                headroom, req.currency
            ),
            alternatives: vec![
                format!("Partial release up to {:.2} {}", headroom.max(0.0), req.currency),
                "Request intraday funding from Treasury".to_string(),
            ],
        }
    } else {
        LiquidityRecommendation {
            action: "RELEASE".to_string(),
            reason: "Buffer maintained after payment".to_string(),
            alternatives: Vec::new(),
        }
    };

    LiquidityResult {
        status: if breach {
            LiquidityStatus::Breach
        } else {
            LiquidityStatus::Sufficient
        },
        requested_amount: req.amount,
        currency: req.currency.clone(),
        available_balance: Some(available),
        buffer_threshold: Some(buffer),
        reported_gap: None,
        first_breach_time: breach.then(|| req.timestamp_utc.clone()),
        recommendation,
        degraded: false,
        note: None,
    }
}

// =============================
// Procedures
// =============================

fn lookup(req: &ProceduresRequest) -> ProceduresResult {
    let liquidity = req.liquidity.as_ref();

    let (final_action, reason, approvals) = match req.sanctions.decision {
        SanctionsDecision::Block => (
            "REJECT",
            "Sanctions match confirmed",
            vec![Approval::new("Compliance Officer", "Sanctions rejection", 4)],
        ),
        SanctionsDecision::Escalate => (
            "ESCALATE",
            "Potential sanctions match requires review",
            vec![
                Approval::new("Compliance Manager", "Sanctions escalation", 4),
                Approval::new("MLRO", "Regulatory reporting decision", 24),
            ],
        ),
        SanctionsDecision::Clear => match liquidity {
            Some(l) if l.degraded => (
                "ESCALATE",
                "Liquidity position unknown",
                vec![Approval::new("Treasury Manager", "Liquidity override", 2)],
            ),
            Some(l) if l.is_breach() => (
                "HOLD",
                "Liquidity buffer breach",
                vec![Approval::new("Treasury Manager", "Buffer breach approval", 2)],
            ),
            Some(_) => (
                "RELEASE",
                "All checks passed",
                vec![Approval::new("Payments Operator", "Standard release", 1)],
            ),
            None => (
                "ESCALATE",
                "Liquidity not assessed",
                vec![Approval::new("Treasury Manager", "Liquidity override", 2)],
            ),
        },
    };

    ProceduresResult {
        final_action: final_action.to_string(),
        reason: reason.to_string(),
        policy_reference: Some("EPP-4.2".to_string()),
        required_approvals: approvals,
        workflow_steps: vec![
            ChecklistItem::new(1, "Verify payment details against request", "Payments Operator", "Payment instruction"),
            ChecklistItem::new(2, "Record approvals in payment system", "Approver", "Approval log"),
        ],
        citations: vec![
            Citation {
                source: "Emergency Payments Policy".to_string(),
                snippet: "Emergency payments require documented approval before release.".to_string(),
                reference: "EPP-4.2".to_string(),
            },
            Citation {
                source: "Liquidity Buffer Standard".to_string(),
                snippet: "Payments that reduce balances below the buffer require Treasury approval.".to_string(),
                reference: "LBS-2.1".to_string(),
            },
        ],
        policies_consulted: vec!["EPP-4.2".to_string(), "LBS-2.1".to_string()],
        cutoff: None,
        conditions: Vec::new(),
        documentation_outstanding: Vec::new(),
        degraded: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub() -> StubAgentTransport {
        StubAgentTransport::new("sanctions", "liquidity", "procedures")
    }

    fn sanctions_request(name: &str) -> Value {
        json!({"payment_id": "TXN-1", "beneficiary_name": name, "beneficiary_country": null,
               "amount": 1000.0, "currency": "USD"})
    }

    fn liquidity_request(amount: f64, currency: &str) -> Value {
        json!({"payment_id": "TXN-1", "entity": "BankSubsidiary_TR", "account_id": "ACC-BAN-001",
               "amount": amount, "currency": currency, "timestamp_utc": "2026-01-01T10:00:00Z",
               "channel": "SWIFT"})
    }

    #[tokio::test]
    async fn test_watchlist_names_are_blocked() {
        let reply = stub().invoke("sanctions", &sanctions_request("Bank Maskan")).await.unwrap();
        let result: SanctionsResult = serde_json::from_value(reply.body).unwrap();
        assert_eq!(result.decision, SanctionsDecision::Block);
        assert_eq!(reply.trace_id, "stub-sanctions-TXN-1");

        let reply = stub()
            .invoke("sanctions", &sanctions_request("Review Holdings"))
            .await
            .unwrap();
        let result: SanctionsResult = serde_json::from_value(reply.body).unwrap();
        assert_eq!(result.decision, SanctionsDecision::Escalate);
    }

    #[tokio::test]
    async fn test_liquidity_breach_gap() {
        let reply = stub().invoke("liquidity", &liquidity_request(250_000.0, "USD")).await.unwrap();
        let result: LiquidityResult = serde_json::from_value(reply.body).unwrap();
        assert_eq!(result.status, LiquidityStatus::Breach);
        assert_eq!(result.gap(), Some(125_000.0));

        let reply = stub().invoke("liquidity", &liquidity_request(250_000.0, "EUR")).await.unwrap();
        let result: LiquidityResult = serde_json::from_value(reply.body).unwrap();
        assert_eq!(result.status, LiquidityStatus::Sufficient);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_rejected() {
        let err = stub().invoke("fx", &json!({})).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
