//! Decision engine
//!
//! Maps the three upstream step results onto one final decision. `decide`
//! is pure: no clock, no randomness, no I/O. Identical inputs always produce
//! an identical [`DecisionPacket`].
//!
//! Also home to the substitution results used when an agent fails for good.
//! Every substitution biases toward the conservative outcome.

use crate::error::AgentError;
use crate::models::{
    Approval, AuditNote, ChecklistItem, DecisionCategory, DecisionPacket, FinalDecision,
    LiquidityRecommendation, LiquidityResult, LiquidityStatus, ProceduresResult,
    SanctionsDecision, SanctionsResult, Step,
};
use serde_json::json;

pub const MANUAL_REVIEW: &str = "System error - manual review required";
pub const LIQUIDITY_DEGRADED: &str = "System degradation - liquidity check unavailable";
pub const PROCEDURES_DEGRADED: &str = "System degradation - manual review required";

const DUAL_APPROVAL_THRESHOLD_USD: f64 = 250_000.0;

/// A step result together with the upstream trace that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict<T> {
    pub result: T,
    pub trace_id: Option<String>,
}

impl<T> Verdict<T> {
    pub fn new(result: T, trace_id: Option<String>) -> Self {
        Self { result, trace_id }
    }

    /// A substituted result has no upstream trace.
    pub fn substituted(result: T) -> Self {
        Self {
            result,
            trace_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    SanctionsBlock,
    SanctionsEscalate,
    LiquidityUnavailable,
    BreachAfterCutoff,
    Breach,
    Clear,
}

impl Rule {
    fn as_str(&self) -> &'static str {
        match self {
            Rule::SanctionsBlock => "sanctions_block",
            Rule::SanctionsEscalate => "sanctions_escalate",
            Rule::LiquidityUnavailable => "liquidity_unavailable",
            Rule::BreachAfterCutoff => "liquidity_breach_after_cutoff",
            Rule::Breach => "liquidity_breach",
            Rule::Clear => "all_clear",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Rule::SanctionsBlock => "sanctions BLOCK requires rejection",
            Rule::SanctionsEscalate => "possible sanctions match requires compliance review",
            Rule::LiquidityUnavailable => "liquidity position unknown, escalating to Treasury",
            Rule::BreachAfterCutoff => "buffer breach with cutoff missed requires rejection",
            Rule::Breach => "buffer breach requires Treasury approval",
            Rule::Clear => "all checks clear, payment may be released",
        }
    }

    fn decision(&self) -> FinalDecision {
        match self {
            Rule::SanctionsBlock => FinalDecision::RejectSanctions,
            Rule::SanctionsEscalate => FinalDecision::EscalateCompliance,
            Rule::LiquidityUnavailable => FinalDecision::Escalate,
            Rule::BreachAfterCutoff => FinalDecision::RejectLiquidity,
            Rule::Breach => FinalDecision::HoldPendingApproval,
            Rule::Clear => FinalDecision::Release,
        }
    }

    fn approvals(&self) -> Vec<Approval> {
        match self {
            Rule::SanctionsBlock => vec![Approval::new("Compliance Officer", "Sanctions rejection", 4)],
            Rule::SanctionsEscalate => vec![
                Approval::new("Compliance Manager", "Sanctions escalation", 4),
                Approval::new("MLRO", "Regulatory reporting decision", 24),
            ],
            Rule::LiquidityUnavailable => vec![
                Approval::new("Treasury Manager", "Liquidity override", 2),
                Approval::new("Head of Treasury", "Liquidity risk acceptance", 4),
            ],
            Rule::BreachAfterCutoff | Rule::Breach => {
                vec![Approval::new("Treasury Manager", "Buffer breach approval", 2)]
            }
            Rule::Clear => vec![Approval::new("Payments Operator", "Standard release", 1)],
        }
    }
}

/// Deterministic decision matrix.
#[derive(Debug, Clone, Copy)]
pub struct DecisionEngine {
    /// Breach + missed cutoff rejects instead of holding.
    reject_breach_after_cutoff: bool,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self {
            reject_breach_after_cutoff: true,
        }
    }
}

impl DecisionEngine {
    pub fn new(reject_breach_after_cutoff: bool) -> Self {
        Self {
            reject_breach_after_cutoff,
        }
    }

    pub fn decide(
        &self,
        sanctions: &Verdict<SanctionsResult>,
        liquidity: Option<&Verdict<LiquidityResult>>,
        procedures: Option<&Verdict<ProceduresResult>>,
    ) -> DecisionPacket {
        let liquidity_result = liquidity.map(|v| &v.result);
        // a substituted procedures result carries no usable cutoff or conditions
        let live_procedures = procedures.map(|v| &v.result).filter(|p| !p.degraded);
        let cutoff_missed = live_procedures
            .and_then(|p| p.cutoff.as_ref())
            .map(|c| c.missed)
            .unwrap_or(false);

        let rule = match sanctions.result.decision {
            SanctionsDecision::Block => Rule::SanctionsBlock,
            SanctionsDecision::Escalate => Rule::SanctionsEscalate,
            SanctionsDecision::Clear => match liquidity_result {
                None => Rule::LiquidityUnavailable,
                Some(l) if l.degraded || l.status == LiquidityStatus::Unavailable => {
                    Rule::LiquidityUnavailable
                }
                Some(l) if l.is_breach() => {
                    if cutoff_missed && self.reject_breach_after_cutoff {
                        Rule::BreachAfterCutoff
                    } else {
                        Rule::Breach
                    }
                }
                Some(_) => Rule::Clear,
            },
        };

        let mut decision = rule.decision();
        let mut approvals = rule.approvals();
        let mut rationale = vec![
            sanctions_summary(&sanctions.result),
            liquidity_summary(liquidity_result, rule),
            format!("Rule applied: {}", rule.description()),
        ];
        let mut cutoff_actions = Vec::new();

        if rule != Rule::SanctionsBlock {
            if let Some(gap) = liquidity_result.and_then(LiquidityResult::gap) {
                let currency = liquidity_result.map(|l| l.currency.as_str()).unwrap_or("USD");
                rationale.push(format!(
                    "Buffer breach: requested amount exceeds available headroom by {}",
                    format_money(gap, currency)
                ));
            }
        }

        if let Some(l) = liquidity_result {
            cutoff_actions = breach_actions(rule, l, live_procedures);
        }

        // =============================
        // Modifiers (never applied to a reject)
        // =============================

        if decision.category() != DecisionCategory::Reject {
            if procedures.map(|p| p.result.degraded).unwrap_or(false) {
                if decision.category() == DecisionCategory::Release {
                    decision = FinalDecision::HoldPendingApproval;
                }
                rationale.push(
                    "Operational procedures unavailable: manual review required".to_string(),
                );
                push_approval(&mut approvals, Approval::new("Compliance Officer", "Manual procedures review", 4));
            }

            if let Some(p) = live_procedures {
                if decision == FinalDecision::Release
                    && (!p.conditions.is_empty() || cutoff_missed)
                {
                    decision = FinalDecision::ReleaseWithConditions;
                    for condition in &p.conditions {
                        rationale.push(format!("Release condition: {}", condition));
                    }
                    if let Some(cutoff) = p.cutoff.as_ref().filter(|c| c.missed) {
                        rationale.push(format!(
                            "Cutoff {} missed: release on next value date",
                            cutoff.cutoff_time
                        ));
                        cutoff_actions.push(format!(
                            "Schedule release for the next value date after cutoff {}",
                            cutoff.cutoff_time
                        ));
                    }
                }

                if decision == FinalDecision::HoldPendingApproval
                    && !p.documentation_outstanding.is_empty()
                {
                    decision = FinalDecision::HoldPendingDocumentation;
                    for doc in &p.documentation_outstanding {
                        rationale.push(format!("Documentation outstanding: {}", doc));
                    }
                }
            }

            if let Some(p) = procedures {
                for approval in &p.result.required_approvals {
                    push_approval(&mut approvals, approval.clone());
                }
                if !p.result.degraded && !p.result.reason.is_empty() {
                    rationale.push(format!("Procedures: {}", p.result.reason));
                }
            }
        }

        let procedure_checklist = match live_procedures {
            Some(p)
                if !p.workflow_steps.is_empty()
                    && decision.category() != DecisionCategory::Reject =>
            {
                p.workflow_steps.clone()
            }
            _ => default_checklist(decision),
        };

        let citations = if rule == Rule::SanctionsBlock {
            Vec::new()
        } else {
            procedures.map(|p| p.result.citations.clone()).unwrap_or_default()
        };

        let mut degraded_steps = Vec::new();
        if sanctions.result.degraded {
            degraded_steps.push(Step::Sanctions);
        }
        if liquidity_result.map(|l| l.degraded).unwrap_or(false) {
            degraded_steps.push(Step::Liquidity);
        }
        if procedures.map(|p| p.result.degraded).unwrap_or(false) {
            degraded_steps.push(Step::Procedures);
        }

        DecisionPacket {
            decision,
            rationale,
            approvals_required: approvals,
            procedure_checklist,
            citations,
            sod_constraints: sod_constraints(),
            cutoff_actions,
            audit_note: AuditNote {
                rule: rule.as_str().to_string(),
                sanctions_trace_id: sanctions.trace_id.clone(),
                liquidity_trace_id: liquidity.and_then(|v| v.trace_id.clone()),
                procedures_trace_id: procedures.and_then(|v| v.trace_id.clone()),
                policies_consulted: procedures
                    .map(|p| p.result.policies_consulted.clone())
                    .unwrap_or_default(),
                degraded_steps,
            },
        }
    }
}

fn sanctions_summary(result: &SanctionsResult) -> String {
    if result.degraded {
        return format!("Sanctions screening unavailable: {}", result.recommendation);
    }
    format!(
        "Sanctions screening: {} for {} ({}% confidence, match type {})",
        result.decision, result.beneficiary_screened, result.confidence, result.match_type
    )
}

fn liquidity_summary(result: Option<&LiquidityResult>, rule: Rule) -> String {
    match result {
        None if rule == Rule::SanctionsBlock => "Liquidity assessment: not performed".to_string(),
        None => format!("Liquidity assessment: not available ({})", LIQUIDITY_DEGRADED),
        Some(l) if l.degraded => format!(
            "Liquidity assessment unavailable: {}",
            l.note.as_deref().unwrap_or(LIQUIDITY_DEGRADED)
        ),
        Some(l) => format!(
            "Liquidity assessment: {} for {}",
            l.status,
            format_money(l.requested_amount, &l.currency)
        ),
    }
}

fn breach_actions(
    rule: Rule,
    liquidity: &LiquidityResult,
    procedures: Option<&ProceduresResult>,
) -> Vec<String> {
    let cutoff_time = procedures
        .and_then(|p| p.cutoff.as_ref())
        .map(|c| c.cutoff_time.clone());

    match rule {
        Rule::BreachAfterCutoff => vec![format!(
            "Cutoff {} missed: payment cannot settle today without breaching the buffer",
            cutoff_time.as_deref().unwrap_or("today")
        )],
        Rule::Breach => {
            let mut actions = Vec::new();
            if let Some(gap) = liquidity.gap() {
                let partial = (liquidity.requested_amount - gap).max(0.0);
                if partial > 0.0 {
                    actions.push(format!(
                        "Partial release of {} possible before cutoff {}",
                        format_money(partial, &liquidity.currency),
                        cutoff_time.as_deref().unwrap_or("today")
                    ));
                }
            }
            actions.extend(liquidity.recommendation.alternatives.iter().cloned());
            actions
        }
        _ => Vec::new(),
    }
}

fn push_approval(approvals: &mut Vec<Approval>, approval: Approval) {
    if !approvals.iter().any(|a| a.role == approval.role) {
        approvals.push(approval);
    }
}

fn sod_constraints() -> Vec<String> {
    vec![
        "Maker-checker: the payment initiator cannot act as approver".to_string(),
        "No self-approval: approvers must be independent of the requester".to_string(),
        format!(
            "Dual approval required for payments above USD {}",
            group_thousands(DUAL_APPROVAL_THRESHOLD_USD)
        ),
    ]
}

fn default_checklist(decision: FinalDecision) -> Vec<ChecklistItem> {
    let items: &[(&str, &str, &str)] = match decision {
        FinalDecision::RejectSanctions => &[
            ("REJECT payment immediately", "Payments Operator", "Rejection record"),
            ("Generate compliance case", "Compliance Officer", "Case file"),
            ("File regulatory report", "MLRO", "Regulatory filing"),
        ],
        FinalDecision::RejectLiquidity => &[
            ("Reject payment and notify the requester", "Payments Operator", "Rejection record"),
            ("Record buffer breach assessment", "Treasury Manager", "Liquidity report"),
        ],
        FinalDecision::EscalateCompliance => &[
            ("Keep payment on hold", "Payments Operator", "Hold record"),
            ("Open sanctions review case", "Compliance Manager", "Case file"),
            ("Obtain MLRO decision", "MLRO", "MLRO decision memo"),
        ],
        FinalDecision::Escalate => &[
            ("Keep payment on hold", "Payments Operator", "Hold record"),
            ("Verify liquidity position manually", "Treasury Manager", "Balance report"),
            ("Obtain Head of Treasury sign-off", "Head of Treasury", "Approval record"),
        ],
        FinalDecision::HoldPendingApproval => &[
            ("Hold payment in queue", "Payments Operator", "Hold record"),
            ("Obtain required approvals", "Treasury Manager", "Approval record"),
        ],
        FinalDecision::HoldPendingDocumentation => &[
            ("Hold payment in queue", "Payments Operator", "Hold record"),
            ("Collect outstanding documentation", "Payments Operator", "Supporting documents"),
        ],
        FinalDecision::Release | FinalDecision::ReleaseWithConditions => &[
            ("Verify payment details against request", "Payments Operator", "Payment instruction"),
            ("Release payment", "Payments Operator", "Release confirmation"),
        ],
    };

    items
        .iter()
        .enumerate()
        .map(|(i, (action, responsible, doc))| {
            ChecklistItem::new(i as u32 + 1, action, responsible, doc)
        })
        .collect()
}

// =============================
// Substitution Results
// =============================

/// Stand-in when sanctions screening fails: escalate for manual review.
pub fn substitute_sanctions(beneficiary: &str, error: &AgentError) -> SanctionsResult {
    SanctionsResult {
        beneficiary_screened: beneficiary.to_string(),
        decision: SanctionsDecision::Escalate,
        confidence: 0,
        match_type: "UNKNOWN".to_string(),
        match_details: Some(json!({ "error": error.to_string() })),
        recommendation: MANUAL_REVIEW.to_string(),
        degraded: true,
    }
}

/// Stand-in when the liquidity check fails: escalate with a degradation note.
pub fn substitute_liquidity(amount: f64, currency: &str, error: &AgentError) -> LiquidityResult {
    LiquidityResult {
        status: LiquidityStatus::Unavailable,
        requested_amount: amount,
        currency: currency.to_string(),
        available_balance: None,
        buffer_threshold: None,
        reported_gap: None,
        first_breach_time: None,
        recommendation: LiquidityRecommendation {
            action: "ESCALATE".to_string(),
            reason: LIQUIDITY_DEGRADED.to_string(),
            alternatives: Vec::new(),
        },
        degraded: true,
        note: Some(format!("{} ({})", LIQUIDITY_DEGRADED, error)),
    }
}

/// Stand-in when procedures lookup fails: hold for manual review.
pub fn substitute_procedures(error: &AgentError) -> ProceduresResult {
    ProceduresResult {
        final_action: "HOLD".to_string(),
        reason: format!("{} ({})", PROCEDURES_DEGRADED, error),
        policy_reference: None,
        required_approvals: vec![Approval::new("Compliance Officer", "Manual procedures review", 4)],
        workflow_steps: Vec::new(),
        citations: Vec::new(),
        policies_consulted: Vec::new(),
        cutoff: None,
        conditions: Vec::new(),
        documentation_outstanding: Vec::new(),
        degraded: true,
    }
}

/// Packet stored on a run that failed for an internal reason.
pub fn internal_failure_packet(reason: &str) -> DecisionPacket {
    let decision = FinalDecision::EscalateCompliance;
    DecisionPacket {
        decision,
        rationale: vec![
            format!("Internal orchestration failure: {}", reason),
            "Manual review required".to_string(),
        ],
        approvals_required: Rule::SanctionsEscalate.approvals(),
        procedure_checklist: default_checklist(decision),
        citations: Vec::new(),
        sod_constraints: sod_constraints(),
        cutoff_actions: Vec::new(),
        audit_note: AuditNote {
            rule: "internal_failure".to_string(),
            ..AuditNote::default()
        },
    }
}

// =============================
// Money Formatting
// =============================

/// `$125,000.00` for USD, `125,000.00 EUR` otherwise.
pub fn format_money(amount: f64, currency: &str) -> String {
    if currency.eq_ignore_ascii_case("USD") {
        let sign = if amount < 0.0 { "-" } else { "" };
        format!("{}${}", sign, group_thousands(amount.abs()))
    } else {
        format!("{} {}", group_thousands(amount), currency.to_uppercase())
    }
}

fn group_thousands(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Citation, CutoffAssessment};

    fn sanctions(decision: SanctionsDecision) -> Verdict<SanctionsResult> {
        Verdict::new(
            SanctionsResult {
                beneficiary_screened: "Acme Trading LLC".into(),
                decision,
                confidence: 95,
                match_type: "NONE".into(),
                match_details: None,
                recommendation: String::new(),
                degraded: false,
            },
            Some("trace-s".into()),
        )
    }

    fn liquidity(status: LiquidityStatus, requested: f64) -> Verdict<LiquidityResult> {
        Verdict::new(
            LiquidityResult {
                status,
                requested_amount: requested,
                currency: "USD".into(),
                available_balance: Some(2_125_000.0),
                buffer_threshold: Some(2_000_000.0),
                reported_gap: None,
                first_breach_time: None,
                recommendation: LiquidityRecommendation::default(),
                degraded: false,
                note: None,
            },
            Some("trace-l".into()),
        )
    }

    fn procedures() -> Verdict<ProceduresResult> {
        Verdict::new(
            ProceduresResult {
                final_action: "RELEASE".into(),
                reason: String::new(),
                policy_reference: Some("EPP-4.2".into()),
                required_approvals: Vec::new(),
                workflow_steps: Vec::new(),
                citations: vec![Citation {
                    source: "Emergency Payments Policy".into(),
                    snippet: "Approval before release.".into(),
                    reference: "EPP-4.2".into(),
                }],
                policies_consulted: vec!["EPP-4.2".into()],
                cutoff: None,
                conditions: Vec::new(),
                documentation_outstanding: Vec::new(),
                degraded: false,
            },
            Some("trace-p".into()),
        )
    }

    fn roles(packet: &DecisionPacket) -> Vec<&str> {
        packet.approvals_required.iter().map(|a| a.role.as_str()).collect()
    }

    #[test]
    fn test_clean_release() {
        let engine = DecisionEngine::default();
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&liquidity(LiquidityStatus::Sufficient, 100_000.0)),
            Some(&procedures()),
        );
        assert_eq!(packet.decision, FinalDecision::Release);
        assert_eq!(roles(&packet), vec!["Payments Operator"]);
        assert_eq!(packet.citations.len(), 1);
        assert_eq!(packet.audit_note.rule, "all_clear");
        assert_eq!(packet.audit_note.procedures_trace_id.as_deref(), Some("trace-p"));
        assert!(packet.rationale[0].starts_with("Sanctions screening: CLEAR"));
    }

    #[test]
    fn test_block_ignores_liquidity() {
        let engine = DecisionEngine::default();
        for liq in [
            None,
            Some(liquidity(LiquidityStatus::Sufficient, 100.0)),
            Some(liquidity(LiquidityStatus::Breach, 900_000.0)),
        ] {
            let packet = engine.decide(&sanctions(SanctionsDecision::Block), liq.as_ref(), None);
            assert_eq!(packet.decision, FinalDecision::RejectSanctions);
            assert_eq!(roles(&packet), vec!["Compliance Officer"]);
            assert_eq!(packet.procedure_checklist.len(), 3);
            assert_eq!(packet.procedure_checklist[0].action, "REJECT payment immediately");
            assert!(packet.citations.is_empty());
        }
    }

    #[test]
    fn test_breach_holds_with_gap_in_rationale() {
        let engine = DecisionEngine::default();
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&liquidity(LiquidityStatus::Breach, 250_000.0)),
            Some(&procedures()),
        );
        assert_eq!(packet.decision, FinalDecision::HoldPendingApproval);
        assert_eq!(roles(&packet), vec!["Treasury Manager"]);
        assert!(packet.rationale.iter().any(|r| r.contains("$125,000")));
        assert!(packet.cutoff_actions[0].contains("Partial release of $125,000.00"));
        // sanctions, liquidity, rule, then the gap
        assert!(packet.rationale[3].starts_with("Buffer breach"));
    }

    #[test]
    fn test_breach_after_cutoff_policy() {
        let mut procs = procedures();
        procs.result.cutoff = Some(CutoffAssessment {
            cutoff_time: "16:00 TRT".into(),
            missed: true,
        });
        let s = sanctions(SanctionsDecision::Clear);
        let l = liquidity(LiquidityStatus::Insufficient, 250_000.0);

        let packet = DecisionEngine::new(true).decide(&s, Some(&l), Some(&procs));
        assert_eq!(packet.decision, FinalDecision::RejectLiquidity);

        let packet = DecisionEngine::new(false).decide(&s, Some(&l), Some(&procs));
        assert_eq!(packet.decision, FinalDecision::HoldPendingApproval);
    }

    #[test]
    fn test_escalate_regardless_of_liquidity() {
        let packet = DecisionEngine::default().decide(
            &sanctions(SanctionsDecision::Escalate),
            Some(&liquidity(LiquidityStatus::Sufficient, 10.0)),
            Some(&procedures()),
        );
        assert_eq!(packet.decision, FinalDecision::EscalateCompliance);
        assert_eq!(roles(&packet), vec!["Compliance Manager", "MLRO"]);
    }

    #[test]
    fn test_substitutions_are_conservative() {
        let engine = DecisionEngine::default();
        let timeout = AgentError::Timeout(30_000);

        let s = Verdict::substituted(substitute_sanctions("Acme", &timeout));
        let packet = engine.decide(
            &s,
            Some(&liquidity(LiquidityStatus::Sufficient, 10.0)),
            Some(&procedures()),
        );
        assert_eq!(packet.decision, FinalDecision::EscalateCompliance);
        assert!(packet
            .rationale
            .iter()
            .any(|r| r.to_lowercase().contains("manual review required")));
        assert_eq!(packet.audit_note.degraded_steps, vec![Step::Sanctions]);

        let l = Verdict::substituted(substitute_liquidity(10.0, "USD", &timeout));
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&l),
            Some(&procedures()),
        );
        assert_eq!(packet.decision, FinalDecision::Escalate);
        assert!(packet.rationale.iter().any(|r| r.contains("System degradation")));
        assert_eq!(roles(&packet), vec!["Treasury Manager", "Head of Treasury"]);

        let p = Verdict::substituted(substitute_procedures(&timeout));
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&liquidity(LiquidityStatus::Sufficient, 10.0)),
            Some(&p),
        );
        assert_eq!(packet.decision, FinalDecision::HoldPendingApproval);
        assert!(roles(&packet).contains(&"Compliance Officer"));
    }

    #[test]
    fn test_modifiers() {
        let engine = DecisionEngine::default();
        let mut procs = procedures();
        procs.result.conditions = vec!["Beneficiary callback completed".into()];
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&liquidity(LiquidityStatus::Sufficient, 10.0)),
            Some(&procs),
        );
        assert_eq!(packet.decision, FinalDecision::ReleaseWithConditions);

        let mut procs = procedures();
        procs.result.documentation_outstanding = vec!["Signed invoice".into()];
        let packet = engine.decide(
            &sanctions(SanctionsDecision::Clear),
            Some(&liquidity(LiquidityStatus::Breach, 250_000.0)),
            Some(&procs),
        );
        assert_eq!(packet.decision, FinalDecision::HoldPendingDocumentation);
    }

    #[test]
    fn test_decide_is_deterministic() {
        let engine = DecisionEngine::default();
        let s = sanctions(SanctionsDecision::Clear);
        let l = liquidity(LiquidityStatus::Breach, 250_000.0);
        let p = procedures();

        let first = serde_json::to_vec(&engine.decide(&s, Some(&l), Some(&p))).unwrap();
        let second = serde_json::to_vec(&engine.decide(&s, Some(&l), Some(&p))).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_internal_failure_packet() {
        let packet = internal_failure_packet("event log unavailable");
        assert_eq!(packet.decision, FinalDecision::EscalateCompliance);
        assert_eq!(packet.rationale[0], "Internal orchestration failure: event log unavailable");
        assert_eq!(packet.rationale[1], "Manual review required");
    }

    #[test]
    fn test_money_format() {
        assert_eq!(format_money(125_000.0, "USD"), "$125,000.00");
        assert_eq!(format_money(1_234_567.891, "eur"), "1,234,567.89 EUR");
        assert_eq!(format_money(999.5, "USD"), "$999.50");
        assert_eq!(format_money(-1_000.0, "USD"), "-$1,000.00");
    }
}
