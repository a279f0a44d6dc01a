//! Payment intake
//!
//! Turns a free-text emergency payment request into a [`PaymentRequest`].
//! Parsing never fails: anything that cannot be extracted falls back to a
//! default and is reported as a warning, so downstream agents can still
//! operate on partial data.

use crate::models::{PaymentOverrides, PaymentRequest};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use uuid::Uuid;

pub const UNKNOWN_BENEFICIARY: &str = "Unknown Beneficiary";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_ENTITY: &str = "BankSubsidiary_TR";
const DEFAULT_ACCOUNT: &str = "ACC-BAN-001";
const DEFAULT_CHANNEL: &str = "SWIFT";

/// Result of intake: the best-effort payment plus what had to be defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeOutcome {
    pub payment: PaymentRequest,
    pub warnings: Vec<String>,
}

impl IntakeOutcome {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

fn amount_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:\$\s*)?(\d{1,3}(?:,\d{3})+|\d{4,})(\.\d{2})?\s*(?:USD|EUR|TRY|GBP|dollars?)?")
            .unwrap_or_else(|_| unreachable!("static amount pattern"))
    })
}

fn currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(USD|EUR|TRY|GBP|dollars?|euros?|lira|pounds?)\b")
            .unwrap_or_else(|_| unreachable!("static currency pattern"))
    })
}

/// `to <Name>` closing the message. Digits are excluded so trailing
/// amounts or references fall through to [`beneficiary_inline_re`].
fn beneficiary_tail_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?i:to)\s+([A-Z][A-Za-z\s&.,'-]*?)[\s.,]*$")
            .unwrap_or_else(|_| unreachable!("static beneficiary tail pattern"))
    })
}

/// `to <Name>` anywhere, ended by a keyword, amount or punctuation.
/// The name must start uppercase so phrases like "need to pay" are skipped.
fn beneficiary_inline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?i:to)\s+([A-Z][A-Za-z0-9\s&.,'-]+?)(?:\s+(?i:for|from|amount|of|\$|USD|EUR|TRY|GBP|\d)|\.|,|$)",
        )
        .unwrap_or_else(|_| unreachable!("static beneficiary pattern"))
    })
}

fn trailing_noise_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\s+(?:for|from|amount|of)$")
            .unwrap_or_else(|_| unreachable!("static noise pattern"))
    })
}

fn company_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([A-Z][A-Za-z]+(?:\s+[A-Z][A-Za-z]+){0,3}\s+(?:LLC|Inc|Corp|Ltd|Co|Trading|Bank|Company))\b")
            .unwrap_or_else(|_| unreachable!("static company pattern"))
    })
}

/// Free-text payment parser.
pub struct PaymentIntakeParser;

impl PaymentIntakeParser {
    /// Parse `message`, letting every present override win over extraction.
    pub fn parse(message: &str, overrides: &PaymentOverrides, now: DateTime<Utc>) -> IntakeOutcome {
        let mut warnings = Vec::new();

        let amount = match overrides.amount {
            Some(amount) => amount,
            None => extract_amount(message).unwrap_or_else(|| {
                warnings.push("amount not found; defaulted to 0.00".to_string());
                0.0
            }),
        };

        let currency = match &overrides.currency {
            Some(currency) => currency.to_uppercase(),
            None => extract_currency(message).unwrap_or_else(|| {
                warnings.push(format!("currency not found; defaulted to {}", DEFAULT_CURRENCY));
                DEFAULT_CURRENCY.to_string()
            }),
        };

        let beneficiary_name = match &overrides.beneficiary_name {
            Some(name) => name.clone(),
            None => extract_beneficiary(message).unwrap_or_else(|| {
                warnings.push("beneficiary not found".to_string());
                UNKNOWN_BENEFICIARY.to_string()
            }),
        };

        let payment = PaymentRequest {
            payment_id: overrides
                .payment_id
                .clone()
                .unwrap_or_else(|| generate_payment_id(now)),
            beneficiary_name,
            beneficiary_country: overrides.beneficiary_country.clone(),
            amount,
            currency,
            timestamp_utc: overrides
                .timestamp_utc
                .clone()
                .unwrap_or_else(|| now.to_rfc3339()),
            entity: overrides
                .entity
                .clone()
                .unwrap_or_else(|| DEFAULT_ENTITY.to_string()),
            account_id: overrides
                .account_id
                .clone()
                .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string()),
            channel: overrides
                .channel
                .clone()
                .unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
            freeform_notes: Some(message.to_string()),
        };

        IntakeOutcome { payment, warnings }
    }
}

fn generate_payment_id(now: DateTime<Utc>) -> String {
    let suffix: String = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
    format!("TXN-{}-{}", now.format("%Y%m%d%H%M%S"), suffix)
}

/// Largest amount-looking number in the message.
fn extract_amount(message: &str) -> Option<f64> {
    amount_re()
        .captures_iter(message)
        .filter_map(|caps| {
            let whole = caps.get(1)?.as_str().replace(',', "");
            let cents = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            format!("{}{}", whole, cents).parse::<f64>().ok()
        })
        .fold(None, |best: Option<f64>, amount| match best {
            Some(current) if current >= amount => Some(current),
            _ => Some(amount),
        })
}

fn extract_currency(message: &str) -> Option<String> {
    let caps = currency_re().captures(message)?;
    let raw = caps.get(1)?.as_str().to_uppercase();

    let code = match raw.as_str() {
        "DOLLAR" | "DOLLARS" => "USD",
        "EURO" | "EUROS" => "EUR",
        "LIRA" => "TRY",
        "POUND" | "POUNDS" => "GBP",
        other => other,
    };
    Some(code.to_string())
}

fn extract_beneficiary(message: &str) -> Option<String> {
    let trimmed = message.trim();

    for re in [beneficiary_tail_re(), beneficiary_inline_re()] {
        let name = re
            .captures(trimmed)
            .and_then(|caps| caps.get(1))
            .and_then(|m| clean_name(m.as_str()));
        if name.is_some() {
            return name;
        }
    }

    company_re()
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn clean_name(raw: &str) -> Option<String> {
    let name = trailing_noise_re().replace(raw.trim(), "");
    let name = name.trim().trim_end_matches(['.', ',']).trim();
    (name.len() > 2).then(|| name.to_string())
}
