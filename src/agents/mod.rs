//! Agent client layer
//!
//! Wraps every call to an external compliance agent (sanctions screening,
//! liquidity assessment, operational procedures) with a per-attempt timeout
//! and the configured retry policy.
//!
//! Agent failures never become [`RunbookError`](crate::error::RunbookError)s:
//! they surface as an [`AgentFailure`] so the orchestrator can substitute a
//! conservative step outcome.

pub mod http;
pub mod parse;
pub mod retry;
pub mod stub;

use crate::config::Settings;
use crate::error::AgentError;
use crate::models::{
    LiquidityResult, PaymentRequest, ProceduresResult, SanctionsResult,
};
use async_trait::async_trait;
use retry::{Clock, RetryPolicy, TokioClock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub use http::HttpAgentTransport;
pub use stub::StubAgentTransport;

/// Raw reply from one agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub body: Value,
    /// Upstream trace identifier, used for audit correlation.
    pub trace_id: String,
}

/// One network hop to a named agent. No retries at this level.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn invoke(&self, agent: &str, request: &Value) -> Result<AgentReply, AgentError>;
}

/// Successful, typed agent call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentOutcome<T> {
    pub result: T,
    pub trace_id: Option<String>,
    pub attempts: u32,
}

/// An agent call that failed for good.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct AgentFailure {
    pub error: AgentError,
    pub attempts: u32,
}

// =============================
// Client
// =============================

/// Typed client for one agent.
pub struct AgentClient {
    name: String,
    transport: Arc<dyn AgentTransport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            transport,
            policy,
            clock: Arc::new(TokioClock),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call the agent, retrying transient failures with backoff.
    ///
    /// A timeout cancels only the attempt in flight. Malformed replies and
    /// definitive rejections return immediately.
    pub async fn call<Req, Resp>(&self, request: &Req) -> Result<AgentOutcome<Resp>, AgentFailure>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(|e| AgentFailure {
            error: AgentError::Malformed(format!("request could not be encoded: {}", e)),
            attempts: 0,
        })?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(agent = %self.name, attempt, "Invoking agent");

            let error = match self.attempt::<Resp>(&payload).await {
                Ok((result, trace_id)) => {
                    return Ok(AgentOutcome {
                        result,
                        trace_id: Some(trace_id),
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };

            if !error.is_transient() || !self.policy.should_retry(attempt) {
                warn!(
                    agent = %self.name,
                    attempt,
                    error = %error,
                    transient = error.is_transient(),
                    "Agent call failed"
                );
                return Err(AgentFailure {
                    error,
                    attempts: attempt,
                });
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                agent = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient agent failure, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    async fn attempt<Resp: DeserializeOwned>(
        &self,
        payload: &Value,
    ) -> Result<(Resp, String), AgentError> {
        let reply = tokio::time::timeout(self.timeout, self.transport.invoke(&self.name, payload))
            .await
            .map_err(|_| AgentError::Timeout(self.timeout.as_millis() as u64))??;

        let body = parse::normalize_body(reply.body)?;
        let result = serde_json::from_value::<Resp>(body)
            .map_err(|e| AgentError::Malformed(format!("unexpected response shape: {}", e)))?;

        Ok((result, reply.trace_id))
    }
}

// =============================
// Request Models
// =============================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SanctionsRequest {
    pub payment_id: String,
    pub beneficiary_name: String,
    pub beneficiary_country: Option<String>,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LiquidityRequest {
    pub payment_id: String,
    pub entity: String,
    pub account_id: String,
    pub amount: f64,
    pub currency: String,
    pub timestamp_utc: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProceduresRequest {
    pub payment: PaymentRequest,
    pub sanctions: SanctionsResult,
    pub liquidity: Option<LiquidityResult>,
}

impl SanctionsRequest {
    pub fn for_payment(payment: &PaymentRequest) -> Self {
        Self {
            payment_id: payment.payment_id.clone(),
            beneficiary_name: payment.beneficiary_name.clone(),
            beneficiary_country: payment.beneficiary_country.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
        }
    }
}

impl LiquidityRequest {
    pub fn for_payment(payment: &PaymentRequest) -> Self {
        Self {
            payment_id: payment.payment_id.clone(),
            entity: payment.entity.clone(),
            account_id: payment.account_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            timestamp_utc: payment.timestamp_utc.clone(),
            channel: payment.channel.clone(),
        }
    }
}

// =============================
// Compliance Agents
// =============================

/// The three agents consulted by every run.
pub struct ComplianceAgents {
    pub sanctions: AgentClient,
    pub liquidity: AgentClient,
    pub procedures: AgentClient,
}

impl ComplianceAgents {
    /// HTTP transport when an agent gateway is configured, stub otherwise.
    pub fn from_settings(settings: &Settings) -> crate::Result<Self> {
        let transport: Arc<dyn AgentTransport> = match (&settings.agent_base_url, settings.dry_run) {
            (Some(base_url), false) => {
                Arc::new(HttpAgentTransport::new(base_url.clone(), settings.agent_timeout)?)
            }
            _ => Arc::new(StubAgentTransport::from_settings(settings)),
        };
        Ok(Self::with_transport(transport, settings))
    }

    pub fn with_transport(transport: Arc<dyn AgentTransport>, settings: &Settings) -> Self {
        let build = |name: &str| {
            AgentClient::new(name, transport.clone(), settings.retry_policy())
                .with_timeout(settings.agent_timeout)
        };

        Self {
            sanctions: build(&settings.sanctions_agent),
            liquidity: build(&settings.liquidity_agent),
            procedures: build(&settings.procedures_agent),
        }
    }

    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            sanctions: self.sanctions.with_clock(clock.clone()),
            liquidity: self.liquidity.with_clock(clock.clone()),
            procedures: self.procedures.with_clock(clock),
        }
    }

    pub async fn screen_sanctions(
        &self,
        request: &SanctionsRequest,
    ) -> Result<AgentOutcome<SanctionsResult>, AgentFailure> {
        self.sanctions.call(request).await
    }

    pub async fn assess_liquidity(
        &self,
        request: &LiquidityRequest,
    ) -> Result<AgentOutcome<LiquidityResult>, AgentFailure> {
        self.liquidity.call(request).await
    }

    pub async fn lookup_procedures(
        &self,
        request: &ProceduresRequest,
    ) -> Result<AgentOutcome<ProceduresResult>, AgentFailure> {
        self.procedures.call(request).await
    }
}
