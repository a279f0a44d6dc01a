//! HTTP transport to the agent gateway
//!
//! Uses one long-lived reqwest::Client for connection pooling.

use super::{AgentReply, AgentTransport};
use crate::error::AgentError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const TRACE_HEADER: &str = "x-trace-id";
const MAX_ERROR_BODY: usize = 512;

pub struct HttpAgentTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpAgentTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> crate::Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn invoke_url(&self, agent: &str) -> String {
        format!("{}/agents/{}/invoke", self.base_url, agent)
    }

    fn classify(&self, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout(self.timeout.as_millis() as u64)
        } else {
            AgentError::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl AgentTransport for HttpAgentTransport {
    async fn invoke(&self, agent: &str, request: &Value) -> Result<AgentReply, AgentError> {
        let url = self.invoke_url(agent);
        debug!(agent, url = %url, "POST agent invoke");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let header_trace = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let text = response.text().await.map_err(|e| self.classify(e))?;

        if status.is_server_error() {
            error!(agent, status = status.as_u16(), "Agent gateway server error");
            return Err(AgentError::Upstream {
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        if !status.is_success() {
            error!(agent, status = status.as_u16(), "Agent rejected request");
            return Err(AgentError::Rejected {
                status: status.as_u16(),
                reason: truncate(&text),
            });
        }

        // non-JSON bodies are handed on as text for extraction
        let body = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        let trace_id = header_trace
            .or_else(|| {
                body.get("trace_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("trace-{}", Uuid::new_v4()));

        Ok(AgentReply { body, trace_id })
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        return text.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
