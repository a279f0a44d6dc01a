//! Error types for the emergency payment runbook

use crate::models::RunStatus;
use thiserror::Error;

/// Result type alias for runbook operations
pub type Result<T> = std::result::Result<T, RunbookError>;

/// Errors that are fatal to the operation that raised them.
///
/// Agent failures are NOT represented here: they are classified as
/// [`AgentError`] and substituted with a conservative step outcome.
#[derive(Error, Debug)]
pub enum RunbookError {
    // =============================
    // Run Lifecycle Errors
    // =============================

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run already exists: {0}")]
    RunAlreadyExists(String),

    #[error("Invalid status transition for run {run_id}: {from} -> {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =============================
    // Internal Orchestrator Errors
    // =============================

    #[error("Event log error: {0}")]
    EventLogError(String),

    #[error("Run store error: {0}")]
    StoreError(String),

    #[error("Write timed out after {0} ms: {1}")]
    WriteTimeout(u64, String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RunbookError {
    /// Short machine-readable class, used in `error` event payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            RunbookError::RunNotFound(_) => "run_not_found",
            RunbookError::RunAlreadyExists(_) => "run_already_exists",
            RunbookError::InvalidTransition { .. } => "invalid_transition",
            RunbookError::InvalidRequest(_) => "invalid_request",
            RunbookError::EventLogError(_) => "event_log",
            RunbookError::StoreError(_) => "store",
            RunbookError::WriteTimeout(..) => "write_timeout",
            RunbookError::DatabaseError(_) | RunbookError::SqlError(_) => "database",
            RunbookError::ConfigError(_) => "config",
            RunbookError::SerializationError(_) => "serialization",
            RunbookError::HttpError(_) => "http",
            RunbookError::IoError(_) => "io",
        }
    }
}

/// Typed failure of one call to an external compliance agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent call timed out after {0} ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("agent returned server error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("agent rejected request ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("malformed agent response: {0}")]
    Malformed(String),
}

impl AgentError {
    /// Only timeouts, transport faults and 5xx-equivalents are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Timeout(_) | AgentError::Transport(_) | AgentError::Upstream { .. }
        )
    }

    /// Classification carried on `step_failed` events and step records.
    pub fn class(&self) -> ErrorClass {
        match self {
            AgentError::Timeout(_) => ErrorClass::Timeout,
            AgentError::Transport(_) => ErrorClass::Transport,
            AgentError::Upstream { .. } => ErrorClass::Upstream,
            AgentError::Rejected { .. } => ErrorClass::Rejected,
            AgentError::Malformed(_) => ErrorClass::Malformed,
        }
    }
}

/// Wire-level error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Transport,
    Upstream,
    Rejected,
    Malformed,
}
