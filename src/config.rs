//! Runtime settings
//!
//! Loaded from the process environment (and `.env` when present).
//! Every field has a working default so a bare checkout runs in dry-run mode.

use crate::agents::retry::RetryPolicy;
use crate::error::RunbookError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub api_port: u16,

    /// Base URL of the agent gateway. `None` means dry-run.
    pub agent_base_url: Option<String>,
    pub dry_run: bool,
    pub sanctions_agent: String,
    pub liquidity_agent: String,
    pub procedures_agent: String,

    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub retry_backoff_factor: f64,
    pub retry_max_delay: Duration,
    pub agent_timeout: Duration,

    pub write_timeout: Duration,
    pub sse_heartbeat: Duration,

    pub database_url: Option<String>,

    pub log_level: String,
    pub log_format: LogFormat,

    pub reject_breach_after_cutoff: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_port: 8080,
            agent_base_url: None,
            dry_run: true,
            sanctions_agent: "sanctions-screening-agent".to_string(),
            liquidity_agent: "liquidity-screening-agent".to_string(),
            procedures_agent: "operational-procedures-agent".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_millis(1000),
            retry_backoff_factor: 2.0,
            retry_max_delay: Duration::from_millis(10_000),
            agent_timeout: Duration::from_millis(30_000),
            write_timeout: Duration::from_millis(2000),
            sse_heartbeat: Duration::from_secs(15),
            database_url: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            reject_breach_after_cutoff: true,
        }
    }
}

impl Settings {
    /// Load settings from `.env` + environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup (tests use a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let agent_base_url = get("AGENT_BASE_URL").map(|url| url.trim_end_matches('/').to_string());
        let dry_run = match get("DRY_RUN") {
            Some(value) => parse_bool("DRY_RUN", &value)?,
            None => agent_base_url.is_none(),
        };

        let log_format = match get("LOG_FORMAT").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("text") | Some("pretty") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(RunbookError::ConfigError(format!(
                    "LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        };

        let max_attempts: u32 = parse_or(&get, "MAX_RETRIES", defaults.max_attempts)?;
        if max_attempts == 0 {
            return Err(RunbookError::ConfigError(
                "MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        let retry_backoff_factor: f64 =
            parse_or(&get, "RETRY_BACKOFF_FACTOR", defaults.retry_backoff_factor)?;
        if retry_backoff_factor < 1.0 {
            return Err(RunbookError::ConfigError(
                "RETRY_BACKOFF_FACTOR must be >= 1.0".to_string(),
            ));
        }

        Ok(Self {
            api_port: match get("PORT").or_else(|| get("API_PORT")) {
                Some(value) => parse_value("PORT", &value)?,
                None => defaults.api_port,
            },
            agent_base_url,
            dry_run,
            sanctions_agent: get("AGENT_SANCTIONS").unwrap_or(defaults.sanctions_agent),
            liquidity_agent: get("AGENT_LIQUIDITY").unwrap_or(defaults.liquidity_agent),
            procedures_agent: get("AGENT_PROCEDURES").unwrap_or(defaults.procedures_agent),
            max_attempts,
            retry_delay: millis_or(&get, "RETRY_DELAY_MS", defaults.retry_delay)?,
            retry_backoff_factor,
            retry_max_delay: millis_or(&get, "RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            agent_timeout: millis_or(&get, "AGENT_TIMEOUT_MS", defaults.agent_timeout)?,
            write_timeout: millis_or(&get, "WRITE_TIMEOUT_MS", defaults.write_timeout)?,
            sse_heartbeat: Duration::from_secs(parse_or(
                &get,
                "SSE_HEARTBEAT_SECS",
                defaults.sse_heartbeat.as_secs(),
            )?),
            database_url: get("DATABASE_URL").or_else(|| get("POSTGRES_URL")),
            log_level: get("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            reject_breach_after_cutoff: match get("REJECT_BREACH_AFTER_CUTOFF") {
                Some(value) => parse_bool("REJECT_BREACH_AFTER_CUTOFF", &value)?,
                None => defaults.reject_breach_after_cutoff,
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.retry_delay,
            backoff_factor: self.retry_backoff_factor,
            max_delay: self.retry_max_delay,
        }
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        RunbookError::ConfigError(format!("{} has an invalid value: '{}'", key, value))
    })
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => parse_value(key, &value),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => parse_value::<u64>(key, &value).map(Duration::from_millis),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RunbookError::ConfigError(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}
