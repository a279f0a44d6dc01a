//! REST API Server for the emergency payment runbook
//!
//! Exposes run start, live event streaming (SSE), results and history.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::agents::{AgentFailure, AgentOutcome, LiquidityRequest, SanctionsRequest};
use crate::config::Settings;
use crate::error::RunbookError;
use crate::intake::PaymentIntakeParser;
use crate::models::{PaymentOverrides, PaymentRequest, RunFilter, RunStatus};
use crate::orchestrator::RunOrchestrator;

// =============================
// Request Models
// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StartRequest {
    pub message: String,
    #[serde(default)]
    pub overrides: PaymentOverrides,
    #[serde(default)]
    pub run_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub from_seq: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Screen one beneficiary outside of a run.
#[derive(Debug, Deserialize)]
pub struct DirectSanctionsRequest {
    pub beneficiary_name: String,
    #[serde(default)]
    pub beneficiary_country: Option<String>,
}

/// Check the liquidity impact of one amount outside of a run.
#[derive(Debug, Deserialize)]
pub struct DirectLiquidityRequest {
    pub amount: f64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub account_id: Option<String>,
}

// =============================
// Response Wrapper
// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

fn error_response(err: RunbookError) -> Response {
    let status = match &err {
        RunbookError::RunNotFound(_) => StatusCode::NOT_FOUND,
        RunbookError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RunbookError::RunAlreadyExists(_) | RunbookError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        _ => {
            error!(error = %err, kind = err.kind(), "Request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(ApiResponse::error(err.to_string()))).into_response()
}

// =============================
// API State
// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<RunOrchestrator>,
    pub heartbeat: Duration,
}

// =============================
// Health Endpoint
// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

// =============================
// Runbook Endpoints
// =============================

async fn start_run(State(state): State<ApiState>, Json(req): Json<StartRequest>) -> Response {
    info!(run_id = ?req.run_id, "Received start request");

    match state
        .orchestrator
        .start(req.message, req.overrides, req.run_id)
        .await
    {
        Ok(outcome) => {
            let status = if outcome.created {
                StatusCode::ACCEPTED
            } else {
                StatusCode::OK
            };
            (status, Json(outcome)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn stream_run(
    State(state): State<ApiState>,
    Path(run_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let from_seq = query.from_seq.unwrap_or(1).max(1);

    let events = match state.orchestrator.subscribe(&run_id, from_seq).await {
        Ok(events) => events,
        Err(e) => return error_response(e),
    };

    info!(run_id = %run_id, from_seq, "Stream subscriber attached");
    let frames = events.map(|event| Event::default().json_data(&event));

    Sse::new(frames)
        .keep_alive(KeepAlive::new().interval(state.heartbeat))
        .into_response()
}

async fn run_result(State(state): State<ApiState>, Path(run_id): Path<String>) -> Response {
    match state.orchestrator.result(&run_id).await {
        Ok(result) if result.status.is_terminal() => (StatusCode::OK, Json(result)).into_response(),
        Ok(result) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "run_id": result.run_id,
                "status": result.status,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_runs(State(state): State<ApiState>, Query(query): Query<ListQuery>) -> Response {
    let status = match query.status.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(raw) => match raw.parse::<RunStatus>() {
            Ok(status) => Some(status),
            Err(e) => return error_response(e),
        },
        None => None,
    };

    let defaults = RunFilter::default();
    let filter = RunFilter {
        status,
        limit: query.limit.unwrap_or(defaults.limit),
        offset: query.offset.unwrap_or(defaults.offset),
    };

    match state.orchestrator.list(filter).await {
        Ok(runs) => (StatusCode::OK, Json(runs)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn run_detail(State(state): State<ApiState>, Path(run_id): Path<String>) -> Response {
    match state.orchestrator.detail(&run_id).await {
        Ok(detail) => (StatusCode::OK, Json(detail)).into_response(),
        Err(e) => error_response(e),
    }
}

// =============================
// Direct Agent Endpoints
// =============================

/// Payment with intake defaults and a `direct-` id; no run is created.
fn direct_payment(overrides: PaymentOverrides) -> PaymentRequest {
    let payment_id = format!("direct-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let overrides = PaymentOverrides {
        payment_id: Some(payment_id),
        ..overrides
    };
    PaymentIntakeParser::parse("direct agent invocation", &overrides, chrono::Utc::now()).payment
}

fn agent_response<T: Serialize>(
    agent: &str,
    outcome: Result<AgentOutcome<T>, AgentFailure>,
) -> Response {
    match outcome {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(failure) => {
            warn!(agent, error = %failure, "Direct agent call failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(format!("{} failed: {}", agent, failure))),
            )
                .into_response()
        }
    }
}

async fn direct_sanctions_screen(
    State(state): State<ApiState>,
    Json(req): Json<DirectSanctionsRequest>,
) -> Response {
    let beneficiary_name = req.beneficiary_name.trim().to_string();
    if beneficiary_name.is_empty() {
        return error_response(RunbookError::InvalidRequest(
            "beneficiary_name must not be empty".to_string(),
        ));
    }

    let payment = direct_payment(PaymentOverrides {
        beneficiary_name: Some(beneficiary_name),
        beneficiary_country: req.beneficiary_country,
        ..Default::default()
    });
    info!(payment_id = %payment.payment_id, "Direct sanctions screening");

    let agents = state.orchestrator.agents();
    let outcome = agents
        .screen_sanctions(&SanctionsRequest::for_payment(&payment))
        .await;
    agent_response(agents.sanctions.name(), outcome)
}

async fn direct_liquidity_check(
    State(state): State<ApiState>,
    Json(req): Json<DirectLiquidityRequest>,
) -> Response {
    if !req.amount.is_finite() || req.amount <= 0.0 {
        return error_response(RunbookError::InvalidRequest(
            "amount must be a positive number".to_string(),
        ));
    }

    let payment = direct_payment(PaymentOverrides {
        amount: Some(req.amount),
        currency: req.currency,
        entity: req.entity,
        account_id: req.account_id,
        ..Default::default()
    });
    info!(payment_id = %payment.payment_id, "Direct liquidity check");

    let agents = state.orchestrator.agents();
    let outcome = agents
        .assess_liquidity(&LiquidityRequest::for_payment(&payment))
        .await;
    agent_response(agents.liquidity.name(), outcome)
}

// =============================
// Router
// =============================

pub fn create_router(orchestrator: Arc<RunOrchestrator>, heartbeat: Duration) -> Router {
    let state = ApiState {
        orchestrator,
        heartbeat,
    };

    Router::new()
        .route("/health", get(health))
        .route("/api/runbook/start", post(start_run))
        .route("/api/runbook/stream/:run_id", get(stream_run))
        .route("/api/runbook/result/:run_id", get(run_result))
        .route("/api/runbook/runs", get(list_runs))
        .route("/api/runbook/run/:run_id", get(run_detail))
        .route("/api/agents/sanctions/screen", post(direct_sanctions_screen))
        .route("/api/agents/liquidity/check", post(direct_liquidity_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// =============================
// Server Startup
// =============================

pub async fn start_server(
    orchestrator: Arc<RunOrchestrator>,
    settings: &Settings,
) -> crate::Result<()> {
    let router = create_router(orchestrator, settings.sse_heartbeat);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", settings.api_port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", settings.api_port);
    info!("Local: http://127.0.0.1:{}", settings.api_port);

    axum::serve(listener, router).await?;

    Ok(())
}
