//! South edge: agent-facing routes over mTLS.
//!
//! `/enroll` and `/agents/{id}/renew` are public — their credentials are the
//! enrollment token and the refresh token respectively, which is what lets
//! an agent with an expired or revoked certificate rotate back in. Every
//! other route runs behind the client-certificate middleware and requires
//! the path agent to be the authenticated one.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_core::logsink::IngestOutcome;
use nkudo_store::models::{
    HostFacts, LeasedPlan, LogEntryInput, ResultReport, VmReport,
};

use crate::error::ApiError;
use crate::middleware::{require_self, AgentContext};
use crate::state::AppState;

/// Routes reachable without a client certificate.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/enroll", post(enroll))
        .route("/agents/{agent_id}/renew", post(renew))
}

/// Routes behind the client-certificate middleware.
pub fn authenticated_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents/{agent_id}/heartbeat", post(heartbeat))
        .route("/agents/{agent_id}/plans", get(lease_plans))
        .route("/agents/{agent_id}/results", post(report_result))
        .route("/agents/{agent_id}/logs", post(ingest_logs))
}

// ── Enroll ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EnrollRequest {
    token: String,
    csr_pem: String,
    hostname: String,
}

#[derive(Debug, Serialize)]
struct EnrollResponse {
    agent_id: Uuid,
    client_certificate_pem: String,
    ca_certificate_pem: String,
    refresh_token: String,
    expires_at: DateTime<Utc>,
}

/// `POST /enroll` — one-shot token in, identity out.
async fn enroll(
    State(state): State<Arc<AppState>>,
    Json(body): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    if body.hostname.is_empty() {
        return Err(ApiError::BadRequest("hostname is required".to_owned()));
    }
    let response = state
        .enrollment
        .enroll(&body.token, &body.csr_pem, &body.hostname)
        .await?;
    Ok(Json(EnrollResponse {
        agent_id: response.agent_id,
        client_certificate_pem: response.client_certificate_pem,
        ca_certificate_pem: response.ca_certificate_pem,
        refresh_token: response.refresh_token,
        expires_at: response.expires_at,
    }))
}

// ── Renew ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RenewRequest {
    csr_pem: String,
    refresh_token: String,
}

#[derive(Debug, Serialize)]
struct RenewResponse {
    client_certificate_pem: String,
    expires_at: DateTime<Utc>,
    refresh_token: String,
}

/// `POST /agents/{id}/renew` — refresh-token-gated rotation.
async fn renew(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<RenewRequest>,
) -> Result<Json<RenewResponse>, ApiError> {
    let agent = state.repo.agent_by_id(agent_id).await.map_err(|e| match e {
        nkudo_store::StoreError::NotFound(_) => {
            ApiError::Unauthorized("unknown agent".to_owned())
        }
        other => other.into(),
    })?;
    let renewed = state
        .ca
        .renew(&agent, &body.csr_pem, &body.refresh_token)
        .await?;
    Ok(Json(RenewResponse {
        client_certificate_pem: renewed.certificate.certificate_pem,
        expires_at: renewed.certificate.not_after,
        refresh_token: renewed.refresh_token,
    }))
}

// ── Heartbeat ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    host_facts: HostFacts,
    #[serde(default)]
    vm_reports: Vec<VmReport>,
}

/// `POST /agents/{id}/heartbeat` → 204
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<HeartbeatRequest>,
) -> Result<axum::http::StatusCode, ApiError> {
    require_self(&ctx, agent_id)?;
    state
        .heartbeats
        .ingest(agent_id, body.host_facts, body.vm_reports)
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ── Leases ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LeaseQuery {
    #[serde(default = "default_lease_limit")]
    limit: usize,
}

const fn default_lease_limit() -> usize {
    16
}

#[derive(Debug, Serialize)]
struct LeaseResponse {
    plans: Vec<LeasedPlan>,
    lease_expires_at: DateTime<Utc>,
}

/// `GET /agents/{id}/plans?limit=N` — lease pending work.
async fn lease_plans(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Path(agent_id): Path<Uuid>,
    Query(query): Query<LeaseQuery>,
) -> Result<Json<LeaseResponse>, ApiError> {
    require_self(&ctx, agent_id)?;
    let grant = state
        .leases
        .lease(agent_id, query.limit.clamp(1, 64))
        .await?;
    Ok(Json(LeaseResponse {
        plans: grant.plans,
        lease_expires_at: grant.lease_expires_at,
    }))
}

// ── Results ──────────────────────────────────────────────────────────

/// `POST /agents/{id}/results` → 204, or 409 when the lease moved on.
async fn report_result(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Path(agent_id): Path<Uuid>,
    Json(report): Json<ResultReport>,
) -> Result<axum::http::StatusCode, ApiError> {
    require_self(&ctx, agent_id)?;
    state.leases.report(agent_id, report).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ── Logs ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LogIngestRequest {
    entries: Vec<LogEntryInput>,
}

/// `POST /agents/{id}/logs` → `{accepted, dropped}`. Dropping is not an
/// error; the agent backs off and retries what it kept.
async fn ingest_logs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<AgentContext>,
    Path(agent_id): Path<Uuid>,
    Json(body): Json<LogIngestRequest>,
) -> Result<Json<IngestOutcome>, ApiError> {
    require_self(&ctx, agent_id)?;
    Ok(Json(state.logs.ingest(body.entries)))
}
