//! API-key routes: sites, enrollment tokens, listings, audit, unenroll.
//!
//! Every handler resolves the caller's tenant from [`TenantContext`] and
//! passes target ids through the isolation layer before the store is
//! touched.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_core::audit::{event, Actor};
use nkudo_core::isolation::ResourceRef;
use nkudo_core::quota::QuotaResource;
use nkudo_store::models::{
    AuditEvent, Execution, ExecutionLogRow, Host, MicroVm, Site,
};

use crate::error::ApiError;
use crate::middleware::TenantContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/tenants/{tenant_id}/sites",
            post(create_site).get(list_sites),
        )
        .route(
            "/tenants/{tenant_id}/enrollment-tokens",
            post(issue_enrollment_token),
        )
        .route("/tenants/{tenant_id}/audit-events", get(list_audit_events))
        .route("/sites/{site_id}/hosts", get(list_hosts))
        .route("/sites/{site_id}/vms", get(list_vms))
        .route("/sites/{site_id}/executions", get(list_executions))
        .route("/executions/{execution_id}/logs", get(list_execution_logs))
        .route("/agents/{agent_id}/unenroll", post(unenroll_agent))
}

fn require_tenant(ctx: TenantContext, path_tenant: Uuid) -> Result<(), ApiError> {
    if ctx.tenant_id == path_tenant {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "API key belongs to another tenant".to_owned(),
        ))
    }
}

// ── Sites ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateSiteRequest {
    name: String,
    external_key: Option<String>,
    location_country_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct SiteListResponse {
    sites: Vec<Site>,
}

/// `POST /tenants/{t}/sites`
async fn create_site(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<CreateSiteRequest>,
) -> Result<Json<Site>, ApiError> {
    require_tenant(ctx, tenant_id)?;
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_owned()));
    }
    state
        .quotas
        .check(tenant_id, QuotaResource::Sites, 1)
        .await?;
    let site = state
        .repo
        .create_site(
            tenant_id,
            &body.name,
            body.external_key.as_deref(),
            body.location_country_code.as_deref(),
        )
        .await?;

    let mut ev = event(
        tenant_id,
        Actor::User(ctx.key_id),
        "site.create",
        "site",
        &site.id.to_string(),
    );
    ev.site_id = Some(site.id);
    state.audit.append_best_effort(ev).await;

    Ok(Json(site))
}

/// `GET /tenants/{t}/sites`
async fn list_sites(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<SiteListResponse>, ApiError> {
    require_tenant(ctx, tenant_id)?;
    let sites = state.repo.list_sites(tenant_id).await?;
    Ok(Json(SiteListResponse { sites }))
}

// ── Enrollment tokens ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IssueTokenRequest {
    site_id: Uuid,
    expires_in_seconds: i64,
}

#[derive(Debug, Serialize)]
struct IssueTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// `POST /tenants/{t}/enrollment-tokens` — raw token returned once.
async fn issue_enrollment_token(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<IssueTokenRequest>,
) -> Result<Json<IssueTokenResponse>, ApiError> {
    require_tenant(ctx, tenant_id)?;
    if body.expires_in_seconds <= 0 {
        return Err(ApiError::BadRequest(
            "expires_in_seconds must be positive".to_owned(),
        ));
    }
    state
        .isolation
        .ensure(tenant_id, ResourceRef::Site(body.site_id))
        .await?;
    state
        .quotas
        .check(
            tenant_id,
            QuotaResource::AgentsPerSite {
                site_id: body.site_id,
            },
            1,
        )
        .await?;

    let ttl = Duration::seconds(body.expires_in_seconds.min(state.max_token_ttl_secs));
    let issued = state
        .enrollment
        .issue_token(tenant_id, body.site_id, ttl)
        .await?;
    Ok(Json(IssueTokenResponse {
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

// ── Listings ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HostListResponse {
    hosts: Vec<Host>,
}

#[derive(Debug, Serialize)]
struct VmListResponse {
    vms: Vec<MicroVm>,
}

#[derive(Debug, Serialize)]
struct ExecutionListResponse {
    executions: Vec<Execution>,
}

#[derive(Debug, Serialize)]
struct ExecutionLogResponse {
    logs: Vec<ExecutionLogRow>,
}

/// `GET /sites/{s}/hosts`
async fn list_hosts(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(site_id): Path<Uuid>,
) -> Result<Json<HostListResponse>, ApiError> {
    state
        .isolation
        .ensure(ctx.tenant_id, ResourceRef::Site(site_id))
        .await?;
    let hosts = state.repo.list_hosts(ctx.tenant_id, Some(site_id)).await?;
    Ok(Json(HostListResponse { hosts }))
}

/// `GET /sites/{s}/vms`
async fn list_vms(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(site_id): Path<Uuid>,
) -> Result<Json<VmListResponse>, ApiError> {
    state
        .isolation
        .ensure(ctx.tenant_id, ResourceRef::Site(site_id))
        .await?;
    let vms = state.repo.list_vms(ctx.tenant_id, Some(site_id)).await?;
    Ok(Json(VmListResponse { vms }))
}

/// `GET /sites/{s}/executions`
async fn list_executions(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(site_id): Path<Uuid>,
) -> Result<Json<ExecutionListResponse>, ApiError> {
    state
        .isolation
        .ensure(ctx.tenant_id, ResourceRef::Site(site_id))
        .await?;
    let executions = state
        .repo
        .list_executions(ctx.tenant_id, Some(site_id))
        .await?;
    Ok(Json(ExecutionListResponse { executions }))
}

/// `GET /executions/{e}/logs`
async fn list_execution_logs(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionLogResponse>, ApiError> {
    state
        .isolation
        .ensure(ctx.tenant_id, ResourceRef::Execution(execution_id))
        .await?;
    let logs = state
        .repo
        .list_execution_logs(ctx.tenant_id, execution_id)
        .await?;
    Ok(Json(ExecutionLogResponse { logs }))
}

// ── Audit ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    limit: usize,
}

const fn default_audit_limit() -> usize {
    100
}

#[derive(Debug, Serialize)]
struct AuditListResponse {
    events: Vec<AuditEvent>,
}

/// `GET /tenants/{t}/audit-events?limit=N` — id ascending.
async fn list_audit_events(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditListResponse>, ApiError> {
    require_tenant(ctx, tenant_id)?;
    let events = state
        .repo
        .list_audit_events(tenant_id, query.limit.min(1000))
        .await?;
    Ok(Json(AuditListResponse { events }))
}

// ── Unenroll ─────────────────────────────────────────────────────────

/// `POST /agents/{id}/unenroll` — retire an agent and revoke its
/// certificate.
async fn unenroll_agent(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(agent_id): Path<Uuid>,
) -> Result<axum::http::StatusCode, ApiError> {
    let agent = state.repo.agent_by_id(agent_id).await.map_err(|e| match e {
        nkudo_store::StoreError::NotFound(_) => {
            ApiError::Forbidden("resource belongs to another tenant".to_owned())
        }
        other => other.into(),
    })?;
    state
        .isolation
        .ensure(
            ctx.tenant_id,
            ResourceRef::Agent {
                id: agent.id,
                tenant_id: agent.tenant_id,
            },
        )
        .await?;

    state.repo.unenroll_agent(agent_id).await?;
    state
        .ca
        .revoke(&agent.cert_serial, "unenrolled", agent_id)
        .await?;

    let mut ev = event(
        ctx.tenant_id,
        Actor::User(ctx.key_id),
        "agent.unenroll",
        "agent",
        &agent_id.to_string(),
    );
    ev.site_id = Some(agent.site_id);
    state.audit.append_best_effort(ev).await;

    Ok(axum::http::StatusCode::NO_CONTENT)
}
