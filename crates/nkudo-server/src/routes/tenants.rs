//! Admin routes: tenant CRUD, API keys, per-tenant limits.
//!
//! API keys are returned in plaintext exactly once at creation; deletion
//! revokes (the row is kept for audit attribution).

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_core::audit::{event, Actor};
use nkudo_core::quota::QuotaResource;
use nkudo_core::secret::{generate_secret, hash_secret, API_KEY_PREFIX};
use nkudo_store::models::{ApiKey, NewTenant, Tenant, TenantLimits};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/tenants", post(create_tenant).get(list_tenants))
        .route("/tenants/{tenant_id}", get(get_tenant))
        .route(
            "/tenants/{tenant_id}/api-keys",
            post(create_api_key).get(list_api_keys),
        )
        .route(
            "/tenants/{tenant_id}/api-keys/{key_id}",
            axum::routing::delete(revoke_api_key),
        )
        .route(
            "/tenants/{tenant_id}/limits",
            get(get_limits).put(set_limits),
        )
        .route("/audit/status", get(audit_status))
}

// ── Tenants ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TenantListResponse {
    tenants: Vec<Tenant>,
}

/// `POST /tenants` — create a tenant.
async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewTenant>,
) -> Result<Json<Tenant>, ApiError> {
    if body.slug.is_empty()
        || !body
            .slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ApiError::BadRequest(
            "slug must match [a-z0-9-]+".to_owned(),
        ));
    }
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_owned()));
    }

    let tenant = state.repo.create_tenant(body).await?;
    state
        .audit
        .append_best_effort(event(
            tenant.id,
            Actor::System,
            "tenant.create",
            "tenant",
            &tenant.id.to_string(),
        ))
        .await;
    Ok(Json(tenant))
}

/// `GET /tenants` — list tenants.
async fn list_tenants(
    State(state): State<Arc<AppState>>,
) -> Result<Json<TenantListResponse>, ApiError> {
    let tenants = state.repo.list_tenants().await?;
    Ok(Json(TenantListResponse { tenants }))
}

/// `GET /tenants/{id}`
async fn get_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Tenant>, ApiError> {
    Ok(Json(state.repo.tenant_by_id(tenant_id).await?))
}

// ── API keys ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateApiKeyRequest {
    name: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateApiKeyResponse {
    key: ApiKey,
    /// The plaintext key. Store it securely — it cannot be retrieved again.
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ApiKeyListResponse {
    keys: Vec<ApiKey>,
}

/// `POST /tenants/{id}/api-keys` — create a key (raw value returned once).
async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<CreateApiKeyRequest>,
) -> Result<Json<CreateApiKeyResponse>, ApiError> {
    if body.name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_owned()));
    }
    state.repo.tenant_by_id(tenant_id).await?;
    state
        .quotas
        .check(tenant_id, QuotaResource::ApiKeys, 1)
        .await?;

    let raw = generate_secret(API_KEY_PREFIX);
    let key = state
        .repo
        .create_api_key(tenant_id, &body.name, &hash_secret(&raw), body.expires_at)
        .await?;

    state
        .audit
        .append_best_effort(event(
            tenant_id,
            Actor::System,
            "api_key.create",
            "api_key",
            &key.id.to_string(),
        ))
        .await;

    Ok(Json(CreateApiKeyResponse { key, api_key: raw }))
}

/// `GET /tenants/{id}/api-keys`
async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<ApiKeyListResponse>, ApiError> {
    let keys = state.repo.list_api_keys(tenant_id).await?;
    Ok(Json(ApiKeyListResponse { keys }))
}

/// `DELETE /tenants/{id}/api-keys/{key_id}` — revoke (keeps the row).
async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, key_id)): Path<(Uuid, Uuid)>,
) -> Result<axum::http::StatusCode, ApiError> {
    state.repo.revoke_api_key(tenant_id, key_id).await?;
    state
        .audit
        .append_best_effort(event(
            tenant_id,
            Actor::System,
            "api_key.revoke",
            "api_key",
            &key_id.to_string(),
        ))
        .await;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// ── Limits ───────────────────────────────────────────────────────────

/// `GET /tenants/{id}/limits` — the limits in force (overrides or defaults).
async fn get_limits(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<TenantLimits>, ApiError> {
    state.repo.tenant_by_id(tenant_id).await?;
    Ok(Json(state.quotas.limits(tenant_id).await?))
}

// ── Audit observability ──────────────────────────────────────────────

/// `GET /audit/status` — the background verifier's last report (`null`
/// until the first pass completes).
async fn audit_status(
    State(state): State<Arc<AppState>>,
) -> Json<Option<nkudo_core::audit::VerifyReport>> {
    Json(*state.audit_report.read().await)
}

/// `PUT /tenants/{id}/limits` — set overrides.
async fn set_limits(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    Json(body): Json<TenantLimits>,
) -> Result<Json<TenantLimits>, ApiError> {
    state.repo.tenant_by_id(tenant_id).await?;
    state.repo.set_tenant_limits(tenant_id, body).await?;
    state
        .audit
        .append_best_effort(event(
            tenant_id,
            Actor::System,
            "tenant.limits.set",
            "tenant",
            &tenant_id.to_string(),
        ))
        .await;
    Ok(Json(body))
}
