//! Authentication middleware for the three edges.
//!
//! - **Admin**: `Authorization: Bearer <NKUDO_ADMIN_KEY>` (constant-time
//!   compare) for tenant and API-key management.
//! - **API key**: `Authorization: Bearer nk_…`, looked up by SHA-256 hash;
//!   the resolved tenant lands in request extensions as [`TenantContext`].
//! - **Agent**: the mTLS terminator forwards the verified client-cert
//!   serial in `x-nkudo-client-serial`; the middleware resolves the agent,
//!   rejects revoked (CRL), expired, or unenrolled identities, and injects
//!   [`AgentContext`] — all before any handler runs.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use uuid::Uuid;

use nkudo_core::secret::{constant_time_eq, hash_secret};
use nkudo_store::models::AgentStatus;

use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the terminator-verified client certificate serial.
pub const CLIENT_SERIAL_HEADER: &str = "x-nkudo-client-serial";

/// Identity of an admin-key caller.
#[derive(Debug, Clone, Copy)]
pub struct AdminContext;

/// Identity resolved from a tenant API key.
#[derive(Debug, Clone, Copy)]
pub struct TenantContext {
    pub tenant_id: Uuid,
    pub key_id: Uuid,
}

/// Identity resolved from an agent client certificate.
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub agent_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
}

fn bearer(req: &Request) -> Result<&str, ApiError> {
    req.headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| ApiError::Unauthorized("missing bearer credential".to_owned()))
}

/// Admin-key middleware.
pub async fn admin_auth(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Err(ApiError::Unauthorized(
            "admin key not configured".to_owned(),
        ));
    };
    let presented = bearer(&req)?;
    if !constant_time_eq(presented, expected) {
        return Err(ApiError::Unauthorized("invalid admin key".to_owned()));
    }
    let mut req = req;
    req.extensions_mut().insert(AdminContext);
    Ok(next.run(req).await)
}

/// API-key middleware.
pub async fn api_key_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = bearer(&req)?;
    let validation = state
        .repo
        .validate_api_key(&hash_secret(presented))
        .await
        .map_err(|e| match e {
            // An unknown key hash is a credential problem, not a 400.
            nkudo_store::StoreError::Invalid(_) => {
                ApiError::Unauthorized("invalid API key".to_owned())
            }
            other => other.into(),
        })?;
    req.extensions_mut().insert(TenantContext {
        tenant_id: validation.tenant_id,
        key_id: validation.key_id,
    });
    Ok(next.run(req).await)
}

/// Agent (south edge) middleware.
pub async fn agent_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let serial = req
        .headers()
        .get(CLIENT_SERIAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing client certificate".to_owned()))?
        .to_owned();

    if state.ca.is_revoked(&serial).await? {
        return Err(ApiError::Unauthorized(
            "client certificate revoked".to_owned(),
        ));
    }

    let agent = state
        .repo
        .agent_by_cert_serial(&serial)
        .await
        .map_err(|e| match e {
            nkudo_store::StoreError::NotFound(_) => {
                ApiError::Unauthorized("unknown client certificate".to_owned())
            }
            other => other.into(),
        })?;

    if agent.status == AgentStatus::Unenrolled {
        return Err(ApiError::Unauthorized("agent is unenrolled".to_owned()));
    }
    if agent.cert_expires_at <= Utc::now() {
        return Err(ApiError::Unauthorized(
            "client certificate expired".to_owned(),
        ));
    }

    req.extensions_mut().insert(AgentContext {
        agent_id: agent.id,
        tenant_id: agent.tenant_id,
        site_id: agent.site_id,
    });
    Ok(next.run(req).await)
}

/// Shared guard: the `{id}` in an `/agents/{id}/…` path must be the
/// authenticated agent.
pub fn require_self(ctx: &AgentContext, path_agent_id: Uuid) -> Result<(), ApiError> {
    if ctx.agent_id == path_agent_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden(
            "certificate does not match agent path".to_owned(),
        ))
    }
}
