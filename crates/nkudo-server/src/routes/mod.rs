//! HTTP route handlers.
//!
//! Three route groups, matching the trust model:
//!
//! - `tenants` — admin-key routes (tenant CRUD, API keys, limits)
//! - `sites` / `plans` — API-key routes, tenant-scoped
//! - `agents` — the mTLS south edge (enroll, renew, heartbeat, leases,
//!   results, logs)

pub mod agents;
pub mod plans;
pub mod sites;
pub mod tenants;

use std::sync::Arc;

use axum::middleware as axum_mw;
use axum::routing::get;
use axum::{Json, Router};

use crate::error::ApiError;
use crate::middleware::{admin_auth, agent_auth, api_key_auth};
use crate::state::AppState;

/// Build the complete router.
pub fn router(state: Arc<AppState>) -> Router {
    let admin = tenants::router().route_layer(axum_mw::from_fn_with_state(
        Arc::clone(&state),
        admin_auth,
    ));

    let tenant_scoped = Router::new()
        .merge(sites::router())
        .merge(plans::router())
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            api_key_auth,
        ));

    let south = agents::authenticated_router().route_layer(axum_mw::from_fn_with_state(
        Arc::clone(&state),
        agent_auth,
    ));

    // Enrollment and renewal do CSR parsing and signing; cap their
    // concurrency so a flood cannot exhaust the signer.
    let public = agents::public_router().layer(tower::limit::ConcurrencyLimitLayer::new(16));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/crl", get(crl))
        .merge(public)
        .merge(admin)
        .merge(tenant_scoped)
        .merge(south)
        .with_state(state)
}

/// `GET /healthz` — liveness.
async fn healthz() -> &'static str {
    "ok"
}

/// `GET /crl` — the revocation list, for the TLS terminator.
async fn crl(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entries = state.repo.list_revoked_certificates().await?;
    Ok(Json(serde_json::json!({ "revoked": entries })))
}
