//! API-key routes: plan submission.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use nkudo_store::models::{Execution, PlanActionInput};

use crate::error::ApiError;
use crate::middleware::TenantContext;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/sites/{site_id}/plans", post(apply_plan))
}

#[derive(Debug, Deserialize)]
struct ApplyPlanRequest {
    idempotency_key: String,
    actions: Vec<PlanActionInput>,
}

#[derive(Debug, Serialize)]
struct ApplyPlanResponse {
    plan_id: Uuid,
    executions: Vec<Execution>,
}

/// `POST /sites/{s}/plans` — idempotent by `(tenant, idempotency_key)`.
async fn apply_plan(
    State(state): State<Arc<AppState>>,
    Extension(ctx): Extension<TenantContext>,
    Path(site_id): Path<Uuid>,
    Json(body): Json<ApplyPlanRequest>,
) -> Result<Json<ApplyPlanResponse>, ApiError> {
    let result = state
        .plans
        .apply(ctx.tenant_id, site_id, &body.idempotency_key, body.actions)
        .await?;
    Ok(Json(ApplyPlanResponse {
        plan_id: result.plan_id,
        executions: result.executions,
    }))
}
