//! Plan application.
//!
//! The service layer in front of the store's idempotent apply: isolation
//! first, then the VM-create quota pre-flight, then the transactional
//! insert, then the audit event. A replayed idempotency key returns the
//! stored plan with zero new rows and zero repeated side effects.

use std::sync::Arc;

use uuid::Uuid;

use nkudo_store::models::{ActionType, ApplyPlanInput, ApplyPlanResult, PlanActionInput};
use nkudo_store::Repository;

use crate::audit::{event, Actor, ChainWriter};
use crate::error::PlanError;
use crate::isolation::{IsolationGuard, ResourceRef};
use crate::quota::{QuotaResource, QuotaService};

/// Apply-side plan service.
pub struct PlanService {
    repo: Arc<dyn Repository>,
    isolation: Arc<IsolationGuard>,
    quotas: Arc<QuotaService>,
    audit: Arc<ChainWriter>,
}

impl PlanService {
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        isolation: Arc<IsolationGuard>,
        quotas: Arc<QuotaService>,
        audit: Arc<ChainWriter>,
    ) -> Self {
        Self {
            repo,
            isolation,
            quotas,
            audit,
        }
    }

    /// Apply a plan to a site.
    pub async fn apply(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        idempotency_key: &str,
        actions: Vec<PlanActionInput>,
    ) -> Result<ApplyPlanResult, PlanError> {
        if idempotency_key.is_empty() {
            return Err(PlanError::Invalid {
                reason: "idempotency_key is required".to_owned(),
            });
        }
        if actions.is_empty() {
            return Err(PlanError::Invalid {
                reason: "a plan needs at least one action".to_owned(),
            });
        }

        self.isolation
            .ensure(tenant_id, ResourceRef::Site(site_id))
            .await?;

        // Pre-flight checks only gate *fresh* applies: a replayed
        // idempotency key must return the stored plan even when the tenant
        // has since reached a cap.
        let replay = self
            .repo
            .plan_by_idempotency_key(tenant_id, idempotency_key)
            .await?
            .is_some();
        if !replay {
            self.quotas
                .check(tenant_id, QuotaResource::ConcurrentPlans, 1)
                .await?;
            let creates = actions
                .iter()
                .filter(|a| a.action_type == ActionType::MicroVmCreate)
                .count() as i64;
            if creates > 0 {
                self.quotas
                    .check_vm_creates(tenant_id, site_id, creates)
                    .await?;
            }
        }

        let result = self
            .repo
            .apply_plan(ApplyPlanInput {
                tenant_id,
                site_id,
                idempotency_key: idempotency_key.to_owned(),
                actions,
            })
            .await?;

        if !result.reused {
            let mut ev = event(
                tenant_id,
                Actor::System,
                "plan.apply",
                "plan",
                &result.plan_id.to_string(),
            );
            ev.site_id = Some(site_id);
            ev.metadata_json = Some(format!(
                r#"{{"idempotency_key":{key},"executions":{count}}}"#,
                key = serde_json::to_string(idempotency_key)
                    .unwrap_or_else(|_| "\"\"".to_owned()),
                count = result.executions.len(),
            ));
            self.audit.append_best_effort(ev).await;
        }

        Ok(result)
    }
}
