//! Lease scheduling and result reporting.
//!
//! Agents poll for work; the store hands out TTL-bounded exclusive leases on
//! executions at the agent's site and reclaims them after expiry. Reports
//! are fenced: only the current lease holder inside the TTL may land a
//! terminal transition, everyone else gets `LeaseLost`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use nkudo_store::models::{Execution, LeasedPlan, ResultReport};
use nkudo_store::{Repository, StoreError};

use crate::audit::{event, Actor, ChainWriter};

/// The lease bundle an agent receives from one poll.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    pub plans: Vec<LeasedPlan>,
    pub lease_expires_at: DateTime<Utc>,
}

/// Scheduler facade over the store's lease operations.
pub struct LeaseService {
    repo: Arc<dyn Repository>,
    audit: Arc<ChainWriter>,
    lease_ttl: Duration,
}

impl LeaseService {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>, audit: Arc<ChainWriter>, lease_ttl: Duration) -> Self {
        Self {
            repo,
            audit,
            lease_ttl,
        }
    }

    /// Lease up to `limit` pending executions at the agent's site.
    pub async fn lease(&self, agent_id: Uuid, limit: usize) -> Result<LeaseGrant, StoreError> {
        let plans = self
            .repo
            .lease_pending_plans(agent_id, limit, self.lease_ttl)
            .await?;
        if !plans.is_empty() {
            tracing::debug!(
                %agent_id,
                plans = plans.len(),
                "executions leased"
            );
        }
        Ok(LeaseGrant {
            plans,
            lease_expires_at: Utc::now() + self.lease_ttl,
        })
    }

    /// Record a terminal result from an agent. Emits `plan.action.result`.
    pub async fn report(
        &self,
        agent_id: Uuid,
        report: ResultReport,
    ) -> Result<Execution, StoreError> {
        let execution_id = report.execution_id;
        let ok = report.ok;
        let execution = self.repo.report_plan_result(agent_id, report).await?;

        let agent = self.repo.agent_by_id(agent_id).await?;
        let mut ev = event(
            agent.tenant_id,
            Actor::Agent(agent_id),
            "plan.action.result",
            "execution",
            &execution_id.to_string(),
        );
        ev.site_id = Some(agent.site_id);
        ev.metadata_json = Some(format!(r#"{{"ok":{ok}}}"#));
        self.audit.append_best_effort(ev).await;

        Ok(execution)
    }
}
