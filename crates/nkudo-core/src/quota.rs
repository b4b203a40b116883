//! Per-tenant quota enforcement.
//!
//! Pre-flight checks for create operations: `usage + count > limit` rejects.
//! Usage comes from a pluggable [`UsageProvider`] (repository-backed in
//! production, fixed-value fakes in tests). The check runs outside the
//! create transaction, so racing creates may transiently overshoot the
//! limit; the sweep of record is the stored rows, not the counter.

use std::sync::Arc;

use uuid::Uuid;

use nkudo_store::models::TenantLimits;
use nkudo_store::{Repository, StoreError};

use crate::error::QuotaError;

/// The resource classes quotas apply to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaResource {
    /// Sites per tenant.
    Sites,
    /// Agents per site.
    AgentsPerSite { site_id: Uuid },
    /// Non-deleted VMs per agent.
    VmsPerAgent { agent_id: Uuid },
    /// Non-deleted VMs at a site (used for the apply-time create
    /// pre-flight, where the executing agent is not yet known).
    VmsPerSite { site_id: Uuid },
    /// Plans with non-terminal executions per tenant.
    ConcurrentPlans,
    /// Non-revoked API keys per tenant.
    ApiKeys,
}

impl QuotaResource {
    const fn name(self) -> &'static str {
        match self {
            Self::Sites => "sites",
            Self::AgentsPerSite { .. } => "agents_per_site",
            Self::VmsPerAgent { .. } => "vms_per_agent",
            Self::VmsPerSite { .. } => "vms_per_site",
            Self::ConcurrentPlans => "concurrent_plans",
            Self::ApiKeys => "api_keys",
        }
    }
}

/// Supplies current usage numbers for quota checks.
#[async_trait::async_trait]
pub trait UsageProvider: Send + Sync + 'static {
    async fn usage(
        &self,
        tenant_id: Uuid,
        resource: QuotaResource,
    ) -> Result<i64, StoreError>;
}

/// Production usage provider: counts rows through the repository.
pub struct RepoUsageProvider {
    repo: Arc<dyn Repository>,
}

impl RepoUsageProvider {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }
}

#[async_trait::async_trait]
impl UsageProvider for RepoUsageProvider {
    async fn usage(
        &self,
        tenant_id: Uuid,
        resource: QuotaResource,
    ) -> Result<i64, StoreError> {
        match resource {
            QuotaResource::Sites => self.repo.count_sites(tenant_id).await,
            QuotaResource::AgentsPerSite { site_id } => {
                self.repo.count_agents_for_site(site_id).await
            }
            QuotaResource::VmsPerAgent { agent_id } => {
                self.repo.count_vms_for_agent(agent_id).await
            }
            QuotaResource::VmsPerSite { site_id } => {
                let vms = self.repo.list_vms(tenant_id, Some(site_id)).await?;
                Ok(vms
                    .iter()
                    .filter(|v| v.status != nkudo_store::models::VmStatus::Deleted)
                    .count() as i64)
            }
            QuotaResource::ConcurrentPlans => self.repo.count_open_plans(tenant_id).await,
            QuotaResource::ApiKeys => self.repo.count_api_keys(tenant_id).await,
        }
    }
}

/// Quota checker: per-tenant limits (stored overrides or configured
/// defaults) against provider-supplied usage.
pub struct QuotaService {
    repo: Arc<dyn Repository>,
    provider: Arc<dyn UsageProvider>,
    defaults: TenantLimits,
}

impl QuotaService {
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        provider: Arc<dyn UsageProvider>,
        defaults: TenantLimits,
    ) -> Self {
        Self {
            repo,
            provider,
            defaults,
        }
    }

    /// The limits in force for a tenant.
    pub async fn limits(&self, tenant_id: Uuid) -> Result<TenantLimits, QuotaError> {
        Ok(self
            .repo
            .tenant_limits(tenant_id)
            .await?
            .unwrap_or(self.defaults))
    }

    /// Reject unless `usage + count` fits under the tenant's limit.
    pub async fn check(
        &self,
        tenant_id: Uuid,
        resource: QuotaResource,
        count: i64,
    ) -> Result<(), QuotaError> {
        let limits = self.limits(tenant_id).await?;
        let limit = match resource {
            QuotaResource::Sites => limits.max_sites,
            QuotaResource::AgentsPerSite { .. } => limits.max_agents_per_site,
            QuotaResource::VmsPerAgent { .. } => limits.max_vms_per_agent,
            QuotaResource::VmsPerSite { .. } => limits.max_vms_per_agent,
            QuotaResource::ConcurrentPlans => limits.max_concurrent_plans,
            QuotaResource::ApiKeys => limits.max_api_keys,
        };
        let current = self.provider.usage(tenant_id, resource).await?;
        if current.saturating_add(count) > limit {
            return Err(QuotaError::Exceeded {
                resource: resource.name(),
                limit,
                current,
                requested: count,
            });
        }
        Ok(())
    }

    /// Apply-time pre-flight for a batch of VM creates targeting one site.
    ///
    /// The executing agent is unknown until lease time, so the cap is the
    /// site's aggregate capacity: `max_vms_per_agent` per enrolled agent
    /// (at least one, so an agent-less site can still stage its first
    /// plan). Per-agent placement is the provider's concern at execute
    /// time.
    pub async fn check_vm_creates(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        creates: i64,
    ) -> Result<(), QuotaError> {
        let limits = self.limits(tenant_id).await?;
        let agents = self.repo.count_agents_for_site(site_id).await?.max(1);
        let limit = limits.max_vms_per_agent.saturating_mul(agents);
        let resource = QuotaResource::VmsPerSite { site_id };
        let current = self.provider.usage(tenant_id, resource).await?;
        if current.saturating_add(creates) > limit {
            return Err(QuotaError::Exceeded {
                resource: resource.name(),
                limit,
                current,
                requested: creates,
            });
        }
        Ok(())
    }
}
