//! Cross-tenant isolation predicates.
//!
//! A pure, stateless layer every tenant-scoped mutation passes its target
//! through before the repository is touched. Resources that embed their
//! tenant id are compared in memory; `Site` and `Execution` resolve
//! ownership through repository predicates. A violation and a nonexistent
//! resource are deliberately the same error, so probing cannot reveal
//! foreign ids.

use std::sync::Arc;

use uuid::Uuid;

use nkudo_store::Repository;

use crate::error::IsolationError;

/// A reference to a tenant-scoped resource.
#[derive(Debug, Clone, Copy)]
pub enum ResourceRef {
    /// Ownership resolved via the repository.
    Site(Uuid),
    /// Ownership resolved via the repository (through the owning plan).
    Execution(Uuid),
    /// Embedded tenant id, compared directly.
    Agent { id: Uuid, tenant_id: Uuid },
    Vm { id: Uuid, tenant_id: Uuid },
    Plan { id: Uuid, tenant_id: Uuid },
    ApiKey { id: Uuid, tenant_id: Uuid },
}

impl ResourceRef {
    const fn type_name(self) -> &'static str {
        match self {
            Self::Site(_) => "site",
            Self::Execution(_) => "execution",
            Self::Agent { .. } => "agent",
            Self::Vm { .. } => "vm",
            Self::Plan { .. } => "plan",
            Self::ApiKey { .. } => "api_key",
        }
    }

    fn id(self) -> Uuid {
        match self {
            Self::Site(id) | Self::Execution(id) => id,
            Self::Agent { id, .. }
            | Self::Vm { id, .. }
            | Self::Plan { id, .. }
            | Self::ApiKey { id, .. } => id,
        }
    }
}

/// Tenant-isolation guard.
pub struct IsolationGuard {
    repo: Arc<dyn Repository>,
}

impl IsolationGuard {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Reject access unless `resource` belongs to `caller_tenant`.
    pub async fn ensure(
        &self,
        caller_tenant: Uuid,
        resource: ResourceRef,
    ) -> Result<(), IsolationError> {
        let owned = match resource {
            ResourceRef::Site(site_id) => {
                self.repo
                    .site_belongs_to_tenant(site_id, caller_tenant)
                    .await?
            }
            ResourceRef::Execution(execution_id) => {
                self.repo
                    .execution_belongs_to_tenant(execution_id, caller_tenant)
                    .await?
            }
            ResourceRef::Agent { tenant_id, .. }
            | ResourceRef::Vm { tenant_id, .. }
            | ResourceRef::Plan { tenant_id, .. }
            | ResourceRef::ApiKey { tenant_id, .. } => tenant_id == caller_tenant,
        };
        if owned {
            Ok(())
        } else {
            Err(IsolationError::Violation {
                resource_type: resource.type_name(),
                resource_id: resource.id().to_string(),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nkudo_store::models::NewTenant;
    use nkudo_store::MemoryRepository;

    #[tokio::test]
    async fn foreign_site_is_a_violation() {
        let repo = Arc::new(MemoryRepository::new());
        let t1 = repo
            .create_tenant(NewTenant {
                slug: "one".to_owned(),
                name: "One".to_owned(),
                primary_region: "eu".to_owned(),
                data_retention_days: 30,
            })
            .await
            .unwrap();
        let t2 = repo
            .create_tenant(NewTenant {
                slug: "two".to_owned(),
                name: "Two".to_owned(),
                primary_region: "eu".to_owned(),
                data_retention_days: 30,
            })
            .await
            .unwrap();
        let site = repo.create_site(t1.id, "site", None, None).await.unwrap();

        let guard = IsolationGuard::new(repo);
        guard
            .ensure(t1.id, ResourceRef::Site(site.id))
            .await
            .unwrap();
        let err = guard
            .ensure(t2.id, ResourceRef::Site(site.id))
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::Violation { .. }));
    }

    #[tokio::test]
    async fn unknown_resource_reads_as_violation() {
        let repo = Arc::new(MemoryRepository::new());
        let guard = IsolationGuard::new(repo);
        let err = guard
            .ensure(Uuid::new_v4(), ResourceRef::Execution(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::Violation { .. }));
    }

    #[tokio::test]
    async fn embedded_tenant_comparison() {
        let repo = Arc::new(MemoryRepository::new());
        let guard = IsolationGuard::new(repo);
        let tenant = Uuid::new_v4();
        guard
            .ensure(
                tenant,
                ResourceRef::Agent {
                    id: Uuid::new_v4(),
                    tenant_id: tenant,
                },
            )
            .await
            .unwrap();
        let err = guard
            .ensure(
                tenant,
                ResourceRef::Vm {
                    id: Uuid::new_v4(),
                    tenant_id: Uuid::new_v4(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::Violation { .. }));
    }
}
