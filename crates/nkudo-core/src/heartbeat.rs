//! Heartbeat ingest and offline sweeping.
//!
//! Ingest is one repository transaction (host upsert, agent/site stamps, VM
//! reconcile). The sweeper is a single-writer background loop; no locking
//! beyond the repository transaction is needed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use uuid::Uuid;

use nkudo_store::models::{HeartbeatInput, HostFacts, VmReport};
use nkudo_store::{Repository, StoreError};

/// Heartbeat ingest facade.
pub struct HeartbeatService {
    repo: Arc<dyn Repository>,
}

impl HeartbeatService {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Ingest one heartbeat from an agent.
    pub async fn ingest(
        &self,
        agent_id: Uuid,
        facts: HostFacts,
        vm_reports: Vec<VmReport>,
    ) -> Result<(), StoreError> {
        self.repo
            .ingest_heartbeat(HeartbeatInput {
                agent_id,
                facts,
                vm_reports,
            })
            .await
    }
}

/// Background loop that marks stale agents offline.
pub struct Sweeper {
    repo: Arc<dyn Repository>,
    interval: Duration,
    stale_threshold: chrono::Duration,
}

impl Sweeper {
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        interval: Duration,
        stale_threshold: chrono::Duration,
    ) -> Self {
        Self {
            repo,
            interval,
            stale_threshold,
        }
    }

    /// Run one sweep immediately. Returns the number of agents swept.
    pub async fn sweep_once(&self) -> Result<i64, StoreError> {
        self.repo
            .sweep_offline_agents(Utc::now() - self.stale_threshold)
            .await
    }

    /// Run sweeps on the configured interval until `shutdown` fires.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            stale_secs = self.stale_threshold.num_seconds(),
            "offline sweeper started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(swept) => {
                            tracing::info!(swept, "agents marked offline");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "offline sweep failed, will retry next tick");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("offline sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use nkudo_store::models::{NewAgent, NewTenant};
    use nkudo_store::MemoryRepository;

    #[tokio::test]
    async fn sweep_once_flips_stale_agents() {
        let repo = Arc::new(MemoryRepository::new());
        let tenant = repo
            .create_tenant(NewTenant {
                slug: "acme".to_owned(),
                name: "Acme".to_owned(),
                primary_region: "eu".to_owned(),
                data_retention_days: 30,
            })
            .await
            .unwrap();
        let site = repo.create_site(tenant.id, "s", None, None).await.unwrap();
        repo.issue_enrollment_token(
            tenant.id,
            site.id,
            "h",
            Utc::now() + ChronoDuration::minutes(1),
        )
        .await
        .unwrap();
        let (_, agent) = repo
            .enroll_agent(
                "h",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge".to_owned(),
                    cert_serial: "s1".to_owned(),
                    cert_expires_at: Utc::now() + ChronoDuration::days(7),
                    refresh_token_hash: "r".to_owned(),
                },
            )
            .await
            .unwrap();

        let svc = HeartbeatService::new(Arc::clone(&repo) as Arc<dyn Repository>);
        svc.ingest(
            agent.id,
            HostFacts {
                cpu_cores: 4,
                memory_mib: 8192,
                arch: "aarch64".to_owned(),
                kernel: "6.8.0".to_owned(),
                disks: vec![],
            },
            vec![],
        )
        .await
        .unwrap();

        // A heartbeat just happened: nothing is stale at a 90s threshold.
        let sweeper = Sweeper::new(
            Arc::clone(&repo) as Arc<dyn Repository>,
            Duration::from_secs(15),
            ChronoDuration::seconds(90),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        // With a negative threshold everything is stale.
        let aggressive = Sweeper::new(
            repo,
            Duration::from_secs(15),
            ChronoDuration::seconds(-3600),
        );
        assert_eq!(aggressive.sweep_once().await.unwrap(), 1);
    }
}
