//! End-to-end scenarios over the in-memory store: enrollment, plan
//! idempotence, lease reclaim, audit tampering, quotas, and certificate
//! renewal — the contract the HTTP edges are wired on top of.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use nkudo_core::audit::{ChainWriter, Verifier, VerifyReport};
use nkudo_core::enroll::EnrollmentService;
use nkudo_core::isolation::IsolationGuard;
use nkudo_core::lease::LeaseService;
use nkudo_core::pki::CertificateAuthority;
use nkudo_core::plan::PlanService;
use nkudo_core::quota::{QuotaService, RepoUsageProvider};
use nkudo_core::{EnrollError, PkiError, PlanError, QuotaError};
use nkudo_store::models::{
    ActionType, NewTenant, PlanActionInput, ResultReport, Site, Tenant, TenantLimits, VmStatus,
};
use nkudo_store::{MemoryRepository, Repository, StoreError};

struct Harness {
    repo: Arc<MemoryRepository>,
    ca: Arc<CertificateAuthority>,
    enrollment: EnrollmentService,
    plans: PlanService,
    leases: LeaseService,
}

fn harness_with_limits(limits: TenantLimits) -> Harness {
    let repo = Arc::new(MemoryRepository::new());
    let repo_dyn: Arc<dyn Repository> = Arc::clone(&repo) as Arc<dyn Repository>;
    let audit = Arc::new(ChainWriter::new(Arc::clone(&repo_dyn)));
    let ca = Arc::new(
        CertificateAuthority::generate(Arc::clone(&repo_dyn), "nkudo test ca", Duration::days(7))
            .unwrap(),
    );
    let isolation = Arc::new(IsolationGuard::new(Arc::clone(&repo_dyn)));
    let quotas = Arc::new(QuotaService::new(
        Arc::clone(&repo_dyn),
        Arc::new(RepoUsageProvider::new(Arc::clone(&repo_dyn))),
        limits,
    ));
    let enrollment = EnrollmentService::new(
        Arc::clone(&repo_dyn),
        Arc::clone(&ca),
        Arc::clone(&audit),
    );
    let plans = PlanService::new(
        Arc::clone(&repo_dyn),
        isolation,
        quotas,
        Arc::clone(&audit),
    );
    let leases = LeaseService::new(Arc::clone(&repo_dyn), audit, Duration::minutes(5));
    Harness {
        repo,
        ca,
        enrollment,
        plans,
        leases,
    }
}

fn harness() -> Harness {
    harness_with_limits(TenantLimits::default())
}

fn csr() -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.serialize_request(&key).unwrap().pem().unwrap()
}

async fn tenant_and_site(h: &Harness) -> (Tenant, Site) {
    let tenant = h
        .repo
        .create_tenant(NewTenant {
            slug: "acme".to_owned(),
            name: "Acme".to_owned(),
            primary_region: "eu-central".to_owned(),
            data_retention_days: 90,
        })
        .await
        .unwrap();
    let site = h
        .repo
        .create_site(tenant.id, "factory-1", None, Some("DE"))
        .await
        .unwrap();
    (tenant, site)
}

// ── Scenario 1: enrollment happy path ────────────────────────────────

#[tokio::test]
async fn enrollment_token_enrolls_exactly_once() {
    let h = harness();
    let (tenant, site) = tenant_and_site(&h).await;

    let issued = h
        .enrollment
        .issue_token(tenant.id, site.id, Duration::seconds(60))
        .await
        .unwrap();
    assert!(issued.token.starts_with("net_"));

    let response = h
        .enrollment
        .enroll(&issued.token, &csr(), "edge-01")
        .await
        .unwrap();
    assert!(response
        .client_certificate_pem
        .contains("BEGIN CERTIFICATE"));
    assert!(response.ca_certificate_pem.contains("BEGIN CERTIFICATE"));
    assert!(response.refresh_token.starts_with("nrt_"));

    let agent = h.repo.agent_by_id(response.agent_id).await.unwrap();
    assert_eq!(agent.tenant_id, tenant.id);
    assert_eq!(agent.site_id, site.id);
    assert_eq!(agent.hostname, "edge-01");
    assert!(agent.cert_expires_at > Utc::now());

    // Second use of the same token always fails.
    let err = h
        .enrollment
        .enroll(&issued.token, &csr(), "edge-02")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EnrollError::Store(StoreError::AlreadyConsumed)
    ));
}

// ── Scenario 2: plan idempotence ─────────────────────────────────────

#[tokio::test]
async fn plan_apply_twice_yields_one_plan_one_vm() {
    let h = harness();
    let (tenant, site) = tenant_and_site(&h).await;
    let token = h
        .enrollment
        .issue_token(tenant.id, site.id, Duration::seconds(60))
        .await
        .unwrap();
    let enrolled = h
        .enrollment
        .enroll(&token.token, &csr(), "edge-01")
        .await
        .unwrap();

    let actions = vec![PlanActionInput {
        action_type: ActionType::MicroVmCreate,
        params: json!({"name": "web", "vcpu": 2, "mem_mib": 512}),
        timeout_sec: 120,
    }];
    let first = h
        .plans
        .apply(tenant.id, site.id, "ik-1", actions.clone())
        .await
        .unwrap();
    let second = h
        .plans
        .apply(tenant.id, site.id, "ik-1", actions)
        .await
        .unwrap();
    assert_eq!(first.plan_id, second.plan_id);
    assert!(second.reused);
    assert_eq!(second.executions.len(), 1);

    // One execution row total; agent executes and reports once.
    let grant = h.leases.lease(enrolled.agent_id, 10).await.unwrap();
    assert_eq!(grant.plans.len(), 1);
    assert_eq!(grant.plans[0].actions.len(), 1);
    h.leases
        .report(
            enrolled.agent_id,
            ResultReport {
                execution_id: grant.plans[0].actions[0].execution_id,
                ok: true,
                error_code: None,
                message: String::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
            },
        )
        .await
        .unwrap();

    let vms = h.repo.list_vms(tenant.id, Some(site.id)).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].status, VmStatus::Running);
}

// ── Scenario 3: lease expiry reclaim ─────────────────────────────────

#[tokio::test]
async fn expired_lease_moves_on_and_late_reporter_loses() {
    let h = harness();
    let (tenant, site) = tenant_and_site(&h).await;

    let mut agents = Vec::new();
    for n in 0..2 {
        let token = h
            .enrollment
            .issue_token(tenant.id, site.id, Duration::seconds(60))
            .await
            .unwrap();
        let enrolled = h
            .enrollment
            .enroll(&token.token, &csr(), &format!("edge-{n}"))
            .await
            .unwrap();
        agents.push(enrolled.agent_id);
    }

    h.plans
        .apply(
            tenant.id,
            site.id,
            "ik-1",
            vec![PlanActionInput {
                action_type: ActionType::CommandExecute,
                params: json!({"command": "uname -a"}),
                timeout_sec: 30,
            }],
        )
        .await
        .unwrap();

    // Agent A leases with an immediately-expiring TTL (simulated crash).
    let short_leases = LeaseService::new(
        Arc::clone(&h.repo) as Arc<dyn Repository>,
        Arc::new(ChainWriter::new(Arc::clone(&h.repo) as Arc<dyn Repository>)),
        Duration::zero(),
    );
    let grant_a = short_leases.lease(agents[0], 10).await.unwrap();
    let exec_id = grant_a.plans[0].actions[0].execution_id;

    // Agent A' reclaims.
    let grant_b = h.leases.lease(agents[1], 10).await.unwrap();
    assert_eq!(grant_b.plans[0].actions[0].execution_id, exec_id);

    // A's late report is rejected.
    let err = h
        .leases
        .report(
            agents[0],
            ResultReport {
                execution_id: exec_id,
                ok: true,
                error_code: None,
                message: String::new(),
                started_at: Utc::now(),
                finished_at: Utc::now(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost(_)));
}

// ── Scenario 4: audit tamper detection ───────────────────────────────

#[tokio::test]
async fn tampering_with_stored_hash_is_detected() {
    let h = harness();
    let (tenant, site) = tenant_and_site(&h).await;

    // Three audited operations → three chained events.
    for n in 0..3 {
        h.enrollment
            .issue_token(tenant.id, site.id, Duration::seconds(60 + n))
            .await
            .unwrap();
    }

    let tampered = format!("{:0>64}", "beef");
    assert!(h.repo.tamper_audit_entry_hash(2, &tampered).await);

    let report = Verifier::new(Arc::clone(&h.repo) as Arc<dyn Repository>)
        .verify_chain()
        .await
        .unwrap();
    assert_eq!(
        report,
        VerifyReport {
            valid: false,
            total: 3,
            invalid: 2,
            first_valid: 1,
        }
    );
}

// ── Scenario 5: quota enforcement ────────────────────────────────────

#[tokio::test]
async fn site_quota_blocks_second_site_and_keeps_first() {
    let h = harness_with_limits(TenantLimits {
        max_sites: 1,
        ..TenantLimits::default()
    });
    let tenant = h
        .repo
        .create_tenant(NewTenant {
            slug: "acme".to_owned(),
            name: "Acme".to_owned(),
            primary_region: "eu-central".to_owned(),
            data_retention_days: 90,
        })
        .await
        .unwrap();

    // Site creation goes through the quota gate the way the edge does it:
    // check, then create.
    let quotas = QuotaService::new(
        Arc::clone(&h.repo) as Arc<dyn Repository>,
        Arc::new(RepoUsageProvider::new(
            Arc::clone(&h.repo) as Arc<dyn Repository>
        )),
        TenantLimits {
            max_sites: 1,
            ..TenantLimits::default()
        },
    );
    quotas
        .check(tenant.id, nkudo_core::quota::QuotaResource::Sites, 1)
        .await
        .unwrap();
    h.repo
        .create_site(tenant.id, "s1", None, None)
        .await
        .unwrap();

    let err = quotas
        .check(tenant.id, nkudo_core::quota::QuotaResource::Sites, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, QuotaError::Exceeded { limit: 1, .. }));
    assert_eq!(h.repo.list_sites(tenant.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn vm_create_quota_gates_plan_apply() {
    let h = harness_with_limits(TenantLimits {
        max_vms_per_agent: 1,
        ..TenantLimits::default()
    });
    let (tenant, site) = tenant_and_site(&h).await;
    let token = h
        .enrollment
        .issue_token(tenant.id, site.id, Duration::seconds(60))
        .await
        .unwrap();
    h.enrollment
        .enroll(&token.token, &csr(), "edge-01")
        .await
        .unwrap();

    // Two creates against a one-VM site capacity.
    let err = h
        .plans
        .apply(
            tenant.id,
            site.id,
            "ik-big",
            vec![
                PlanActionInput {
                    action_type: ActionType::MicroVmCreate,
                    params: json!({"name": "a"}),
                    timeout_sec: 60,
                },
                PlanActionInput {
                    action_type: ActionType::MicroVmCreate,
                    params: json!({"name": "b"}),
                    timeout_sec: 60,
                },
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::Quota(QuotaError::Exceeded { .. })));
}

// ── Scenario 6: certificate renewal ──────────────────────────────────

#[tokio::test]
async fn renewal_rotates_serial_and_refresh_token() {
    let h = harness();
    let (tenant, site) = tenant_and_site(&h).await;
    let token = h
        .enrollment
        .issue_token(tenant.id, site.id, Duration::seconds(60))
        .await
        .unwrap();
    let enrolled = h
        .enrollment
        .enroll(&token.token, &csr(), "edge-01")
        .await
        .unwrap();
    let agent = h.repo.agent_by_id(enrolled.agent_id).await.unwrap();
    let old_serial = agent.cert_serial.clone();

    let renewed = h
        .ca
        .renew(&agent, &csr(), &enrolled.refresh_token)
        .await
        .unwrap();
    assert_ne!(renewed.certificate.serial, old_serial);

    let rotated = h.repo.agent_by_id(enrolled.agent_id).await.unwrap();
    assert_eq!(rotated.cert_serial, renewed.certificate.serial);

    // The old serial stays in history; the current serial is the new one.
    let history = h
        .repo
        .list_certificate_history(enrolled.agent_id)
        .await
        .unwrap();
    assert!(history.iter().any(|c| c.serial == old_serial));
    assert!(history
        .iter()
        .any(|c| c.serial == renewed.certificate.serial));

    // Renewal with the superseded refresh token is rejected, and the
    // current certificate is untouched.
    let err = h
        .ca
        .renew(&rotated, &csr(), &enrolled.refresh_token)
        .await
        .unwrap_err();
    assert!(matches!(err, PkiError::RefreshMismatch));
    let unchanged = h.repo.agent_by_id(enrolled.agent_id).await.unwrap();
    assert_eq!(unchanged.cert_serial, renewed.certificate.serial);
}

// ── Cross-tenant isolation through the plan path ─────────────────────

#[tokio::test]
async fn foreign_tenant_cannot_target_site() {
    let h = harness();
    let (_tenant, site) = tenant_and_site(&h).await;
    let intruder = h
        .repo
        .create_tenant(NewTenant {
            slug: "intruder".to_owned(),
            name: "Intruder".to_owned(),
            primary_region: "us-east".to_owned(),
            data_retention_days: 30,
        })
        .await
        .unwrap();

    let err = h
        .plans
        .apply(
            intruder.id,
            site.id,
            "ik-x",
            vec![PlanActionInput {
                action_type: ActionType::CommandExecute,
                params: json!({"command": "id"}),
                timeout_sec: 30,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::Isolation(_)));
}

// ── Idempotency key replay survives a full tenant ────────────────────

#[tokio::test]
async fn replay_is_immune_to_quota_exhaustion() {
    let h = harness_with_limits(TenantLimits {
        max_concurrent_plans: 1,
        ..TenantLimits::default()
    });
    let (tenant, site) = tenant_and_site(&h).await;

    let actions = vec![PlanActionInput {
        action_type: ActionType::CommandExecute,
        params: json!({"command": "true"}),
        timeout_sec: 30,
    }];
    let first = h
        .plans
        .apply(tenant.id, site.id, "ik-1", actions.clone())
        .await
        .unwrap();

    // The tenant is now at its concurrent-plan cap; a fresh key fails...
    let err = h
        .plans
        .apply(tenant.id, site.id, "ik-2", actions.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, PlanError::Quota(_)));

    // ...but replaying the original key still succeeds.
    let replay = h
        .plans
        .apply(tenant.id, site.id, "ik-1", actions)
        .await
        .unwrap();
    assert_eq!(replay.plan_id, first.plan_id);
    assert!(replay.reused);
}
