//! HTTP surface tests over the in-memory store: the admin, API-key, and
//! agent edges wired exactly as the binary wires them. The repository
//! handle is kept so the tests can read back what only travels inside
//! certificates (the client serial the mTLS terminator would forward).

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

use nkudo_core::audit::{BackgroundVerifier, ChainWriter};
use nkudo_core::enroll::EnrollmentService;
use nkudo_core::heartbeat::HeartbeatService;
use nkudo_core::isolation::IsolationGuard;
use nkudo_core::lease::LeaseService;
use nkudo_core::logsink::LogBuffer;
use nkudo_core::pki::CertificateAuthority;
use nkudo_core::plan::PlanService;
use nkudo_core::quota::{QuotaService, RepoUsageProvider};
use nkudo_server::middleware::CLIENT_SERIAL_HEADER;
use nkudo_server::routes;
use nkudo_server::state::AppState;
use nkudo_store::models::TenantLimits;
use nkudo_store::{MemoryRepository, Repository};

const ADMIN_KEY: &str = "test-admin-key";

fn app() -> (Router, Arc<MemoryRepository>) {
    let mem = Arc::new(MemoryRepository::new());
    let repo: Arc<dyn Repository> = Arc::clone(&mem) as Arc<dyn Repository>;
    let ca = Arc::new(
        CertificateAuthority::generate(Arc::clone(&repo), "test ca", chrono::Duration::days(7))
            .unwrap(),
    );
    let audit = Arc::new(ChainWriter::new(Arc::clone(&repo)));
    let isolation = Arc::new(IsolationGuard::new(Arc::clone(&repo)));
    let quotas = Arc::new(QuotaService::new(
        Arc::clone(&repo),
        Arc::new(RepoUsageProvider::new(Arc::clone(&repo))),
        TenantLimits::default(),
    ));
    let (logs, flusher) = LogBuffer::new(64);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    std::mem::forget(shutdown_tx);
    tokio::spawn(flusher.run(Arc::clone(&repo), shutdown_rx));
    let verifier = BackgroundVerifier::new(Arc::clone(&repo));

    let state = Arc::new(AppState {
        repo: Arc::clone(&repo),
        ca: Arc::clone(&ca),
        enrollment: EnrollmentService::new(
            Arc::clone(&repo),
            Arc::clone(&ca),
            Arc::clone(&audit),
        ),
        plans: PlanService::new(
            Arc::clone(&repo),
            Arc::clone(&isolation),
            Arc::clone(&quotas),
            Arc::clone(&audit),
        ),
        leases: LeaseService::new(
            Arc::clone(&repo),
            Arc::clone(&audit),
            chrono::Duration::seconds(60),
        ),
        heartbeats: HeartbeatService::new(Arc::clone(&repo)),
        quotas,
        isolation,
        audit,
        logs,
        audit_report: verifier.last_report(),
        admin_key: Some(ADMIN_KEY.to_owned()),
        max_token_ttl_secs: 3600,
    });
    (routes::router(state), mem)
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, auth: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_with(uri: &str, auth: Option<&str>, serial: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = auth {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    if let Some(serial) = serial {
        builder = builder.header(CLIENT_SERIAL_HEADER, serial);
    }
    builder.body(Body::empty()).unwrap()
}

fn with_serial(mut req: Request<Body>, serial: &str) -> Request<Body> {
    req.headers_mut()
        .insert(CLIENT_SERIAL_HEADER, serial.parse().unwrap());
    req
}

fn csr() -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.serialize_request(&key).unwrap().pem().unwrap()
}

/// Walk the whole surface: tenant → key → site → token → enroll →
/// heartbeat → plan → lease → result → logs → listings.
#[tokio::test]
async fn full_lifecycle_over_http() {
    let (app, repo) = app();

    // Admin: tenant + API key.
    let (status, tenant) = call(
        &app,
        post_json(
            "/tenants",
            Some(ADMIN_KEY),
            json!({"slug": "acme", "name": "Acme"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let tenant_id = tenant["id"].as_str().unwrap().to_owned();

    let (status, key) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_id}/api-keys"),
            Some(ADMIN_KEY),
            json!({"name": "ci"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let api_key = key["api_key"].as_str().unwrap().to_owned();
    assert!(api_key.starts_with("nk_"));

    // API key: site + enrollment token.
    let (status, site) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_id}/sites"),
            Some(&api_key),
            json!({"name": "factory-1", "location_country_code": "DE"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let site_id = site["id"].as_str().unwrap().to_owned();

    let (status, token) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_id}/enrollment-tokens"),
            Some(&api_key),
            json!({"site_id": site_id, "expires_in_seconds": 60}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let raw_token = token["token"].as_str().unwrap().to_owned();

    // South: enroll.
    let (status, enrolled) = call(
        &app,
        post_json(
            "/enroll",
            None,
            json!({"token": raw_token, "csr_pem": csr(), "hostname": "edge-01"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let agent_id: Uuid = enrolled["agent_id"].as_str().unwrap().parse().unwrap();
    assert!(enrolled["client_certificate_pem"]
        .as_str()
        .unwrap()
        .contains("BEGIN CERTIFICATE"));

    // Token is one-shot.
    let (status, _) = call(
        &app,
        post_json(
            "/enroll",
            None,
            json!({"token": raw_token, "csr_pem": csr(), "hostname": "edge-02"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::GONE);

    // The serial travels inside the client certificate; the terminator
    // forwards it as a header. Read it back from the agent row.
    let serial = repo.agent_by_id(agent_id).await.unwrap().cert_serial;

    // Without the forwarded serial the south edge rejects.
    let (status, _) = call(
        &app,
        post_json(
            &format!("/agents/{agent_id}/heartbeat"),
            None,
            json!({"host_facts": {"cpu_cores": 4, "memory_mib": 8192, "arch": "x86_64", "kernel": "6.8.0"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // With it, the heartbeat lands.
    let (status, _) = call(
        &app,
        with_serial(
            post_json(
                &format!("/agents/{agent_id}/heartbeat"),
                None,
                json!({"host_facts": {"cpu_cores": 4, "memory_mib": 8192, "arch": "x86_64", "kernel": "6.8.0"}}),
            ),
            &serial,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Plan apply, twice (idempotent).
    let plan_body = json!({
        "idempotency_key": "ik-1",
        "actions": [
            {"type": "MicroVMCreate", "params": {"name": "web", "vcpu": 2, "mem_mib": 512}, "timeout_sec": 120}
        ]
    });
    let (status, first) = call(
        &app,
        post_json(
            &format!("/sites/{site_id}/plans"),
            Some(&api_key),
            plan_body.clone(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, second) = call(
        &app,
        post_json(&format!("/sites/{site_id}/plans"), Some(&api_key), plan_body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["plan_id"], second["plan_id"]);
    assert_eq!(second["executions"].as_array().unwrap().len(), 1);

    // Lease.
    let (status, leased) = call(
        &app,
        get_with(
            &format!("/agents/{agent_id}/plans?limit=8"),
            None,
            Some(&serial),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let execution_id = leased["plans"][0]["actions"][0]["execution_id"]
        .as_str()
        .unwrap()
        .to_owned();

    // Report.
    let (status, _) = call(
        &app,
        with_serial(
            post_json(
                &format!("/agents/{agent_id}/results"),
                None,
                json!({
                    "execution_id": execution_id,
                    "ok": true,
                    "message": "created",
                    "started_at": "2026-08-01T10:00:00Z",
                    "finished_at": "2026-08-01T10:00:03Z"
                }),
            ),
            &serial,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Logs.
    let (status, outcome) = call(
        &app,
        with_serial(
            post_json(
                &format!("/agents/{agent_id}/logs"),
                None,
                json!({"entries": [
                    {"execution_id": execution_id, "level": "info", "message": "boot", "at": "2026-08-01T10:00:01Z"}
                ]}),
            ),
            &serial,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["accepted"], 1);
    assert_eq!(outcome["dropped"], 0);

    // The VM materialized, tenant-scoped.
    let (status, vms) = call(
        &app,
        get_with(&format!("/sites/{site_id}/vms"), Some(&api_key), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(vms["vms"].as_array().unwrap().len(), 1);
    assert_eq!(vms["vms"][0]["status"], "RUNNING");

    // Audit trail accumulated, id ascending.
    let (status, audit) = call(
        &app,
        get_with(
            &format!("/tenants/{tenant_id}/audit-events?limit=50"),
            Some(&api_key),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let events = audit["events"].as_array().unwrap();
    assert!(events.len() >= 4);
    let actions: Vec<&str> = events
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"agent.enroll"));
    assert!(actions.contains(&"plan.apply"));
    assert!(actions.contains(&"plan.action.result"));
}

#[tokio::test]
async fn cross_tenant_listing_is_forbidden() {
    let (app, _repo) = app();

    // Tenant A with a site.
    let (_, tenant_a) = call(
        &app,
        post_json("/tenants", Some(ADMIN_KEY), json!({"slug": "a", "name": "A"})),
    )
    .await;
    let tenant_a_id = tenant_a["id"].as_str().unwrap();
    let (_, key_a) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_a_id}/api-keys"),
            Some(ADMIN_KEY),
            json!({"name": "a"}),
        ),
    )
    .await;
    let api_key_a = key_a["api_key"].as_str().unwrap().to_owned();
    let (_, site_a) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_a_id}/sites"),
            Some(&api_key_a),
            json!({"name": "site-a"}),
        ),
    )
    .await;
    let site_a_id = site_a["id"].as_str().unwrap().to_owned();

    // Tenant B's key cannot see tenant A's site.
    let (_, tenant_b) = call(
        &app,
        post_json("/tenants", Some(ADMIN_KEY), json!({"slug": "b", "name": "B"})),
    )
    .await;
    let tenant_b_id = tenant_b["id"].as_str().unwrap();
    let (_, key_b) = call(
        &app,
        post_json(
            &format!("/tenants/{tenant_b_id}/api-keys"),
            Some(ADMIN_KEY),
            json!({"name": "b"}),
        ),
    )
    .await;
    let api_key_b = key_b["api_key"].as_str().unwrap().to_owned();

    let (status, _) = call(
        &app,
        get_with(&format!("/sites/{site_a_id}/vms"), Some(&api_key_b), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_routes_reject_bad_key() {
    let (app, _repo) = app();
    let (status, _) = call(
        &app,
        post_json(
            "/tenants",
            Some("wrong-key"),
            json!({"slug": "x", "name": "X"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &app,
        post_json("/tenants", None, json!({"slug": "x", "name": "X"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn healthz_is_public() {
    let (app, _repo) = app();
    let req = Request::builder()
        .method("GET")
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
