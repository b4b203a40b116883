//! nkudo control-plane server entry point.
//!
//! Bootstraps the store, certificate authority, and services, starts the
//! background workers (offline sweeper, audit verifier, log flusher), and
//! serves the HTTP edges with graceful shutdown. Workers share one watch
//! channel and are joined with a timeout after the listener stops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use nkudo_core::audit::{BackgroundVerifier, ChainWriter};
use nkudo_core::enroll::EnrollmentService;
use nkudo_core::heartbeat::{HeartbeatService, Sweeper};
use nkudo_core::isolation::IsolationGuard;
use nkudo_core::lease::LeaseService;
use nkudo_core::logsink::LogBuffer;
use nkudo_core::pki::CertificateAuthority;
use nkudo_core::plan::PlanService;
use nkudo_core::quota::{QuotaService, RepoUsageProvider};
use nkudo_store::models::TenantLimits;
use nkudo_store::{MemoryRepository, PgRepository, Repository};

use nkudo_server::config::{ServerConfig, StoreKind};
use nkudo_server::routes;
use nkudo_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(store = ?config.store, "nkudo control plane starting");

    let repo: Arc<dyn Repository> = match &config.store {
        StoreKind::Memory => {
            info!("using in-memory store (state will not persist)");
            Arc::new(MemoryRepository::new())
        }
        StoreKind::Postgres { url } => {
            info!("using PostgreSQL store");
            Arc::new(
                PgRepository::connect(url)
                    .await
                    .context("failed to connect to PostgreSQL")?,
            )
        }
    };

    let agent_cert_ttl = chrono::Duration::hours(config.agent_cert_ttl_hours);
    let ca = match (&config.ca_cert_path, &config.ca_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(cert_path)
                .with_context(|| format!("failed to read CA certificate at {cert_path}"))?;
            let key_pem = std::fs::read_to_string(key_path)
                .with_context(|| format!("failed to read CA key at {key_path}"))?;
            info!(path = %cert_path, "loaded CA from disk");
            CertificateAuthority::from_pem(Arc::clone(&repo), &cert_pem, &key_pem, agent_cert_ttl)
                .context("failed to load CA material")?
        }
        _ => {
            info!(cn = %config.ca_common_name, "generating self-signed CA (dev mode)");
            CertificateAuthority::generate(
                Arc::clone(&repo),
                &config.ca_common_name,
                agent_cert_ttl,
            )
            .context("failed to generate CA")?
        }
    };
    let ca = Arc::new(ca);

    let audit = Arc::new(ChainWriter::new(Arc::clone(&repo)));
    let isolation = Arc::new(IsolationGuard::new(Arc::clone(&repo)));
    let quotas = Arc::new(QuotaService::new(
        Arc::clone(&repo),
        Arc::new(RepoUsageProvider::new(Arc::clone(&repo))),
        TenantLimits::default(),
    ));
    let (log_buffer, log_flusher) = LogBuffer::new(config.log_queue_capacity);

    let verifier = BackgroundVerifier::new(Arc::clone(&repo));
    let audit_report = verifier.last_report();

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
            chrono::Duration::seconds(config.lease_ttl_secs),
        ),
        heartbeats: HeartbeatService::new(Arc::clone(&repo)),
        quotas,
        isolation,
        audit,
        logs: log_buffer,
        audit_report,
        admin_key: config.admin_key.clone(),
        max_token_ttl_secs: config.max_token_ttl_secs,
    });

    // Background workers, all cancelled through one channel.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = Sweeper::new(
        Arc::clone(&repo),
        Duration::from_secs(config.sweep_interval_secs),
        chrono::Duration::seconds(config.stale_threshold_secs),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let verifier_handle = tokio::spawn(verifier.run(
        Duration::from_secs(config.audit_verify_interval_secs),
        shutdown_rx.clone(),
    ));

    let flusher_handle = tokio::spawn(log_flusher.run(Arc::clone(&repo), shutdown_rx));

    let app = routes::router(Arc::clone(&state))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "nkudo control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in [sweeper_handle, verifier_handle, flusher_handle] {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }

    info!("nkudo control plane stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
