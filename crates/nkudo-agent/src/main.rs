//! nkudo edge agent.
//!
//! Enrolls with the control plane over a one-shot token, then runs the
//! lease/execute/report loop: heartbeat on an interval, poll for leased
//! plans with backoff, drive the micro-VM provider, ship logs, and renew
//! the client certificate before it expires. Local state (identity, VM
//! records, idempotency cache) lives in the secure state store, encrypted
//! when `NKUDO_STATE_KEY` is set.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod check;
mod client;
mod config;
mod executor;
mod logs;
mod provider;
mod state;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use client::{ControlPlaneClient, HostFacts, VmReport};
use config::AgentConfig;
use executor::PlanExecutor;
use logs::BufferedLogSink;
use provider::{MicroVmProvider, MockProvider};
use state::{AgentIdentity, SecureStateStore};

/// Longest poll backoff when the control plane has no work.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(60);
/// Log buffer capacity before drops.
const LOG_BUFFER_CAPACITY: usize = 4096;

/// nkudo edge agent — enroll, lease plans, drive micro-VMs.
#[derive(Parser)]
#[command(name = "nkudo-agent", version, about)]
struct Cli {
    /// Control-plane base URL.
    #[arg(long, env = "NKUDO_SERVER", default_value = "https://127.0.0.1:8440")]
    server: String,

    /// Directory for the secure state file.
    #[arg(long, env = "NKUDO_STATE_DIR", default_value = "/var/lib/nkudo")]
    state_dir: PathBuf,

    /// Directory for client key, certificate, and pinned CA.
    #[arg(long, env = "NKUDO_PKI_DIR", default_value = "/var/lib/nkudo/pki")]
    pki_dir: PathBuf,

    /// Directory for per-VM runtime artifacts (snapshots).
    #[arg(long, env = "NKUDO_RUNTIME_DIR", default_value = "/var/lib/nkudo/runtime")]
    runtime_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll this host with a one-shot token.
    Enroll {
        /// Enrollment token from the control plane.
        #[arg(long, env = "NKUDO_ENROLL_TOKEN")]
        token: String,
        /// Hostname to register (defaults to the OS hostname).
        #[arg(long)]
        hostname: Option<String>,
    },
    /// Run the heartbeat + lease/execute/report loop.
    Run {
        /// Seconds between heartbeats.
        #[arg(long, default_value_t = 30)]
        heartbeat_interval: u64,
        /// Base seconds between lease polls (backs off when idle).
        #[arg(long, default_value_t = 5)]
        poll_interval: u64,
        /// Executions to lease per poll.
        #[arg(long, default_value_t = 16)]
        lease_limit: usize,
        /// Renew the certificate when fewer than this many hours remain.
        #[arg(long, default_value_t = 24)]
        renew_window_hours: i64,
    },
    /// Run pre-flight checks; CSV output, exit 1 on any failure.
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AgentConfig {
        server_url: cli.server.clone(),
        state_dir: cli.state_dir.clone(),
        pki_dir: cli.pki_dir.clone(),
        runtime_dir: cli.runtime_dir.clone(),
        heartbeat_interval_secs: 30,
        poll_interval_secs: 5,
        lease_limit: 16,
        renew_window_hours: 24,
    };

    let outcome = match cli.command {
        Command::Enroll { token, hostname } => enroll(&config, &token, hostname).await,
        Command::Run {
            heartbeat_interval,
            poll_interval,
            lease_limit,
            renew_window_hours,
        } => {
            let config = AgentConfig {
                heartbeat_interval_secs: heartbeat_interval,
                poll_interval_secs: poll_interval,
                lease_limit,
                renew_window_hours,
                ..config
            };
            run(&config).await
        }
        Command::Check => check(&config).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            eprintln!("nkudo-agent: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// ── Enroll ───────────────────────────────────────────────────────────

async fn enroll(config: &AgentConfig, token: &str, hostname: Option<String>) -> Result<ExitCode> {
    let hostname = hostname.unwrap_or_else(os_hostname);
    let key = config::state_key_from_env()?;
    let store = SecureStateStore::open(&config.state_dir, key)?;

    if store.load().await.identity.is_some() {
        bail!("already enrolled — remove the state directory to re-enroll");
    }

    // Fresh keypair; the private key never leaves this host.
    let key_pair = rcgen::KeyPair::generate().context("key generation failed")?;
    let csr = rcgen::CertificateParams::new(Vec::<String>::new())
        .context("CSR params failed")?
        .serialize_request(&key_pair)
        .context("CSR build failed")?
        .pem()
        .context("CSR encode failed")?;

    let client = ControlPlaneClient::unauthenticated(&config.server_url)?;
    let response = client.enroll(token, &csr, &hostname).await?;

    std::fs::create_dir_all(&config.pki_dir)?;
    std::fs::write(config.pki_dir.join("client.key"), key_pair.serialize_pem())?;
    std::fs::write(
        config.pki_dir.join("client.crt"),
        &response.client_certificate_pem,
    )?;
    std::fs::write(config.pki_dir.join("ca.crt"), &response.ca_certificate_pem)?;

    store
        .update(|s| {
            s.identity = Some(AgentIdentity {
                agent_id: response.agent_id,
                server_url: config.server_url.clone(),
                refresh_token: response.refresh_token.clone(),
                cert_expires_at: response.expires_at,
            });
        })
        .await?;

    println!("enrolled as agent {}", response.agent_id);
    println!("certificate expires {}", response.expires_at);
    Ok(ExitCode::SUCCESS)
}

// ── Run loop ─────────────────────────────────────────────────────────

async fn run(config: &AgentConfig) -> Result<ExitCode> {
    let key = config::state_key_from_env()?;
    let store = Arc::new(SecureStateStore::open(&config.state_dir, key)?);
    let identity = store
        .load()
        .await
        .identity
        .context("not enrolled — run `nkudo-agent enroll` first")?;

    let client = ControlPlaneClient::with_identity(&config.server_url, &config.pki_dir)?;
    let provider: Arc<dyn MicroVmProvider> = Arc::new(MockProvider::new());
    let sink = Arc::new(BufferedLogSink::new(LOG_BUFFER_CAPACITY));
    let executor = PlanExecutor::new(
        Arc::clone(&provider),
        Arc::clone(&store),
        Arc::clone(&sink) as Arc<dyn logs::LogSink>,
        config.runtime_dir.join("snapshots"),
    );

    let agent_id = identity.agent_id;
    tracing::info!(%agent_id, server = %config.server_url, "agent running");

    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs));
    let base_poll = Duration::from_secs(config.poll_interval_secs.max(1));
    let mut poll_backoff = base_poll;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if let Err(e) = send_heartbeat(&client, agent_id, &store).await {
                    tracing::warn!(error = %e, "heartbeat failed");
                }
                if let Err(e) = maybe_renew(config, &store).await {
                    tracing::warn!(error = %e, "certificate renewal failed");
                }
            }
            () = tokio::time::sleep(poll_backoff) => {
                match poll_and_execute(&client, agent_id, config.lease_limit, &executor, &sink).await {
                    Ok(did_work) => {
                        // Idle polls back off exponentially; work resets.
                        poll_backoff = if did_work {
                            base_poll
                        } else {
                            (poll_backoff * 2).min(MAX_POLL_BACKOFF)
                        };
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "poll failed");
                        poll_backoff = (poll_backoff * 2).min(MAX_POLL_BACKOFF);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

async fn send_heartbeat(
    client: &ControlPlaneClient,
    agent_id: Uuid,
    store: &Arc<SecureStateStore>,
) -> Result<()> {
    let state = store.load().await;
    let vm_reports: Vec<VmReport> = state
        .microvms
        .values()
        .filter_map(|vm| {
            vm.vm_id.parse::<Uuid>().ok().map(|vm_id| VmReport {
                vm_id,
                status: vm.status.clone(),
            })
        })
        .collect();
    client
        .heartbeat(agent_id, &collect_host_facts(), &vm_reports)
        .await
}

async fn poll_and_execute(
    client: &ControlPlaneClient,
    agent_id: Uuid,
    lease_limit: usize,
    executor: &PlanExecutor,
    sink: &Arc<BufferedLogSink>,
) -> Result<bool> {
    let lease = client.lease_plans(agent_id, lease_limit).await?;
    if lease.plans.is_empty() {
        return Ok(false);
    }

    for plan in &lease.plans {
        let reports = executor.execute(plan).await;
        for report in reports {
            match client.report_result(agent_id, &report).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(
                        execution_id = %report.execution_id,
                        "lease lost, result dropped"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, "result report failed");
                }
            }
        }
    }

    // Ship whatever the executor logged; requeue on transport failure.
    let entries = sink.drain().await;
    if !entries.is_empty() {
        match client.ship_logs(agent_id, &entries).await {
            Ok(outcome) if outcome.dropped > 0 => {
                tracing::warn!(dropped = outcome.dropped, "server dropped log entries");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "log ship failed, requeueing");
                sink.requeue(entries).await;
            }
        }
    }

    Ok(true)
}

/// Rotate the client certificate when the renewal window opens. The old
/// certificate stays on disk until the control plane has committed the
/// rotation.
async fn maybe_renew(config: &AgentConfig, store: &Arc<SecureStateStore>) -> Result<()> {
    let Some(identity) = store.load().await.identity else {
        return Ok(());
    };
    let remaining = identity.cert_expires_at - chrono::Utc::now();
    if remaining > chrono::Duration::hours(config.renew_window_hours) {
        return Ok(());
    }

    tracing::info!(
        expires_at = %identity.cert_expires_at,
        "certificate inside renewal window, rotating"
    );
    let key_pair = rcgen::KeyPair::generate().context("key generation failed")?;
    let csr = rcgen::CertificateParams::new(Vec::<String>::new())
        .context("CSR params failed")?
        .serialize_request(&key_pair)
        .context("CSR build failed")?
        .pem()
        .context("CSR encode failed")?;

    let client = ControlPlaneClient::unauthenticated(&identity.server_url)?;
    let renewed = client
        .renew(identity.agent_id, &csr, &identity.refresh_token)
        .await?;

    std::fs::write(config.pki_dir.join("client.key"), key_pair.serialize_pem())?;
    std::fs::write(
        config.pki_dir.join("client.crt"),
        &renewed.client_certificate_pem,
    )?;
    store
        .update(|s| {
            if let Some(identity) = s.identity.as_mut() {
                identity.refresh_token = renewed.refresh_token.clone();
                identity.cert_expires_at = renewed.expires_at;
            }
        })
        .await?;
    tracing::info!(expires_at = %renewed.expires_at, "certificate renewed");
    Ok(())
}

// ── Check ────────────────────────────────────────────────────────────

async fn check(config: &AgentConfig) -> Result<ExitCode> {
    let results = check::run_checks(config).await;
    println!("check,ok,detail");
    let mut all_ok = true;
    for result in &results {
        println!("{}", result.csv());
        all_ok &= result.ok;
    }
    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

// ── Host facts ───────────────────────────────────────────────────────

fn collect_host_facts() -> HostFacts {
    HostFacts {
        cpu_cores: std::thread::available_parallelism()
            .map(|n| i32::try_from(n.get()).unwrap_or(i32::MAX))
            .unwrap_or(1),
        memory_mib: read_memory_mib().unwrap_or(0),
        arch: std::env::consts::ARCH.to_owned(),
        kernel: read_kernel_release().unwrap_or_else(|| "unknown".to_owned()),
        disks: Vec::new(),
    }
}

fn os_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown-host".to_owned())
}

#[cfg(target_os = "linux")]
fn read_memory_mib() -> Option<i64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kib: i64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_memory_mib() -> Option<i64> {
    None
}

#[cfg(target_os = "linux")]
fn read_kernel_release() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .ok()
        .map(|s| s.trim().to_owned())
}

#[cfg(not(target_os = "linux"))]
fn read_kernel_release() -> Option<String> {
    None
}
