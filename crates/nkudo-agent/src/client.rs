//! Control-plane HTTP client.
//!
//! Standalone wire client — the agent has no internal crate dependencies
//! and talks exclusively via the REST API. The mTLS identity is the PEM
//! pair enrollment wrote to the PKI directory; the CA certificate is
//! pinned.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::logs::LogEntry;

// ── Wire types ───────────────────────────────────────────────────────

/// Action kinds as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "MicroVMCreate")]
    Create,
    #[serde(rename = "MicroVMStart")]
    Start,
    #[serde(rename = "MicroVMStop")]
    Stop,
    #[serde(rename = "MicroVMDelete")]
    Delete,
    #[serde(rename = "MicroVMPause")]
    Pause,
    #[serde(rename = "MicroVMResume")]
    Resume,
    #[serde(rename = "MicroVMSnapshot")]
    Snapshot,
    #[serde(rename = "CommandExecute")]
    Command,
}

/// One leased action.
#[derive(Debug, Clone, Deserialize)]
pub struct LeasedAction {
    pub execution_id: Uuid,
    pub action_id: Uuid,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub params: serde_json::Value,
    pub timeout_sec: i32,
}

/// One leased plan: actions in plan order.
#[derive(Debug, Clone, Deserialize)]
pub struct LeasedPlan {
    pub plan_id: Uuid,
    pub actions: Vec<LeasedAction>,
}

#[derive(Debug, Deserialize)]
pub struct LeaseResponse {
    pub plans: Vec<LeasedPlan>,
    #[allow(dead_code, reason = "part of the wire contract, read by operators")]
    pub lease_expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ResultReport {
    pub execution_id: Uuid,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct EnrollResponse {
    pub agent_id: Uuid,
    pub client_certificate_pem: String,
    pub ca_certificate_pem: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct RenewResponse {
    pub client_certificate_pem: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogIngestOutcome {
    pub accepted: u64,
    pub dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct HostFacts {
    pub cpu_cores: i32,
    pub memory_mib: i64,
    pub arch: String,
    pub kernel: String,
    pub disks: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct VmReport {
    pub vm_id: Uuid,
    pub status: String,
}

// ── Client ───────────────────────────────────────────────────────────

/// HTTP client for the control plane.
pub struct ControlPlaneClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlPlaneClient {
    /// Client without a client certificate (enrollment, renewal).
    pub fn unauthenticated(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// Client with the enrolled mTLS identity from the PKI directory
    /// (`client.key`, `client.crt`, `ca.crt`).
    pub fn with_identity(base_url: &str, pki_dir: &Path) -> Result<Self> {
        let key = std::fs::read(pki_dir.join("client.key"))
            .context("failed to read client.key — is the agent enrolled?")?;
        let cert = std::fs::read(pki_dir.join("client.crt"))
            .context("failed to read client.crt — is the agent enrolled?")?;
        let ca = std::fs::read(pki_dir.join("ca.crt")).context("failed to read ca.crt")?;

        let mut identity_pem = Vec::with_capacity(key.len() + cert.len());
        identity_pem.extend_from_slice(&key);
        identity_pem.extend_from_slice(&cert);

        let http = reqwest::Client::builder()
            .identity(
                reqwest::Identity::from_pem(&identity_pem)
                    .context("failed to load client identity")?,
            )
            .add_root_certificate(
                reqwest::Certificate::from_pem(&ca).context("failed to load CA certificate")?,
            )
            .build()
            .context("failed to build mTLS client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    /// `POST /enroll`
    pub async fn enroll(
        &self,
        token: &str,
        csr_pem: &str,
        hostname: &str,
    ) -> Result<EnrollResponse> {
        let response = self
            .http
            .post(format!("{}/enroll", self.base_url))
            .json(&serde_json::json!({
                "token": token,
                "csr_pem": csr_pem,
                "hostname": hostname,
            }))
            .send()
            .await
            .context("enroll request failed")?;
        read_json(response).await
    }

    /// `POST /agents/{id}/renew`
    pub async fn renew(
        &self,
        agent_id: Uuid,
        csr_pem: &str,
        refresh_token: &str,
    ) -> Result<RenewResponse> {
        let response = self
            .http
            .post(format!("{}/agents/{agent_id}/renew", self.base_url))
            .json(&serde_json::json!({
                "csr_pem": csr_pem,
                "refresh_token": refresh_token,
            }))
            .send()
            .await
            .context("renew request failed")?;
        read_json(response).await
    }

    /// `POST /agents/{id}/heartbeat`
    pub async fn heartbeat(
        &self,
        agent_id: Uuid,
        facts: &HostFacts,
        vm_reports: &[VmReport],
    ) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/agents/{agent_id}/heartbeat", self.base_url))
            .json(&serde_json::json!({
                "host_facts": facts,
                "vm_reports": vm_reports,
            }))
            .send()
            .await
            .context("heartbeat request failed")?;
        expect_success(response).await
    }

    /// `GET /agents/{id}/plans?limit=N`
    pub async fn lease_plans(&self, agent_id: Uuid, limit: usize) -> Result<LeaseResponse> {
        let response = self
            .http
            .get(format!(
                "{}/agents/{agent_id}/plans?limit={limit}",
                self.base_url
            ))
            .send()
            .await
            .context("lease request failed")?;
        read_json(response).await
    }

    /// `POST /agents/{id}/results`. Returns `false` when the lease was
    /// lost (409) — the caller drops the result and moves on.
    pub async fn report_result(&self, agent_id: Uuid, report: &ResultReport) -> Result<bool> {
        let response = self
            .http
            .post(format!("{}/agents/{agent_id}/results", self.base_url))
            .json(report)
            .send()
            .await
            .context("result report failed")?;
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(false);
        }
        expect_success(response).await?;
        Ok(true)
    }

    /// `POST /agents/{id}/logs`
    pub async fn ship_logs(
        &self,
        agent_id: Uuid,
        entries: &[LogEntry],
    ) -> Result<LogIngestOutcome> {
        let response = self
            .http
            .post(format!("{}/agents/{agent_id}/logs", self.base_url))
            .json(&serde_json::json!({ "entries": entries }))
            .send()
            .await
            .context("log ship failed")?;
        read_json(response).await
    }

    /// `GET /healthz` — used by the pre-flight check.
    pub async fn healthz(&self) -> Result<()> {
        let response = self
            .http
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
            .context("healthz request failed")?;
        expect_success(response).await
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("server returned {status}: {body}");
    }
    response.json().await.context("failed to decode response")
}

async fn expect_success(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("server returned {status}: {body}");
    }
    Ok(())
}
