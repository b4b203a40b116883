//! Agent enrollment.
//!
//! Tokens are one-shot: issuance stores only the SHA-256 hash, and
//! consumption + agent creation happen atomically in the store so a token
//! can never mint two agents. Enrollment is the only flow that creates an
//! agent identity; it ends with the agent's first client certificate.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use nkudo_store::models::{Agent, NewAgent};
use nkudo_store::Repository;

use crate::audit::{event, Actor, ChainWriter};
use crate::error::EnrollError;
use crate::pki::{CertificateAuthority, SubjectBinding};
use crate::secret::{
    generate_secret, hash_secret, ENROLLMENT_TOKEN_PREFIX, REFRESH_TOKEN_PREFIX,
};

/// A freshly issued enrollment token. The raw value is shown once.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything a newly enrolled agent needs to connect.
#[derive(Debug, Clone)]
pub struct EnrollmentResponse {
    pub agent_id: Uuid,
    pub client_certificate_pem: String,
    pub ca_certificate_pem: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Issues and consumes enrollment tokens.
pub struct EnrollmentService {
    repo: Arc<dyn Repository>,
    ca: Arc<CertificateAuthority>,
    audit: Arc<ChainWriter>,
}

impl EnrollmentService {
    #[must_use]
    pub fn new(
        repo: Arc<dyn Repository>,
        ca: Arc<CertificateAuthority>,
        audit: Arc<ChainWriter>,
    ) -> Self {
        Self { repo, ca, audit }
    }

    /// Issue a one-shot token for `(tenant, site)` with the given TTL.
    pub async fn issue_token(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        ttl: Duration,
    ) -> Result<IssuedToken, EnrollError> {
        let token = generate_secret(ENROLLMENT_TOKEN_PREFIX);
        let expires_at = Utc::now() + ttl;
        let row = self
            .repo
            .issue_enrollment_token(tenant_id, site_id, &hash_secret(&token), expires_at)
            .await?;

        let mut ev = event(
            tenant_id,
            Actor::System,
            "enrollment_token.issue",
            "enrollment_token",
            &row.id.to_string(),
        );
        ev.site_id = Some(site_id);
        self.audit.append_best_effort(ev).await;

        Ok(IssuedToken { token, expires_at })
    }

    /// Enroll an edge process: resolve the token's binding, sign the CSR
    /// against it, then consume the token and create the agent atomically.
    ///
    /// The CSR is signed before consumption so a malformed request burns no
    /// token; a signed-but-never-enrolled certificate is inert because its
    /// serial binds to no agent row. The consume itself re-checks
    /// consumed/expired under the row lock, so concurrent enrollments with
    /// the same token still race safely: exactly one wins.
    pub async fn enroll(
        &self,
        raw_token: &str,
        csr_pem: &str,
        hostname: &str,
    ) -> Result<EnrollmentResponse, EnrollError> {
        let token_hash = hash_secret(raw_token);
        let token = self.repo.enrollment_token_by_hash(&token_hash).await?;

        let agent_id = Uuid::new_v4();
        let issued = self.ca.sign_csr(
            csr_pem,
            SubjectBinding {
                tenant_id: token.tenant_id,
                site_id: token.site_id,
                agent_id,
            },
        )?;

        let refresh_token = generate_secret(REFRESH_TOKEN_PREFIX);
        let (grant, agent) = self
            .repo
            .enroll_agent(
                &token_hash,
                NewAgent {
                    id: agent_id,
                    hostname: hostname.to_owned(),
                    cert_serial: issued.serial.clone(),
                    cert_expires_at: issued.not_after,
                    refresh_token_hash: hash_secret(&refresh_token),
                },
            )
            .await?;

        let mut ev = event(
            grant.tenant_id,
            Actor::Agent(agent.id),
            "agent.enroll",
            "agent",
            &agent.id.to_string(),
        );
        ev.site_id = Some(grant.site_id);
        ev.metadata_json = Some(format!(r#"{{"hostname":{}}}"#, json_str(hostname)));
        self.audit.append_best_effort(ev).await;

        tracing::info!(agent_id = %agent.id, site_id = %grant.site_id, "agent enrolled");

        Ok(EnrollmentResponse {
            agent_id: agent.id,
            client_certificate_pem: issued.certificate_pem,
            ca_certificate_pem: self.ca.ca_certificate_pem().to_owned(),
            refresh_token,
            expires_at: issued.not_after,
        })
    }

    /// Load the agent behind a renewal or unenroll call.
    pub async fn agent(&self, agent_id: Uuid) -> Result<Agent, EnrollError> {
        Ok(self.repo.agent_by_id(agent_id).await?)
    }
}

fn json_str(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_owned())
}
