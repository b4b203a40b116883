//! Certificate authority for agent identity.
//!
//! Holds the long-lived root CA and issues short-lived client certificates
//! against agent CSRs. Uses `rcgen` for pure-Rust certificate handling — no
//! OpenSSL dependency. The CSR's subject is never trusted: it is replaced
//! with the enrolled identity (tenant/site/agent) before signing.
//!
//! Revocation goes through the store; [`CertificateAuthority::is_revoked`]
//! keeps a read-through cache so the south-edge verifier stays off the hot
//! path of the database.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use nkudo_store::models::Agent;
use nkudo_store::Repository;

use crate::error::PkiError;
use crate::secret::{constant_time_eq, generate_secret, hash_secret, REFRESH_TOKEN_PREFIX};

/// The identifiers a signed certificate is clamped to.
#[derive(Debug, Clone, Copy)]
pub struct SubjectBinding {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub agent_id: Uuid,
}

/// An issued client certificate.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded leaf certificate.
    pub certificate_pem: String,
    /// Serial number (hex), also tracked in the agent row and CRL.
    pub serial: String,
    /// Expiry the control plane enforces (`now + agent_cert_ttl`).
    pub not_after: DateTime<Utc>,
}

/// Result of a successful certificate renewal.
#[derive(Debug, Clone)]
pub struct RenewedCertificate {
    pub certificate: IssuedCertificate,
    /// The rotated refresh token. Shown once; only its hash is stored.
    pub refresh_token: String,
}

/// The root CA plus issuance, renewal, and revocation.
pub struct CertificateAuthority {
    repo: Arc<dyn Repository>,
    key_pair: rcgen::KeyPair,
    issuer: rcgen::Certificate,
    ca_pem: String,
    agent_cert_ttl: Duration,
    /// Revoked serials seen so far. Read-through: a miss falls back to the
    /// store and populates the set.
    revoked: RwLock<HashSet<String>>,
}

impl CertificateAuthority {
    /// Generate a fresh self-signed root CA. Used at boot when no CA
    /// material is configured (dev mode).
    pub fn generate(
        repo: Arc<dyn Repository>,
        common_name: &str,
        agent_cert_ttl: Duration,
    ) -> Result<Self, PkiError> {
        let key_pair = rcgen::KeyPair::generate().map_err(|e| PkiError::CaUnavailable {
            reason: format!("key generation failed: {e}"),
        })?;
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).map_err(|e| {
            PkiError::CaUnavailable {
                reason: format!("failed to create CA params: {e}"),
            }
        })?;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, common_name);
        params.distinguished_name = dn;
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::CaUnavailable {
                reason: format!("self-signing failed: {e}"),
            })?;
        let ca_pem = issuer.pem();
        Ok(Self {
            repo,
            key_pair,
            issuer,
            ca_pem,
            agent_cert_ttl,
            revoked: RwLock::new(HashSet::new()),
        })
    }

    /// Load the CA from PEM material (production: file path or secret-store
    /// envelope, read by the caller).
    pub fn from_pem(
        repo: Arc<dyn Repository>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
        agent_cert_ttl: Duration,
    ) -> Result<Self, PkiError> {
        let key_pair =
            rcgen::KeyPair::from_pem(ca_key_pem).map_err(|e| PkiError::CaUnavailable {
                reason: format!("failed to parse CA key: {e}"),
            })?;
        let params = rcgen::CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(|e| {
            PkiError::CaUnavailable {
                reason: format!("failed to parse CA certificate: {e}"),
            }
        })?;
        let issuer = params
            .self_signed(&key_pair)
            .map_err(|e| PkiError::CaUnavailable {
                reason: format!("failed to reconstruct CA certificate: {e}"),
            })?;
        Ok(Self {
            repo,
            key_pair,
            issuer,
            ca_pem: ca_cert_pem.to_owned(),
            agent_cert_ttl,
            revoked: RwLock::new(HashSet::new()),
        })
    }

    /// The CA certificate agents pin for the mTLS channel.
    #[must_use]
    pub fn ca_certificate_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Validate a CSR and sign it with the subject clamped to `binding`.
    ///
    /// The serial comes from a collision-resistant source (UUID v4 hex) and
    /// expiry is `now + agent_cert_ttl`.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        binding: SubjectBinding,
    ) -> Result<IssuedCertificate, PkiError> {
        let mut csr = rcgen::CertificateSigningRequestParams::from_pem(csr_pem).map_err(|e| {
            PkiError::InvalidCsr {
                reason: format!("CSR parse failed: {e}"),
            }
        })?;

        let serial = Uuid::new_v4().as_simple().to_string();
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, binding.agent_id.to_string());
        dn.push(rcgen::DnType::OrganizationName, binding.tenant_id.to_string());
        dn.push(
            rcgen::DnType::OrganizationalUnitName,
            binding.site_id.to_string(),
        );
        csr.params.distinguished_name = dn;
        csr.params.serial_number = Some(serial.clone().into_bytes().into());

        let cert = csr
            .signed_by(&self.issuer, &self.key_pair)
            .map_err(|e| PkiError::Signing {
                reason: format!("certificate signing failed: {e}"),
            })?;

        Ok(IssuedCertificate {
            certificate_pem: cert.pem(),
            serial,
            not_after: Utc::now() + self.agent_cert_ttl,
        })
    }

    /// Renew an agent's certificate.
    ///
    /// The presented refresh token must hash to the agent's stored hash
    /// (constant-time compare). On success the store atomically records the
    /// new serial, expiry, issuance history, and the rotated refresh token —
    /// on any failure the old certificate stays valid (no partial rotation).
    pub async fn renew(
        &self,
        agent: &Agent,
        csr_pem: &str,
        presented_refresh_token: &str,
    ) -> Result<RenewedCertificate, PkiError> {
        let presented_hash = hash_secret(presented_refresh_token);
        if !constant_time_eq(&presented_hash, &agent.refresh_token_hash) {
            return Err(PkiError::RefreshMismatch);
        }

        let issued = self.sign_csr(
            csr_pem,
            SubjectBinding {
                tenant_id: agent.tenant_id,
                site_id: agent.site_id,
                agent_id: agent.id,
            },
        )?;

        let refresh_token = generate_secret(REFRESH_TOKEN_PREFIX);
        self.repo
            .rotate_agent_certificate(
                agent.id,
                &issued.serial,
                issued.not_after,
                &hash_secret(&refresh_token),
            )
            .await?;

        tracing::info!(
            agent_id = %agent.id,
            old_serial = %agent.cert_serial,
            new_serial = %issued.serial,
            "agent certificate renewed"
        );

        Ok(RenewedCertificate {
            certificate: issued,
            refresh_token,
        })
    }

    /// Revoke a serial. Subsequent south-edge handshakes presenting it are
    /// rejected before any handler runs.
    pub async fn revoke(
        &self,
        serial: &str,
        reason: &str,
        agent_id: Uuid,
    ) -> Result<(), PkiError> {
        self.repo.revoke_certificate(serial, reason, agent_id).await?;
        self.revoked.write().await.insert(serial.to_owned());
        tracing::info!(serial, reason, %agent_id, "certificate revoked");
        Ok(())
    }

    /// Whether a serial is on the revocation list. Cache hit short-circuits;
    /// a miss reads through the store and populates the cache on a positive
    /// answer (revocation is permanent, so positives never go stale).
    pub async fn is_revoked(&self, serial: &str) -> Result<bool, PkiError> {
        if self.revoked.read().await.contains(serial) {
            return Ok(true);
        }
        let revoked = self.repo.is_certificate_revoked(serial).await?;
        if revoked {
            self.revoked.write().await.insert(serial.to_owned());
        }
        Ok(revoked)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use nkudo_store::MemoryRepository;

    fn test_csr() -> String {
        // An agent-side CSR: fresh key, placeholder subject (the CA clamps it).
        let key = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        params.serialize_request(&key).unwrap().pem().unwrap()
    }

    fn ca() -> CertificateAuthority {
        CertificateAuthority::generate(
            Arc::new(MemoryRepository::new()),
            "nkudo test ca",
            Duration::days(7),
        )
        .unwrap()
    }

    #[test]
    fn sign_csr_produces_pem_and_unique_serials() {
        let ca = ca();
        let binding = SubjectBinding {
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let first = ca.sign_csr(&test_csr(), binding).unwrap();
        let second = ca.sign_csr(&test_csr(), binding).unwrap();
        assert!(first.certificate_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(first.serial, second.serial);
        assert!(first.not_after > Utc::now());
    }

    #[test]
    fn malformed_csr_is_rejected() {
        let ca = ca();
        let binding = SubjectBinding {
            tenant_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        };
        let err = ca.sign_csr("not a csr", binding).unwrap_err();
        assert!(matches!(err, PkiError::InvalidCsr { .. }));
    }

    #[tokio::test]
    async fn revocation_is_cached_and_read_through() {
        let repo = Arc::new(MemoryRepository::new());
        let ca = CertificateAuthority::generate(
            Arc::clone(&repo) as Arc<dyn Repository>,
            "nkudo test ca",
            Duration::days(7),
        )
        .unwrap();
        assert!(!ca.is_revoked("serial-x").await.unwrap());
        ca.revoke("serial-x", "compromised", Uuid::new_v4())
            .await
            .unwrap();
        assert!(ca.is_revoked("serial-x").await.unwrap());
        // Revocation written by another instance is still visible.
        repo.revoke_certificate("serial-y", "rotated", Uuid::new_v4())
            .await
            .unwrap();
        assert!(ca.is_revoked("serial-y").await.unwrap());
    }
}
