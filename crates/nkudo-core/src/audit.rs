//! Hash-chained audit log.
//!
//! Every state-changing operation appends an event through [`ChainWriter`].
//! Events link by hash: `prev_hash` is the predecessor's `entry_hash` (the
//! genesis predecessor is 64 ASCII zeros) and `entry_hash` is the SHA-256 of
//! the event's canonical JSON. The writer is serialized behind a mutex —
//! parallel writers would race on the "last" read and break chain
//! continuity.
//!
//! Canonical JSON is the serde serialization of [`CanonicalEvent`]: field
//! declaration order is the wire order, absent optionals are omitted,
//! metadata passes through as raw bytes, and `occurred_at` is RFC 3339 with
//! nanoseconds in UTC. `chain_valid` is hashed at its write-time value
//! (`true`); verification flips only the stored flag, so re-verification is
//! stable.
//!
//! Audit failures never fail the originating mutation — they are logged and
//! surface through the background verifier.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, RwLock};
use uuid::Uuid;

use nkudo_store::models::{ActorType, AuditEvent, AuditEventBody};
use nkudo_store::Repository;

use crate::error::AuditError;

/// `prev_hash` of the first event in the chain: 64 ASCII zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Page size for chain verification walks.
const VERIFY_PAGE: usize = 256;

/// The canonical wire form of an audit event body. Field order here IS the
/// canonical order; do not reorder.
#[derive(Serialize)]
struct CanonicalEvent<'a> {
    tenant_id: &'a Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_id: Option<&'a Uuid>,
    actor_type: &'a ActorType,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor_user_id: Option<&'a Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor_agent_id: Option<&'a Uuid>,
    action: &'a str,
    resource_type: &'a str,
    resource_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_ip: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_json: Option<&'a serde_json::value::RawValue>,
    occurred_at: String,
    prev_hash: &'a str,
    chain_valid: bool,
}

/// Serialize an event body plus its `prev_hash` into canonical bytes.
fn canonical_bytes(body: &AuditEventBody, prev_hash: &str) -> Result<Vec<u8>, AuditError> {
    let metadata = match body.metadata_json.as_deref() {
        Some(raw) => Some(serde_json::value::RawValue::from_string(raw.to_owned()).map_err(
            |e| AuditError::Serialization {
                reason: format!("metadata is not valid JSON: {e}"),
            },
        )?),
        None => None,
    };
    let canonical = CanonicalEvent {
        tenant_id: &body.tenant_id,
        site_id: body.site_id.as_ref(),
        actor_type: &body.actor_type,
        actor_user_id: body.actor_user_id.as_ref(),
        actor_agent_id: body.actor_agent_id.as_ref(),
        action: &body.action,
        resource_type: &body.resource_type,
        resource_id: &body.resource_id,
        request_id: body.request_id.as_deref(),
        source_ip: body.source_ip.as_deref(),
        metadata_json: metadata.as_deref(),
        occurred_at: canonical_timestamp(body.occurred_at),
        prev_hash,
        chain_valid: true,
    };
    serde_json::to_vec(&canonical).map_err(|e| AuditError::Serialization {
        reason: e.to_string(),
    })
}

/// RFC 3339 with nanoseconds, always UTC (`Z` suffix).
fn canonical_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Compute an event's `entry_hash` for the given predecessor hash.
fn entry_hash(body: &AuditEventBody, prev_hash: &str) -> Result<String, AuditError> {
    let bytes = canonical_bytes(body, prev_hash)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Recompute a stored event's hash from its stored fields.
fn recompute_stored_hash(event: &AuditEvent) -> Result<String, AuditError> {
    let body = AuditEventBody {
        tenant_id: event.tenant_id,
        site_id: event.site_id,
        actor_type: event.actor_type,
        actor_user_id: event.actor_user_id,
        actor_agent_id: event.actor_agent_id,
        action: event.action.clone(),
        resource_type: event.resource_type.clone(),
        resource_id: event.resource_id.clone(),
        request_id: event.request_id.clone(),
        source_ip: event.source_ip.clone(),
        metadata_json: event.metadata_json.clone(),
        occurred_at: event.occurred_at,
    };
    entry_hash(&body, &event.prev_hash)
}

// ── Writer ───────────────────────────────────────────────────────────

/// Serialized audit writer. One instance per process; the internal mutex
/// makes the read-last/link/insert sequence atomic.
pub struct ChainWriter {
    repo: Arc<dyn Repository>,
    write_lock: Mutex<()>,
}

impl ChainWriter {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            write_lock: Mutex::new(()),
        }
    }

    /// Append one event to the chain and return its id.
    pub async fn append(&self, body: AuditEventBody) -> Result<i64, AuditError> {
        let _guard = self.write_lock.lock().await;
        let prev_hash = match self.repo.last_audit_event().await? {
            Some(last) => last.entry_hash,
            None => GENESIS_HASH.to_owned(),
        };
        let hash = entry_hash(&body, &prev_hash)?;
        let id = self.repo.write_audit_event(body, &prev_hash, &hash).await?;
        Ok(id)
    }

    /// Append, logging instead of failing: audit problems must never fail
    /// the originating mutation.
    pub async fn append_best_effort(&self, body: AuditEventBody) {
        let action = body.action.clone();
        if let Err(e) = self.append(body).await {
            tracing::error!(error = %e, action = %action, "audit append failed");
        }
    }
}

/// Convenience constructor for event bodies.
#[must_use]
pub fn event(
    tenant_id: Uuid,
    actor: Actor,
    action: &str,
    resource_type: &str,
    resource_id: &str,
) -> AuditEventBody {
    let (actor_type, actor_user_id, actor_agent_id) = match actor {
        Actor::User(id) => (ActorType::User, Some(id), None),
        Actor::Agent(id) => (ActorType::Agent, None, Some(id)),
        Actor::System => (ActorType::System, None, None),
    };
    AuditEventBody {
        tenant_id,
        site_id: None,
        actor_type,
        actor_user_id,
        actor_agent_id,
        action: action.to_owned(),
        resource_type: resource_type.to_owned(),
        resource_id: resource_id.to_owned(),
        request_id: None,
        source_ip: None,
        metadata_json: None,
        occurred_at: Utc::now(),
    }
}

/// Audit actor shorthand.
#[derive(Debug, Clone, Copy)]
pub enum Actor {
    User(Uuid),
    Agent(Uuid),
    System,
}

// ── Verifier ─────────────────────────────────────────────────────────

/// Result of one full-chain verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    /// True when every link and every hash checked out.
    pub valid: bool,
    /// Events examined.
    pub total: u64,
    /// Events flagged invalid this pass.
    pub invalid: u64,
    /// Count of the valid prefix: events before the first broken link.
    pub first_valid: u64,
}

/// Walks the chain in id order and flags broken events in place.
pub struct Verifier {
    repo: Arc<dyn Repository>,
}

impl Verifier {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    /// Verify the whole chain.
    ///
    /// For each event two checks run: the link (`prev_hash` equals the
    /// predecessor's stored `entry_hash`, genesis for the first) and the
    /// content (recomputed hash equals stored `entry_hash`). A tampered
    /// `entry_hash` therefore flags both the event itself and its successor.
    /// Mismatched events get `chain_valid = false`; content is never
    /// rewritten.
    pub async fn verify_chain(&self) -> Result<VerifyReport, AuditError> {
        let mut expected_prev = GENESIS_HASH.to_owned();
        let mut after_id = 0i64;
        let mut total = 0u64;
        let mut invalid = 0u64;
        let mut first_valid = 0u64;
        let mut prefix_intact = true;

        loop {
            let page = self.repo.audit_events_after(after_id, VERIFY_PAGE).await?;
            if page.is_empty() {
                break;
            }
            for ev in &page {
                total += 1;
                after_id = ev.id;

                let link_ok = ev.prev_hash == expected_prev;
                // Unserializable content (tampered metadata) is a content
                // mismatch, not a verification abort.
                let content_ok = recompute_stored_hash(ev)
                    .is_ok_and(|computed| computed == ev.entry_hash);
                let ok = link_ok && content_ok;

                if ok {
                    if prefix_intact {
                        first_valid += 1;
                    }
                    if !ev.chain_valid {
                        self.repo.set_audit_event_validity(ev.id, true).await?;
                    }
                } else {
                    prefix_intact = false;
                    invalid += 1;
                    if ev.chain_valid {
                        self.repo.set_audit_event_validity(ev.id, false).await?;
                    }
                    tracing::warn!(
                        event_id = ev.id,
                        link_ok,
                        content_ok,
                        "audit chain mismatch"
                    );
                }

                // Successors must link against what is stored, tampered or
                // not; a tampered hash breaks exactly the next link.
                expected_prev = ev.entry_hash.clone();
            }
        }

        Ok(VerifyReport {
            valid: invalid == 0,
            total,
            invalid,
            first_valid,
        })
    }
}

// ── Background verifier ──────────────────────────────────────────────

/// Periodic chain verification with an observable last result.
pub struct BackgroundVerifier {
    verifier: Verifier,
    last_report: Arc<RwLock<Option<VerifyReport>>>,
}

impl BackgroundVerifier {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            verifier: Verifier::new(repo),
            last_report: Arc::new(RwLock::new(None)),
        }
    }

    /// Handle for observing the most recent report.
    #[must_use]
    pub fn last_report(&self) -> Arc<RwLock<Option<VerifyReport>>> {
        Arc::clone(&self.last_report)
    }

    /// Run verification every `interval` until `shutdown` fires.
    pub async fn run(self, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(interval_secs = interval.as_secs(), "audit verifier started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.verifier.verify_chain().await {
                        Ok(report) => {
                            if !report.valid {
                                tracing::error!(
                                    total = report.total,
                                    invalid = report.invalid,
                                    first_valid = report.first_valid,
                                    "audit chain verification found invalid events"
                                );
                            }
                            *self.last_report.write().await = Some(report);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "audit chain verification failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("audit verifier shutting down");
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
    use nkudo_store::MemoryRepository;

    fn body(n: u32) -> AuditEventBody {
        let mut b = event(
            Uuid::new_v4(),
            Actor::System,
            "plan.apply",
            "plan",
            &format!("plan-{n}"),
        );
        b.metadata_json = Some(format!(r#"{{"seq":{n}}}"#));
        b
    }

    #[tokio::test]
    async fn chain_links_from_genesis() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = ChainWriter::new(Arc::clone(&repo) as Arc<dyn Repository>);
        writer.append(body(1)).await.unwrap();
        writer.append(body(2)).await.unwrap();

        let events = repo.audit_events_after(0, 10).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        assert_eq!(events[1].prev_hash, events[0].entry_hash);
        assert_eq!(events[0].entry_hash.len(), 64);
    }

    #[tokio::test]
    async fn intact_chain_verifies_clean() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = ChainWriter::new(Arc::clone(&repo) as Arc<dyn Repository>);
        for n in 0..5 {
            writer.append(body(n)).await.unwrap();
        }
        let report = Verifier::new(repo).verify_chain().await.unwrap();
        assert_eq!(
            report,
            VerifyReport {
                valid: true,
                total: 5,
                invalid: 0,
                first_valid: 5,
            }
        );
    }

    #[tokio::test]
    async fn tampered_entry_hash_flags_event_and_successor() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = ChainWriter::new(Arc::clone(&repo) as Arc<dyn Repository>);
        for n in 0..3 {
            writer.append(body(n)).await.unwrap();
        }
        // Flip the stored hash of event 2: its content check fails, and
        // event 3's link check fails because it references the real hash.
        let tampered = format!("{}{}", "f", &GENESIS_HASH[1..]);
        assert!(repo.tamper_audit_entry_hash(2, &tampered).await);

        let report = Verifier::new(Arc::clone(&repo) as Arc<dyn Repository>)
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

        let events = repo.audit_events_after(0, 10).await.unwrap();
        assert!(events[0].chain_valid);
        assert!(!events[1].chain_valid);
        assert!(!events[2].chain_valid);

        // Re-verification is stable: same counts, no flapping.
        let again = Verifier::new(repo).verify_chain().await.unwrap();
        assert_eq!(report, again);
    }

    #[tokio::test]
    async fn metadata_must_be_valid_json() {
        let repo = Arc::new(MemoryRepository::new());
        let writer = ChainWriter::new(repo);
        let mut b = body(1);
        b.metadata_json = Some("{not json".to_owned());
        let err = writer.append(b).await.unwrap_err();
        assert!(matches!(err, AuditError::Serialization { .. }));
    }

    #[test]
    fn canonical_field_order_is_fixed() {
        let mut b = event(
            Uuid::nil(),
            Actor::System,
            "site.create",
            "site",
            "site-1",
        );
        b.site_id = Some(Uuid::nil());
        b.metadata_json = Some(r#"{"k":"v"}"#.to_owned());
        let bytes = canonical_bytes(&b, GENESIS_HASH).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let tenant_pos = text.find("tenant_id").unwrap();
        let site_pos = text.find("site_id").unwrap();
        let action_pos = text.find(r#""action""#).unwrap();
        let meta_pos = text.find("metadata_json").unwrap();
        let prev_pos = text.find("prev_hash").unwrap();
        assert!(tenant_pos < site_pos);
        assert!(site_pos < action_pos);
        assert!(action_pos < meta_pos);
        assert!(meta_pos < prev_pos);
        // Raw metadata passes through byte-for-byte.
        assert!(text.contains(r#""metadata_json":{"k":"v"}"#));
        // No whitespace in the canonical form.
        assert!(!text.contains(": "));
    }
}
