//! Durable store boundary for the nkudo control plane.
//!
//! This crate defines the [`Repository`] trait — the single boundary in front
//! of durable state. Every other component calls through `Arc<dyn Repository>`
//! and never touches the database directly. Multi-row invariants (atomic
//! enrollment-token consumption, heartbeat reconciliation, idempotent plan
//! apply, linearizable leasing) live behind single trait methods so each
//! implementation can enforce them transactionally.
//!
//! Two implementations are provided:
//!
//! - [`PgRepository`] — production, backed by PostgreSQL via sqlx
//! - [`MemoryRepository`] — in-memory, for tests and `NKUDO_STORE=memory`
//!
//! Cancellation follows the tokio model: dropping a call's future aborts it,
//! and sqlx rolls back any transaction that is dropped before commit.

mod error;
mod memory;
pub mod models;
mod postgres;

pub use error::StoreError;
pub use memory::MemoryRepository;
pub use postgres::PgRepository;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use models::{
    Agent, ApiKey, ApiKeyValidation, ApplyPlanInput, ApplyPlanResult, AuditEvent, AuditEventBody,
    CertificateRecord, CrlEntry, EnrollmentGrant, EnrollmentToken, Execution, ExecutionLogRow,
    HeartbeatInput, Host, LeasedPlan, LogEntryInput, MicroVm, NewAgent, NewTenant, Plan,
    ResultReport, Site, Tenant, TenantLimits,
};

/// The single boundary in front of the durable store.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`)
/// and must not retry internally — retry policy belongs to the caller.
#[async_trait::async_trait]
pub trait Repository: Send + Sync + 'static {
    // ── Tenants ──────────────────────────────────────────────────────

    /// Create a tenant. Slug uniqueness is enforced; violations are
    /// [`StoreError::Conflict`].
    async fn create_tenant(&self, input: NewTenant) -> Result<Tenant, StoreError>;

    /// List all tenants, newest first.
    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Get a tenant by id.
    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Tenant, StoreError>;

    // ── API keys ─────────────────────────────────────────────────────

    /// Store a new API key. Only the hash is persisted; the raw key is the
    /// caller's to return once.
    async fn create_api_key(
        &self,
        tenant_id: Uuid,
        name: &str,
        key_hash: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey, StoreError>;

    /// Look up an API key by hash. Revoked keys are [`StoreError::Unauthorized`],
    /// expired keys [`StoreError::Expired`], unknown hashes
    /// [`StoreError::Invalid`]. Successful lookups touch `last_used_at`,
    /// coalesced to one write per second per key.
    async fn validate_api_key(&self, key_hash: &str) -> Result<ApiKeyValidation, StoreError>;

    /// List a tenant's API keys, newest first.
    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError>;

    /// Revoke an API key. The row is kept (audit attribution); only
    /// `revoked_at` is set. Revoking an already-revoked key is idempotent.
    async fn revoke_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError>;

    /// Count non-revoked API keys for a tenant (quota usage).
    async fn count_api_keys(&self, tenant_id: Uuid) -> Result<i64, StoreError>;

    // ── Sites ────────────────────────────────────────────────────────

    /// Create a site under a tenant.
    async fn create_site(
        &self,
        tenant_id: Uuid,
        name: &str,
        external_key: Option<&str>,
        location_country_code: Option<&str>,
    ) -> Result<Site, StoreError>;

    /// List a tenant's sites, newest first.
    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError>;

    /// Get a site by id.
    async fn site_by_id(&self, site_id: Uuid) -> Result<Site, StoreError>;

    /// Ownership predicate used by the isolation layer.
    async fn site_belongs_to_tenant(
        &self,
        site_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Count sites for a tenant (quota usage).
    async fn count_sites(&self, tenant_id: Uuid) -> Result<i64, StoreError>;

    // ── Enrollment ───────────────────────────────────────────────────

    /// Insert an enrollment token (hash only).
    async fn issue_enrollment_token(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<EnrollmentToken, StoreError>;

    /// Look up an enrollment token by hash without consuming it. Used to
    /// resolve the `(tenant, site)` binding before the atomic consume.
    async fn enrollment_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<EnrollmentToken, StoreError>;

    /// Atomically consume an enrollment token and create the agent it
    /// grants. Check-not-consumed, check-not-expired, set `consumed_at`,
    /// and the agent insert happen under one transaction with a row lock —
    /// a second call with the same token always fails.
    ///
    /// # Errors
    ///
    /// [`StoreError::Invalid`] for an unknown hash,
    /// [`StoreError::Expired`] past `expires_at`,
    /// [`StoreError::AlreadyConsumed`] when `consumed_at` is already set.
    async fn enroll_agent(
        &self,
        token_hash: &str,
        agent: NewAgent,
    ) -> Result<(EnrollmentGrant, Agent), StoreError>;

    // ── Agents ───────────────────────────────────────────────────────

    /// Get an agent by id.
    async fn agent_by_id(&self, agent_id: Uuid) -> Result<Agent, StoreError>;

    /// Get an agent by its current certificate serial (south-edge auth).
    async fn agent_by_cert_serial(&self, serial: &str) -> Result<Agent, StoreError>;

    /// Mark an agent `UNENROLLED`. It keeps its rows for attribution but can
    /// no longer lease work.
    async fn unenroll_agent(&self, agent_id: Uuid) -> Result<(), StoreError>;

    /// Atomically rotate an agent's certificate: set the new serial and
    /// expiry, rotate the refresh-token hash, and record issuance history —
    /// all or nothing, so a failed renewal leaves the old certificate valid.
    async fn rotate_agent_certificate(
        &self,
        agent_id: Uuid,
        new_serial: &str,
        new_expires_at: DateTime<Utc>,
        new_refresh_token_hash: &str,
    ) -> Result<(), StoreError>;

    /// Count agents for a site (quota usage).
    async fn count_agents_for_site(&self, site_id: Uuid) -> Result<i64, StoreError>;

    // ── Heartbeat & sweep ────────────────────────────────────────────

    /// Ingest one heartbeat in a single transaction: upsert the host from
    /// facts, stamp agent/site heartbeat times, flip the site `CONNECTED`,
    /// mark the agent `ONLINE`, and reconcile reported VM statuses
    /// (monotonic: a report never drags a VM back into provisioning and
    /// never overrides `DELETED`).
    async fn ingest_heartbeat(&self, hb: HeartbeatInput) -> Result<(), StoreError>;

    /// Transition agents whose `last_heartbeat_at` predates `stale_before`
    /// to `OFFLINE`; sites left without an online agent become
    /// `DISCONNECTED`. Returns the number of agents swept.
    async fn sweep_offline_agents(&self, stale_before: DateTime<Utc>) -> Result<i64, StoreError>;

    // ── Hosts & VMs ──────────────────────────────────────────────────

    /// List hosts for a tenant, optionally narrowed to one site.
    async fn list_hosts(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Host>, StoreError>;

    /// List micro-VMs for a tenant, optionally narrowed to one site.
    async fn list_vms(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<MicroVm>, StoreError>;

    /// Count non-deleted VMs assigned to an agent (quota usage).
    async fn count_vms_for_agent(&self, agent_id: Uuid) -> Result<i64, StoreError>;

    // ── Plans & executions ───────────────────────────────────────────

    /// Idempotent plan apply. A matching `(tenant, idempotency_key)` with an
    /// identical action list returns the stored plan with `reused = true`
    /// and writes nothing; the same key with a differing body is
    /// [`StoreError::Conflict`]. A fresh key inserts the plan, its actions
    /// in order, and one `PENDING` execution per action, in one transaction.
    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanResult, StoreError>;

    /// Look up a plan by `(tenant, idempotency_key)`. Lets callers
    /// distinguish a replay from a fresh apply before running pre-flight
    /// checks that must not fail replays.
    async fn plan_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Plan>, StoreError>;

    /// Count plans with at least one non-terminal execution (quota usage).
    async fn count_open_plans(&self, tenant_id: Uuid) -> Result<i64, StoreError>;

    /// Hand out up to `limit` executions at the agent's site that are
    /// `PENDING` or hold an expired lease, ordered by
    /// `(plan.created_at, action.order, action.id)`. Selected rows are
    /// stamped `LEASED` for this agent with `lease_expires_at = now + ttl`
    /// in the same transaction, so at most one agent holds a live lease on
    /// any execution.
    async fn lease_pending_plans(
        &self,
        agent_id: Uuid,
        limit: usize,
        lease_ttl: chrono::Duration,
    ) -> Result<Vec<LeasedPlan>, StoreError>;

    /// Record an agent's terminal report for one execution. The reporting
    /// agent must hold an unexpired lease ([`StoreError::LeaseLost`]
    /// otherwise). Terminal transitions are final; a duplicate report with
    /// the same terminal state from the same agent is idempotent. Successful
    /// VM-mutating actions reconcile the micro-VM row in the same
    /// transaction.
    async fn report_plan_result(
        &self,
        agent_id: Uuid,
        report: ResultReport,
    ) -> Result<Execution, StoreError>;

    /// List executions for a tenant, optionally narrowed to one site,
    /// oldest first.
    async fn list_executions(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Execution>, StoreError>;

    /// Ownership predicate used by the isolation layer.
    async fn execution_belongs_to_tenant(
        &self,
        execution_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError>;

    // ── Execution logs ───────────────────────────────────────────────

    /// Append log rows in input order. Sequence numbers are assigned per
    /// execution by the store.
    async fn insert_execution_logs(&self, rows: &[LogEntryInput]) -> Result<(), StoreError>;

    /// List log rows for one execution, in sequence order. Tenant-scoped.
    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogRow>, StoreError>;

    // ── Audit chain ──────────────────────────────────────────────────

    /// The most recent audit event, if any. Used by the chain writer to
    /// link `prev_hash`.
    async fn last_audit_event(&self) -> Result<Option<AuditEvent>, StoreError>;

    /// Insert a chained audit event and return its monotonic id.
    async fn write_audit_event(
        &self,
        body: AuditEventBody,
        prev_hash: &str,
        entry_hash: &str,
    ) -> Result<i64, StoreError>;

    /// Flip the `chain_valid` flag on one event. The verifier's only
    /// mutation — event content is never rewritten.
    async fn set_audit_event_validity(&self, event_id: i64, valid: bool)
        -> Result<(), StoreError>;

    /// List audit events for a tenant, `id` ascending, up to `limit`.
    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError>;

    /// Page through the whole chain: events with `id > after_id`, ascending.
    async fn audit_events_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError>;

    // ── PKI ──────────────────────────────────────────────────────────

    /// Record an issued certificate in history.
    async fn record_certificate_issuance(
        &self,
        agent_id: Uuid,
        serial: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// List an agent's certificate history, newest first.
    async fn list_certificate_history(
        &self,
        agent_id: Uuid,
    ) -> Result<Vec<CertificateRecord>, StoreError>;

    /// Revoke a serial: insert the CRL entry and stamp the history row.
    /// Revoking an already-revoked serial is idempotent.
    async fn revoke_certificate(
        &self,
        serial: &str,
        reason: &str,
        agent_id: Uuid,
    ) -> Result<(), StoreError>;

    /// Whether a serial is on the revocation list.
    async fn is_certificate_revoked(&self, serial: &str) -> Result<bool, StoreError>;

    /// The full revocation list, newest first.
    async fn list_revoked_certificates(&self) -> Result<Vec<CrlEntry>, StoreError>;

    // ── Quotas ───────────────────────────────────────────────────────

    /// Per-tenant limit overrides, if any were set.
    async fn tenant_limits(&self, tenant_id: Uuid) -> Result<Option<TenantLimits>, StoreError>;

    /// Set (or replace) a tenant's limit overrides.
    async fn set_tenant_limits(
        &self,
        tenant_id: Uuid,
        limits: TenantLimits,
    ) -> Result<(), StoreError>;
}
