//! Domain model for the nkudo control plane.
//!
//! Row types for tenants, sites, API keys, enrollment tokens, agents, hosts,
//! micro-VMs, plans, executions, logs, audit events, and certificate history.
//! All IDs are UUIDs, all timestamps are UTC. Secret material is stored only
//! as SHA-256 hashes and never serialized back out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Tenants ──────────────────────────────────────────────────────────

/// A tenant — the root of ownership for every other row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub primary_region: String,
    pub data_retention_days: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTenant {
    pub slug: String,
    pub name: String,
    #[serde(default = "default_region")]
    pub primary_region: String,
    #[serde(default = "default_retention_days")]
    pub data_retention_days: i32,
}

fn default_region() -> String {
    "eu-central".to_owned()
}

const fn default_retention_days() -> i32 {
    90
}

// ── API keys ─────────────────────────────────────────────────────────

/// A tenant-scoped API key. The raw key is returned once at creation;
/// only its SHA-256 hash is stored.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ApiKey {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    #[serde(skip)]
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Result of a successful API-key lookup.
#[derive(Debug, Clone, Copy)]
pub struct ApiKeyValidation {
    pub tenant_id: Uuid,
    pub key_id: Uuid,
}

// ── Sites ────────────────────────────────────────────────────────────

/// Connectivity of a site, derived from its agents' heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectivityState {
    Pending,
    Connected,
    Disconnected,
    Error,
}

/// A site groups the agents at one physical location.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Site {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub external_key: Option<String>,
    pub location_country_code: Option<String>,
    pub connectivity_state: ConnectivityState,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ── Enrollment tokens ────────────────────────────────────────────────

/// A one-shot enrollment token bound to `(tenant, site)`. Consumption is
/// atomic with agent creation; `consumed_at` transitions exactly once.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EnrollmentToken {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    #[serde(skip)]
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub consumed_by_agent_id: Option<Uuid>,
}

/// What a consumed enrollment token grants: the identity the new agent binds to.
#[derive(Debug, Clone, Copy)]
pub struct EnrollmentGrant {
    pub token_id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
}

// ── Agents ───────────────────────────────────────────────────────────

/// Lifecycle status of an edge agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    Enrolled,
    Online,
    Offline,
    Unenrolled,
}

/// The identity of one edge process, bound to a client certificate.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub hostname: String,
    pub cert_serial: String,
    pub cert_expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub refresh_token_hash: String,
    pub enrolled_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub status: AgentStatus,
}

/// Input for creating an agent during enrollment. The caller mints the id
/// so the certificate subject can bind to it before the row exists.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub id: Uuid,
    pub hostname: String,
    pub cert_serial: String,
    pub cert_expires_at: DateTime<Utc>,
    pub refresh_token_hash: String,
}

// ── Hosts ────────────────────────────────────────────────────────────

/// A block device reported by an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskFact {
    pub device: String,
    pub size_gib: i64,
}

/// Host facts reported in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    pub cpu_cores: i32,
    pub memory_mib: i64,
    pub arch: String,
    pub kernel: String,
    #[serde(default)]
    pub disks: Vec<DiskFact>,
}

/// Durable host record, upserted by `agent_id` from heartbeat facts.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Host {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub agent_id: Uuid,
    pub cpu_cores: i32,
    pub memory_mib: i64,
    pub arch: String,
    pub kernel: String,
    pub disks: sqlx::types::Json<Vec<DiskFact>>,
}

// ── Micro-VMs ────────────────────────────────────────────────────────

/// Lifecycle status of a micro-VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum VmStatus {
    Pending,
    Creating,
    Running,
    Paused,
    Stopped,
    Failed,
    Deleted,
}

impl VmStatus {
    /// Deleted is the only terminal state; nothing overrides it.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Provisioning rank used for monotonic heartbeat reconciliation:
    /// once a VM has left the provisioning phase, a stale report may not
    /// drag it back into `Pending`/`Creating`.
    #[must_use]
    pub const fn provisioning_rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Creating => 1,
            Self::Running | Self::Paused | Self::Stopped | Self::Failed => 2,
            Self::Deleted => 3,
        }
    }
}

/// Reconcile a heartbeat-reported status against the stored one.
///
/// Reports are ground truth for the running/paused/stopped oscillation, but
/// may not drag a VM back into the provisioning phase and never override
/// `DELETED`.
#[must_use]
pub fn reconcile_vm_status(current: VmStatus, reported: VmStatus) -> VmStatus {
    if current.is_terminal() {
        return current;
    }
    if reported.provisioning_rank() < current.provisioning_rank() {
        return current;
    }
    reported
}

/// The identifying fields a VM-mutating action carries in its opaque
/// `params` blob. Anything else in the blob is provider business.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmActionParams {
    pub vm_id: Option<Uuid>,
    pub name: Option<String>,
    pub vcpu: Option<i32>,
    pub mem_mib: Option<i64>,
}

impl VmActionParams {
    /// Best-effort parse; a malformed blob yields the empty params.
    #[must_use]
    pub fn from_value(params: &serde_json::Value) -> Self {
        serde_json::from_value(params.clone()).unwrap_or_default()
    }
}

/// A micro-VM, driven by plan executions and heartbeat reports.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MicroVm {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub name: String,
    pub status: VmStatus,
    pub vcpu: i32,
    pub mem_mib: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-VM status observed by an agent, carried in a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmReport {
    pub vm_id: Uuid,
    pub status: VmStatus,
}

/// A full heartbeat payload as handed to the repository.
#[derive(Debug, Clone)]
pub struct HeartbeatInput {
    pub agent_id: Uuid,
    pub facts: HostFacts,
    pub vm_reports: Vec<VmReport>,
}

// ── Plans ────────────────────────────────────────────────────────────

/// The kind of work one plan action asks an agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
pub enum ActionType {
    #[serde(rename = "MicroVMCreate")]
    #[sqlx(rename = "MicroVMCreate")]
    MicroVmCreate,
    #[serde(rename = "MicroVMStart")]
    #[sqlx(rename = "MicroVMStart")]
    MicroVmStart,
    #[serde(rename = "MicroVMStop")]
    #[sqlx(rename = "MicroVMStop")]
    MicroVmStop,
    #[serde(rename = "MicroVMDelete")]
    #[sqlx(rename = "MicroVMDelete")]
    MicroVmDelete,
    #[serde(rename = "MicroVMPause")]
    #[sqlx(rename = "MicroVMPause")]
    MicroVmPause,
    #[serde(rename = "MicroVMResume")]
    #[sqlx(rename = "MicroVMResume")]
    MicroVmResume,
    #[serde(rename = "MicroVMSnapshot")]
    #[sqlx(rename = "MicroVMSnapshot")]
    MicroVmSnapshot,
    #[serde(rename = "CommandExecute")]
    #[sqlx(rename = "CommandExecute")]
    CommandExecute,
}

impl ActionType {
    /// Whether a successful execution of this action mutates a micro-VM row.
    #[must_use]
    pub const fn mutates_vm(self) -> bool {
        !matches!(self, Self::CommandExecute)
    }

    /// The VM status a *successful* execution of this action establishes.
    /// `None` means the action leaves the status untouched (snapshot) or
    /// does not target a VM at all.
    #[must_use]
    pub const fn vm_status_on_success(self) -> Option<VmStatus> {
        match self {
            Self::MicroVmCreate | Self::MicroVmStart | Self::MicroVmResume => {
                Some(VmStatus::Running)
            }
            Self::MicroVmStop => Some(VmStatus::Stopped),
            Self::MicroVmDelete => Some(VmStatus::Deleted),
            Self::MicroVmPause => Some(VmStatus::Paused),
            Self::MicroVmSnapshot | Self::CommandExecute => None,
        }
    }
}

/// A declarative plan: an ordered batch of actions targeting one site.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// One action within a plan. Order within the plan is significant.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanAction {
    pub id: Uuid,
    pub plan_id: Uuid,
    #[sqlx(rename = "action_order")]
    pub order: i32,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub params: serde_json::Value,
    pub timeout_sec: i32,
}

/// Action input as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanActionInput {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: i32,
}

const fn default_timeout_sec() -> i32 {
    30
}

/// Input for `apply_plan`.
#[derive(Debug, Clone)]
pub struct ApplyPlanInput {
    pub tenant_id: Uuid,
    pub site_id: Uuid,
    pub idempotency_key: String,
    pub actions: Vec<PlanActionInput>,
}

/// Result of `apply_plan`: the (possibly pre-existing) plan and its executions.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyPlanResult {
    pub plan_id: Uuid,
    /// True when the idempotency key matched an existing plan and no rows
    /// were written.
    pub reused: bool,
    pub executions: Vec<Execution>,
}

// ── Executions ───────────────────────────────────────────────────────

/// Status of one execution (one attempt at one action).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Leased,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses never transition again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// One attempt to perform one plan action; the unit of leasing and reporting.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Execution {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub action_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub status: ExecutionStatus,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub message: Option<String>,
}

/// One leased action handed to an agent.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedAction {
    pub execution_id: Uuid,
    pub action_id: Uuid,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub params: serde_json::Value,
    pub timeout_sec: i32,
}

/// A bundle of leased actions belonging to one plan, in plan order.
#[derive(Debug, Clone, Serialize)]
pub struct LeasedPlan {
    pub plan_id: Uuid,
    pub actions: Vec<LeasedAction>,
}

/// An agent's terminal report for one execution.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultReport {
    pub execution_id: Uuid,
    pub ok: bool,
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

// ── Execution logs ───────────────────────────────────────────────────

/// One append-only execution log line.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExecutionLogRow {
    pub execution_id: Uuid,
    pub seq: i64,
    pub level: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A log entry as submitted by an agent (before sequence assignment).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntryInput {
    pub execution_id: Uuid,
    pub action_id: Option<Uuid>,
    pub level: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

// ── Audit events ─────────────────────────────────────────────────────

/// Who performed an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ActorType {
    User,
    Agent,
    System,
}

/// The immutable body of an audit event, before chaining.
#[derive(Debug, Clone)]
pub struct AuditEventBody {
    pub tenant_id: Uuid,
    pub site_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub actor_user_id: Option<Uuid>,
    pub actor_agent_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_id: Option<String>,
    pub source_ip: Option<String>,
    /// Pre-canonicalized JSON, preserved byte-for-byte.
    pub metadata_json: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// A chained audit event as stored. `id` is assigned by the store and is
/// strictly monotonic; `prev_hash`/`entry_hash` form the tamper-evident
/// linkage.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AuditEvent {
    pub id: i64,
    pub tenant_id: Uuid,
    pub site_id: Option<Uuid>,
    pub actor_type: ActorType,
    pub actor_user_id: Option<Uuid>,
    pub actor_agent_id: Option<Uuid>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub request_id: Option<String>,
    pub source_ip: Option<String>,
    pub metadata_json: Option<String>,
    pub occurred_at: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
    pub chain_valid: bool,
}

// ── Certificates ─────────────────────────────────────────────────────

/// Issuance history for one agent certificate serial.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CertificateRecord {
    pub agent_id: Uuid,
    pub serial: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// One revocation-list entry; presented serials matching an entry are
/// rejected before any handler runs.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CrlEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
    pub reason: String,
}

// ── Quotas ───────────────────────────────────────────────────────────

/// Per-tenant resource caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantLimits {
    pub max_sites: i64,
    pub max_agents_per_site: i64,
    pub max_vms_per_agent: i64,
    pub max_concurrent_plans: i64,
    pub max_api_keys: i64,
}

impl Default for TenantLimits {
    fn default() -> Self {
        Self {
            max_sites: 25,
            max_agents_per_site: 50,
            max_vms_per_agent: 32,
            max_concurrent_plans: 100,
            max_api_keys: 20,
        }
    }
}
