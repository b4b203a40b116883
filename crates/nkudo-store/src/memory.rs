//! In-memory repository.
//!
//! The full [`Repository`] semantics over plain collections behind a single
//! async mutex: one lock acquisition per operation gives the same atomicity
//! the PostgreSQL implementation gets from transactions. Used by every test
//! and by `NKUDO_STORE=memory` dev mode.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    reconcile_vm_status, Agent, AgentStatus, ApiKey, ApiKeyValidation, ApplyPlanInput,
    ApplyPlanResult, AuditEvent, AuditEventBody, CertificateRecord, ConnectivityState, CrlEntry,
    EnrollmentGrant, EnrollmentToken, Execution, ExecutionLogRow, ExecutionStatus, HeartbeatInput,
    Host, LeasedAction, LeasedPlan, LogEntryInput, MicroVm, NewAgent, NewTenant, Plan, PlanAction,
    PlanActionInput, ResultReport, Site, Tenant, TenantLimits, VmActionParams, VmStatus,
};
use crate::Repository;

/// How long a `last_used_at` stamp stays fresh before the next successful
/// validation writes a new one, in seconds.
const LAST_USED_COALESCE_SECS: i64 = 1;

#[derive(Default)]
struct MemoryState {
    tenants: HashMap<Uuid, Tenant>,
    api_keys: HashMap<Uuid, ApiKey>,
    sites: HashMap<Uuid, Site>,
    enrollment_tokens: HashMap<Uuid, EnrollmentToken>,
    agents: HashMap<Uuid, Agent>,
    hosts: HashMap<Uuid, Host>,
    vms: HashMap<Uuid, MicroVm>,
    plans: HashMap<Uuid, Plan>,
    actions: HashMap<Uuid, PlanAction>,
    executions: HashMap<Uuid, Execution>,
    execution_logs: Vec<ExecutionLogRow>,
    audit_events: Vec<AuditEvent>,
    cert_history: Vec<CertificateRecord>,
    crl: Vec<CrlEntry>,
    limits: HashMap<Uuid, TenantLimits>,
}

impl MemoryState {
    fn actions_of_plan(&self, plan_id: Uuid) -> Vec<PlanAction> {
        let mut actions: Vec<PlanAction> = self
            .actions
            .values()
            .filter(|a| a.plan_id == plan_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.order);
        actions
    }

    fn executions_of_plan(&self, plan_id: Uuid) -> Vec<Execution> {
        let order: HashMap<Uuid, i32> = self
            .actions
            .values()
            .filter(|a| a.plan_id == plan_id)
            .map(|a| (a.id, a.order))
            .collect();
        let mut execs: Vec<Execution> = self
            .executions
            .values()
            .filter(|e| e.plan_id == plan_id)
            .cloned()
            .collect();
        execs.sort_by_key(|e| order.get(&e.action_id).copied().unwrap_or(i32::MAX));
        execs
    }

    fn site_has_online_agent(&self, site_id: Uuid) -> bool {
        self.agents
            .values()
            .any(|a| a.site_id == site_id && a.status == AgentStatus::Online)
    }
}

/// In-memory [`Repository`] implementation.
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    /// Create an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Test hook: overwrite one audit event's stored `entry_hash`, simulating
    /// storage-level tampering for chain-verification tests.
    pub async fn tamper_audit_entry_hash(&self, event_id: i64, entry_hash: &str) -> bool {
        let mut state = self.state.lock().await;
        for ev in &mut state.audit_events {
            if ev.id == event_id {
                ev.entry_hash = entry_hash.to_owned();
                return true;
            }
        }
        false
    }
}

#[async_trait::async_trait]
impl Repository for MemoryRepository {
    // ── Tenants ──────────────────────────────────────────────────────

    async fn create_tenant(&self, input: NewTenant) -> Result<Tenant, StoreError> {
        let mut state = self.state.lock().await;
        if state.tenants.values().any(|t| t.slug == input.slug) {
            return Err(StoreError::Conflict(format!(
                "tenant slug '{}' already exists",
                input.slug
            )));
        }
        let tenant = Tenant {
            id: Uuid::new_v4(),
            slug: input.slug,
            name: input.name,
            primary_region: input.primary_region,
            data_retention_days: input.data_retention_days,
            created_at: Utc::now(),
        };
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tenants)
    }

    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Tenant, StoreError> {
        let state = self.state.lock().await;
        state
            .tenants
            .get(&tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("tenant not found".to_owned()))
    }

    // ── API keys ─────────────────────────────────────────────────────

    async fn create_api_key(
        &self,
        tenant_id: Uuid,
        name: &str,
        key_hash: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey, StoreError> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&tenant_id) {
            return Err(StoreError::NotFound("tenant not found".to_owned()));
        }
        let key = ApiKey {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_owned(),
            key_hash: key_hash.to_owned(),
            created_at: Utc::now(),
            expires_at,
            last_used_at: None,
            revoked_at: None,
        };
        state.api_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn validate_api_key(&self, key_hash: &str) -> Result<ApiKeyValidation, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let key = state
            .api_keys
            .values_mut()
            .find(|k| k.key_hash == key_hash)
            .ok_or_else(|| StoreError::Invalid("unknown API key".to_owned()))?;
        if key.revoked_at.is_some() {
            return Err(StoreError::Unauthorized("API key revoked".to_owned()));
        }
        if key.expires_at.is_some_and(|exp| exp <= now) {
            return Err(StoreError::Expired("API key expired".to_owned()));
        }
        let stale = key
            .last_used_at
            .is_none_or(|t| now - t >= Duration::seconds(LAST_USED_COALESCE_SECS));
        if stale {
            key.last_used_at = Some(now);
        }
        Ok(ApiKeyValidation {
            tenant_id: key.tenant_id,
            key_id: key.id,
        })
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let state = self.state.lock().await;
        let mut keys: Vec<ApiKey> = state
            .api_keys
            .values()
            .filter(|k| k.tenant_id == tenant_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn revoke_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let key = state
            .api_keys
            .get_mut(&key_id)
            .filter(|k| k.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound("API key not found".to_owned()))?;
        if key.revoked_at.is_none() {
            key.revoked_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn count_api_keys(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let n = state
            .api_keys
            .values()
            .filter(|k| k.tenant_id == tenant_id && k.revoked_at.is_none())
            .count();
        Ok(n as i64)
    }

    // ── Sites ────────────────────────────────────────────────────────

    async fn create_site(
        &self,
        tenant_id: Uuid,
        name: &str,
        external_key: Option<&str>,
        location_country_code: Option<&str>,
    ) -> Result<Site, StoreError> {
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&tenant_id) {
            return Err(StoreError::NotFound("tenant not found".to_owned()));
        }
        let site = Site {
            id: Uuid::new_v4(),
            tenant_id,
            name: name.to_owned(),
            external_key: external_key.map(str::to_owned),
            location_country_code: location_country_code.map(str::to_owned),
            connectivity_state: ConnectivityState::Pending,
            last_heartbeat_at: None,
            created_at: Utc::now(),
        };
        state.sites.insert(site.id, site.clone());
        Ok(site)
    }

    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError> {
        let state = self.state.lock().await;
        let mut sites: Vec<Site> = state
            .sites
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        sites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sites)
    }

    async fn site_by_id(&self, site_id: Uuid) -> Result<Site, StoreError> {
        let state = self.state.lock().await;
        state
            .sites
            .get(&site_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("site not found".to_owned()))
    }

    async fn site_belongs_to_tenant(
        &self,
        site_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sites
            .get(&site_id)
            .is_some_and(|s| s.tenant_id == tenant_id))
    }

    async fn count_sites(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let n = state
            .sites
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .count();
        Ok(n as i64)
    }

    // ── Enrollment ───────────────────────────────────────────────────

    async fn issue_enrollment_token(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<EnrollmentToken, StoreError> {
        let mut state = self.state.lock().await;
        if !state
            .sites
            .get(&site_id)
            .is_some_and(|s| s.tenant_id == tenant_id)
        {
            return Err(StoreError::NotFound("site not found".to_owned()));
        }
        let token = EnrollmentToken {
            id: Uuid::new_v4(),
            tenant_id,
            site_id,
            token_hash: token_hash.to_owned(),
            expires_at,
            consumed_at: None,
            consumed_by_agent_id: None,
        };
        state.enrollment_tokens.insert(token.id, token.clone());
        Ok(token)
    }

    async fn enrollment_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<EnrollmentToken, StoreError> {
        let state = self.state.lock().await;
        state
            .enrollment_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned()
            .ok_or_else(|| StoreError::Invalid("unknown enrollment token".to_owned()))
    }

    async fn enroll_agent(
        &self,
        token_hash: &str,
        agent: NewAgent,
    ) -> Result<(EnrollmentGrant, Agent), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let token = state
            .enrollment_tokens
            .values_mut()
            .find(|t| t.token_hash == token_hash)
            .ok_or_else(|| StoreError::Invalid("unknown enrollment token".to_owned()))?;
        if token.consumed_at.is_some() {
            return Err(StoreError::AlreadyConsumed);
        }
        if token.expires_at <= now {
            return Err(StoreError::Expired("enrollment token expired".to_owned()));
        }
        let agent_id = agent.id;
        token.consumed_at = Some(now);
        token.consumed_by_agent_id = Some(agent_id);
        let grant = EnrollmentGrant {
            token_id: token.id,
            tenant_id: token.tenant_id,
            site_id: token.site_id,
        };
        let agent = Agent {
            id: agent_id,
            tenant_id: grant.tenant_id,
            site_id: grant.site_id,
            hostname: agent.hostname,
            cert_serial: agent.cert_serial,
            cert_expires_at: agent.cert_expires_at,
            refresh_token_hash: agent.refresh_token_hash,
            enrolled_at: now,
            last_heartbeat_at: None,
            status: AgentStatus::Enrolled,
        };
        state.agents.insert(agent.id, agent.clone());
        state.cert_history.push(CertificateRecord {
            agent_id: agent.id,
            serial: agent.cert_serial.clone(),
            issued_at: now,
            expires_at: agent.cert_expires_at,
            revoked_at: None,
            reason: None,
        });
        Ok((grant, agent))
    }

    // ── Agents ───────────────────────────────────────────────────────

    async fn agent_by_id(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        let state = self.state.lock().await;
        state
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))
    }

    async fn agent_by_cert_serial(&self, serial: &str) -> Result<Agent, StoreError> {
        let state = self.state.lock().await;
        state
            .agents
            .values()
            .find(|a| a.cert_serial == serial)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))
    }

    async fn unenroll_agent(&self, agent_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))?;
        agent.status = AgentStatus::Unenrolled;
        Ok(())
    }

    async fn rotate_agent_certificate(
        &self,
        agent_id: Uuid,
        new_serial: &str,
        new_expires_at: DateTime<Utc>,
        new_refresh_token_hash: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))?;
        agent.cert_serial = new_serial.to_owned();
        agent.cert_expires_at = new_expires_at;
        agent.refresh_token_hash = new_refresh_token_hash.to_owned();
        state.cert_history.push(CertificateRecord {
            agent_id,
            serial: new_serial.to_owned(),
            issued_at: now,
            expires_at: new_expires_at,
            revoked_at: None,
            reason: None,
        });
        Ok(())
    }

    async fn count_agents_for_site(&self, site_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let n = state
            .agents
            .values()
            .filter(|a| a.site_id == site_id && a.status != AgentStatus::Unenrolled)
            .count();
        Ok(n as i64)
    }

    // ── Heartbeat & sweep ────────────────────────────────────────────

    async fn ingest_heartbeat(&self, hb: HeartbeatInput) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let (tenant_id, site_id) = {
            let agent = state
                .agents
                .get_mut(&hb.agent_id)
                .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))?;
            agent.last_heartbeat_at = Some(now);
            agent.status = AgentStatus::Online;
            (agent.tenant_id, agent.site_id)
        };
        if let Some(site) = state.sites.get_mut(&site_id) {
            site.last_heartbeat_at = Some(now);
            site.connectivity_state = ConnectivityState::Connected;
        }
        // Upsert the host record keyed by agent.
        let existing = state
            .hosts
            .values()
            .find(|h| h.agent_id == hb.agent_id)
            .map(|h| h.id);
        let host_id = existing.unwrap_or_else(Uuid::new_v4);
        state.hosts.insert(
            host_id,
            Host {
                id: host_id,
                tenant_id,
                site_id,
                agent_id: hb.agent_id,
                cpu_cores: hb.facts.cpu_cores,
                memory_mib: hb.facts.memory_mib,
                arch: hb.facts.arch.clone(),
                kernel: hb.facts.kernel.clone(),
                disks: sqlx::types::Json(hb.facts.disks.clone()),
            },
        );
        for report in &hb.vm_reports {
            if let Some(vm) = state.vms.get_mut(&report.vm_id) {
                if vm.tenant_id != tenant_id || vm.site_id != site_id {
                    continue;
                }
                let next = reconcile_vm_status(vm.status, report.status);
                if next != vm.status {
                    vm.status = next;
                    vm.updated_at = now;
                }
            }
        }
        Ok(())
    }

    async fn sweep_offline_agents(&self, stale_before: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let mut swept = 0i64;
        let mut touched_sites = Vec::new();
        for agent in state.agents.values_mut() {
            if agent.status == AgentStatus::Online
                && agent.last_heartbeat_at.is_some_and(|t| t < stale_before)
            {
                agent.status = AgentStatus::Offline;
                touched_sites.push(agent.site_id);
                swept += 1;
            }
        }
        for site_id in touched_sites {
            if !state.site_has_online_agent(site_id) {
                if let Some(site) = state.sites.get_mut(&site_id) {
                    site.connectivity_state = ConnectivityState::Disconnected;
                }
            }
        }
        Ok(swept)
    }

    // ── Hosts & VMs ──────────────────────────────────────────────────

    async fn list_hosts(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Host>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .hosts
            .values()
            .filter(|h| h.tenant_id == tenant_id && site_id.is_none_or(|s| h.site_id == s))
            .cloned()
            .collect())
    }

    async fn list_vms(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<MicroVm>, StoreError> {
        let state = self.state.lock().await;
        let mut vms: Vec<MicroVm> = state
            .vms
            .values()
            .filter(|v| v.tenant_id == tenant_id && site_id.is_none_or(|s| v.site_id == s))
            .cloned()
            .collect();
        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(vms)
    }

    async fn count_vms_for_agent(&self, agent_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let n = state
            .vms
            .values()
            .filter(|v| v.agent_id == Some(agent_id) && v.status != VmStatus::Deleted)
            .count();
        Ok(n as i64)
    }

    // ── Plans & executions ───────────────────────────────────────────

    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanResult, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .plans
            .values()
            .find(|p| p.tenant_id == input.tenant_id && p.idempotency_key == input.idempotency_key)
            .cloned()
        {
            let stored: Vec<PlanActionInput> = state
                .actions_of_plan(existing.id)
                .into_iter()
                .map(|a| PlanActionInput {
                    action_type: a.action_type,
                    params: a.params,
                    timeout_sec: a.timeout_sec,
                })
                .collect();
            if stored != input.actions {
                return Err(StoreError::Conflict(format!(
                    "idempotency key '{}' reused with a different body",
                    input.idempotency_key
                )));
            }
            let executions = state.executions_of_plan(existing.id);
            return Ok(ApplyPlanResult {
                plan_id: existing.id,
                reused: true,
                executions,
            });
        }

        let plan = Plan {
            id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            site_id: input.site_id,
            idempotency_key: input.idempotency_key,
            created_at: now,
        };
        let mut executions = Vec::with_capacity(input.actions.len());
        for (order, action) in input.actions.into_iter().enumerate() {
            let action_row = PlanAction {
                id: Uuid::new_v4(),
                plan_id: plan.id,
                order: i32::try_from(order).unwrap_or(i32::MAX),
                action_type: action.action_type,
                params: action.params,
                timeout_sec: action.timeout_sec,
            };
            let execution = Execution {
                id: Uuid::new_v4(),
                plan_id: plan.id,
                action_id: action_row.id,
                agent_id: None,
                status: ExecutionStatus::Pending,
                lease_expires_at: None,
                started_at: None,
                finished_at: None,
                error_code: None,
                message: None,
            };
            state.actions.insert(action_row.id, action_row);
            state.executions.insert(execution.id, execution.clone());
            executions.push(execution);
        }
        state.plans.insert(plan.id, plan.clone());
        Ok(ApplyPlanResult {
            plan_id: plan.id,
            reused: false,
            executions,
        })
    }

    async fn plan_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Plan>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .plans
            .values()
            .find(|p| p.tenant_id == tenant_id && p.idempotency_key == idempotency_key)
            .cloned())
    }

    async fn count_open_plans(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        let n = state
            .plans
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .filter(|p| {
                state
                    .executions
                    .values()
                    .any(|e| e.plan_id == p.id && !e.status.is_terminal())
            })
            .count();
        Ok(n as i64)
    }

    async fn lease_pending_plans(
        &self,
        agent_id: Uuid,
        limit: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<LeasedPlan>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let agent = state
            .agents
            .get(&agent_id)
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))?
            .clone();

        // Candidate executions at the agent's site: PENDING, or LEASED past
        // lease expiry (reclaim). Ordered by plan age, then action order.
        let mut candidates: Vec<(DateTime<Utc>, i32, Uuid, Uuid, Uuid)> = state
            .executions
            .values()
            .filter(|e| {
                let leasable = match e.status {
                    ExecutionStatus::Pending => true,
                    ExecutionStatus::Leased => {
                        e.lease_expires_at.is_none_or(|exp| exp <= now)
                    }
                    _ => false,
                };
                leasable
                    && state
                        .plans
                        .get(&e.plan_id)
                        .is_some_and(|p| p.site_id == agent.site_id)
            })
            .map(|e| {
                let plan_created = state
                    .plans
                    .get(&e.plan_id)
                    .map(|p| p.created_at)
                    .unwrap_or(now);
                let order = state
                    .actions
                    .get(&e.action_id)
                    .map_or(i32::MAX, |a| a.order);
                (plan_created, order, e.action_id, e.plan_id, e.id)
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
        candidates.truncate(limit);

        let lease_expires_at = now + lease_ttl;
        let mut by_plan: Vec<(Uuid, Vec<LeasedAction>)> = Vec::new();
        for (_, _, _, plan_id, exec_id) in candidates {
            if let Some(exec) = state.executions.get_mut(&exec_id) {
                exec.status = ExecutionStatus::Leased;
                exec.agent_id = Some(agent_id);
                exec.lease_expires_at = Some(lease_expires_at);
            }
            let Some(action) = state.actions.get(
                &state
                    .executions
                    .get(&exec_id)
                    .map(|e| e.action_id)
                    .unwrap_or_default(),
            ) else {
                continue;
            };
            let leased = LeasedAction {
                execution_id: exec_id,
                action_id: action.id,
                action_type: action.action_type,
                params: action.params.clone(),
                timeout_sec: action.timeout_sec,
            };
            match by_plan.iter_mut().find(|(p, _)| *p == plan_id) {
                Some((_, actions)) => actions.push(leased),
                None => by_plan.push((plan_id, vec![leased])),
            }
        }
        Ok(by_plan
            .into_iter()
            .map(|(plan_id, actions)| LeasedPlan { plan_id, actions })
            .collect())
    }

    async fn report_plan_result(
        &self,
        agent_id: Uuid,
        report: ResultReport,
    ) -> Result<Execution, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let exec = state
            .executions
            .get(&report.execution_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("execution not found".to_owned()))?;

        let target_status = if report.ok {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };

        if exec.status.is_terminal() {
            // Idempotent retry of the same terminal report; anything else
            // means the execution moved on without this agent.
            if exec.agent_id == Some(agent_id) && exec.status == target_status {
                return Ok(exec);
            }
            return Err(StoreError::LeaseLost(
                "execution already finished".to_owned(),
            ));
        }
        if exec.agent_id != Some(agent_id) {
            return Err(StoreError::LeaseLost(
                "lease held by another agent".to_owned(),
            ));
        }
        if exec.lease_expires_at.is_none_or(|exp| exp <= now) {
            return Err(StoreError::LeaseLost("lease expired".to_owned()));
        }

        let action = state
            .actions
            .get(&exec.action_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("plan action not found".to_owned()))?;
        let plan = state
            .plans
            .get(&exec.plan_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound("plan not found".to_owned()))?;

        // Reconcile the micro-VM row for successful VM-mutating actions.
        if report.ok && action.action_type.mutates_vm() {
            if let Some(next_status) = action.action_type.vm_status_on_success() {
                let params = VmActionParams::from_value(&action.params);
                let existing_id = params.vm_id.or_else(|| {
                    params.name.as_ref().and_then(|name| {
                        state
                            .vms
                            .values()
                            .find(|v| v.site_id == plan.site_id && v.name == *name)
                            .map(|v| v.id)
                    })
                });
                match existing_id {
                    Some(vm_id) => {
                        if let Some(vm) = state.vms.get_mut(&vm_id) {
                            vm.status = next_status;
                            vm.agent_id = Some(agent_id);
                            vm.updated_at = now;
                        } else if action.action_type == crate::models::ActionType::MicroVmCreate {
                            let vm = new_vm(vm_id, &plan, agent_id, &params, next_status, now);
                            state.vms.insert(vm.id, vm);
                        }
                    }
                    None => {
                        if action.action_type == crate::models::ActionType::MicroVmCreate {
                            let vm =
                                new_vm(Uuid::new_v4(), &plan, agent_id, &params, next_status, now);
                            state.vms.insert(vm.id, vm);
                        }
                    }
                }
            }
        }

        let exec = state
            .executions
            .get_mut(&report.execution_id)
            .ok_or_else(|| StoreError::NotFound("execution not found".to_owned()))?;
        exec.status = target_status;
        exec.started_at = Some(report.started_at);
        exec.finished_at = Some(report.finished_at);
        exec.error_code = report.error_code;
        exec.message = Some(report.message);
        exec.lease_expires_at = None;
        Ok(exec.clone())
    }

    async fn list_executions(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Execution>, StoreError> {
        let state = self.state.lock().await;
        let plan_ids: Vec<Uuid> = state
            .plans
            .values()
            .filter(|p| p.tenant_id == tenant_id && site_id.is_none_or(|s| p.site_id == s))
            .map(|p| p.id)
            .collect();
        let mut execs: Vec<Execution> = state
            .executions
            .values()
            .filter(|e| plan_ids.contains(&e.plan_id))
            .cloned()
            .collect();
        execs.sort_by_key(|e| {
            (
                state.plans.get(&e.plan_id).map(|p| p.created_at),
                state.actions.get(&e.action_id).map(|a| a.order),
            )
        });
        Ok(execs)
    }

    async fn execution_belongs_to_tenant(
        &self,
        execution_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.executions.get(&execution_id).is_some_and(|e| {
            state
                .plans
                .get(&e.plan_id)
                .is_some_and(|p| p.tenant_id == tenant_id)
        }))
    }

    // ── Execution logs ───────────────────────────────────────────────

    async fn insert_execution_logs(&self, rows: &[LogEntryInput]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for row in rows {
            let seq = state
                .execution_logs
                .iter()
                .filter(|l| l.execution_id == row.execution_id)
                .map(|l| l.seq)
                .max()
                .unwrap_or(0)
                + 1;
            state.execution_logs.push(ExecutionLogRow {
                execution_id: row.execution_id,
                seq,
                level: row.level.clone(),
                message: row.message.clone(),
                at: row.at,
            });
        }
        Ok(())
    }

    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        let state = self.state.lock().await;
        let owned = state.executions.get(&execution_id).is_some_and(|e| {
            state
                .plans
                .get(&e.plan_id)
                .is_some_and(|p| p.tenant_id == tenant_id)
        });
        if !owned {
            return Err(StoreError::NotFound("execution not found".to_owned()));
        }
        let mut logs: Vec<ExecutionLogRow> = state
            .execution_logs
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.seq);
        Ok(logs)
    }

    // ── Audit chain ──────────────────────────────────────────────────

    async fn last_audit_event(&self) -> Result<Option<AuditEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.audit_events.last().cloned())
    }

    async fn write_audit_event(
        &self,
        body: AuditEventBody,
        prev_hash: &str,
        entry_hash: &str,
    ) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.audit_events.last().map_or(1, |e| e.id + 1);
        state.audit_events.push(AuditEvent {
            id,
            tenant_id: body.tenant_id,
            site_id: body.site_id,
            actor_type: body.actor_type,
            actor_user_id: body.actor_user_id,
            actor_agent_id: body.actor_agent_id,
            action: body.action,
            resource_type: body.resource_type,
            resource_id: body.resource_id,
            request_id: body.request_id,
            source_ip: body.source_ip,
            metadata_json: body.metadata_json,
            occurred_at: body.occurred_at,
            prev_hash: prev_hash.to_owned(),
            entry_hash: entry_hash.to_owned(),
            chain_valid: true,
        });
        Ok(id)
    }

    async fn set_audit_event_validity(
        &self,
        event_id: i64,
        valid: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let ev = state
            .audit_events
            .iter_mut()
            .find(|e| e.id == event_id)
            .ok_or_else(|| StoreError::NotFound("audit event not found".to_owned()))?;
        ev.chain_valid = valid;
        Ok(())
    }

    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit_events
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn audit_events_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit_events
            .iter()
            .filter(|e| e.id > after_id)
            .take(limit)
            .cloned()
            .collect())
    }

    // ── PKI ──────────────────────────────────────────────────────────

    async fn record_certificate_issuance(
        &self,
        agent_id: Uuid,
        serial: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.cert_history.push(CertificateRecord {
            agent_id,
            serial: serial.to_owned(),
            issued_at,
            expires_at,
            revoked_at: None,
            reason: None,
        });
        Ok(())
    }

    async fn list_certificate_history(
        &self,
        agent_id: Uuid,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut history: Vec<CertificateRecord> = state
            .cert_history
            .iter()
            .filter(|c| c.agent_id == agent_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(history)
    }

    async fn revoke_certificate(
        &self,
        serial: &str,
        reason: &str,
        agent_id: Uuid,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.crl.iter().any(|c| c.serial == serial) {
            return Ok(());
        }
        state.crl.push(CrlEntry {
            serial: serial.to_owned(),
            revoked_at: now,
            reason: reason.to_owned(),
        });
        for record in &mut state.cert_history {
            if record.agent_id == agent_id && record.serial == serial {
                record.revoked_at = Some(now);
                record.reason = Some(reason.to_owned());
            }
        }
        Ok(())
    }

    async fn is_certificate_revoked(&self, serial: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.crl.iter().any(|c| c.serial == serial))
    }

    async fn list_revoked_certificates(&self) -> Result<Vec<CrlEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut crl = state.crl.clone();
        crl.sort_by(|a, b| b.revoked_at.cmp(&a.revoked_at));
        Ok(crl)
    }

    // ── Quotas ───────────────────────────────────────────────────────

    async fn tenant_limits(&self, tenant_id: Uuid) -> Result<Option<TenantLimits>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.limits.get(&tenant_id).copied())
    }

    async fn set_tenant_limits(
        &self,
        tenant_id: Uuid,
        limits: TenantLimits,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.limits.insert(tenant_id, limits);
        Ok(())
    }
}

/// Build a fresh micro-VM row from a create action's params.
fn new_vm(
    id: Uuid,
    plan: &Plan,
    agent_id: Uuid,
    params: &VmActionParams,
    status: VmStatus,
    now: DateTime<Utc>,
) -> MicroVm {
    MicroVm {
        id,
        tenant_id: plan.tenant_id,
        site_id: plan.site_id,
        agent_id: Some(agent_id),
        name: params.name.clone().unwrap_or_else(|| id.to_string()),
        status,
        vcpu: params.vcpu.unwrap_or(1),
        mem_mib: params.mem_mib.unwrap_or(256),
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{ActionType, HostFacts, VmReport};
    use serde_json::json;

    async fn seed(repo: &MemoryRepository) -> (Tenant, Site) {
        let tenant = repo
            .create_tenant(NewTenant {
                slug: "acme".to_owned(),
                name: "Acme".to_owned(),
                primary_region: "eu-central".to_owned(),
                data_retention_days: 90,
            })
            .await
            .unwrap();
        let site = repo
            .create_site(tenant.id, "factory-1", None, Some("DE"))
            .await
            .unwrap();
        (tenant, site)
    }

    async fn enroll(repo: &MemoryRepository, tenant: &Tenant, site: &Site) -> Agent {
        repo.issue_enrollment_token(
            tenant.id,
            site.id,
            "tok-hash",
            Utc::now() + Duration::minutes(1),
        )
        .await
        .unwrap();
        let (_, agent) = repo
            .enroll_agent(
                "tok-hash",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge-01".to_owned(),
                    cert_serial: "serial-1".to_owned(),
                    cert_expires_at: Utc::now() + Duration::days(7),
                    refresh_token_hash: "refresh-hash".to_owned(),
                },
            )
            .await
            .unwrap();
        agent
    }

    #[tokio::test]
    async fn tenant_slug_must_be_unique() {
        let repo = MemoryRepository::new();
        seed(&repo).await;
        let err = repo
            .create_tenant(NewTenant {
                slug: "acme".to_owned(),
                name: "Other".to_owned(),
                primary_region: "us-east".to_owned(),
                data_retention_days: 30,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn enrollment_token_is_one_shot() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        enroll(&repo, &tenant, &site).await;

        let err = repo
            .enroll_agent(
                "tok-hash",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge-02".to_owned(),
                    cert_serial: "serial-2".to_owned(),
                    cert_expires_at: Utc::now() + Duration::days(7),
                    refresh_token_hash: "other-hash".to_owned(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyConsumed));
    }

    #[tokio::test]
    async fn expired_enrollment_token_is_rejected() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        repo.issue_enrollment_token(
            tenant.id,
            site.id,
            "stale-hash",
            Utc::now() - Duration::seconds(1),
        )
        .await
        .unwrap();
        let err = repo
            .enroll_agent(
                "stale-hash",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge-01".to_owned(),
                    cert_serial: "serial-1".to_owned(),
                    cert_expires_at: Utc::now() + Duration::days(7),
                    refresh_token_hash: "refresh-hash".to_owned(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Expired(_)));
    }

    #[tokio::test]
    async fn revoked_api_key_is_unauthorized() {
        let repo = MemoryRepository::new();
        let (tenant, _) = seed(&repo).await;
        let key = repo
            .create_api_key(tenant.id, "ci", "key-hash", None)
            .await
            .unwrap();
        repo.validate_api_key("key-hash").await.unwrap();
        repo.revoke_api_key(tenant.id, key.id).await.unwrap();
        let err = repo.validate_api_key("key-hash").await.unwrap_err();
        assert!(matches!(err, StoreError::Unauthorized(_)));
        // The row is kept for attribution.
        assert_eq!(repo.list_api_keys(tenant.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn apply_plan_is_idempotent_by_key() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let input = ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::MicroVmCreate,
                params: json!({"name": "web", "vcpu": 2, "mem_mib": 512}),
                timeout_sec: 60,
            }],
        };
        let first = repo.apply_plan(input.clone()).await.unwrap();
        let second = repo.apply_plan(input).await.unwrap();
        assert_eq!(first.plan_id, second.plan_id);
        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(second.executions.len(), 1);
        assert_eq!(first.executions[0].id, second.executions[0].id);
    }

    #[tokio::test]
    async fn apply_plan_same_key_different_body_conflicts() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let mut input = ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::MicroVmCreate,
                params: json!({"name": "web"}),
                timeout_sec: 60,
            }],
        };
        repo.apply_plan(input.clone()).await.unwrap();
        input.actions[0].params = json!({"name": "db"});
        let err = repo.apply_plan(input).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent_a = enroll(&repo, &tenant, &site).await;
        repo.issue_enrollment_token(
            tenant.id,
            site.id,
            "tok-hash-2",
            Utc::now() + Duration::minutes(1),
        )
        .await
        .unwrap();
        let (_, agent_b) = repo
            .enroll_agent(
                "tok-hash-2",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge-02".to_owned(),
                    cert_serial: "serial-2".to_owned(),
                    cert_expires_at: Utc::now() + Duration::days(7),
                    refresh_token_hash: "refresh-2".to_owned(),
                },
            )
            .await
            .unwrap();

        repo.apply_plan(ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::CommandExecute,
                params: json!({"command": "uname -a"}),
                timeout_sec: 30,
            }],
        })
        .await
        .unwrap();

        let leased_a = repo
            .lease_pending_plans(agent_a.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased_a.len(), 1);
        // Agent B sees nothing while A's lease is live.
        let leased_b = repo
            .lease_pending_plans(agent_b.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert!(leased_b.is_empty());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable_and_late_report_loses() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent_a = enroll(&repo, &tenant, &site).await;
        repo.issue_enrollment_token(
            tenant.id,
            site.id,
            "tok-hash-2",
            Utc::now() + Duration::minutes(1),
        )
        .await
        .unwrap();
        let (_, agent_b) = repo
            .enroll_agent(
                "tok-hash-2",
                NewAgent {
                    id: Uuid::new_v4(),
                    hostname: "edge-02".to_owned(),
                    cert_serial: "serial-2".to_owned(),
                    cert_expires_at: Utc::now() + Duration::days(7),
                    refresh_token_hash: "refresh-2".to_owned(),
                },
            )
            .await
            .unwrap();

        repo.apply_plan(ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::CommandExecute,
                params: json!({"command": "true"}),
                timeout_sec: 30,
            }],
        })
        .await
        .unwrap();

        // A leases with an already-elapsed TTL, simulating a crash.
        let leased_a = repo
            .lease_pending_plans(agent_a.id, 10, Duration::zero())
            .await
            .unwrap();
        let exec_id = leased_a[0].actions[0].execution_id;

        // B reclaims the expired lease.
        let leased_b = repo
            .lease_pending_plans(agent_b.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(leased_b[0].actions[0].execution_id, exec_id);

        // A's late report loses.
        let err = repo
            .report_plan_result(
                agent_a.id,
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

    #[tokio::test]
    async fn successful_create_report_upserts_vm_and_is_terminal() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent = enroll(&repo, &tenant, &site).await;
        repo.apply_plan(ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::MicroVmCreate,
                params: json!({"name": "web", "vcpu": 2, "mem_mib": 512}),
                timeout_sec: 120,
            }],
        })
        .await
        .unwrap();
        let leased = repo
            .lease_pending_plans(agent.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        let exec_id = leased[0].actions[0].execution_id;
        let report = ResultReport {
            execution_id: exec_id,
            ok: true,
            error_code: None,
            message: String::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        let exec = repo
            .report_plan_result(agent.id, report.clone())
            .await
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);

        let vms = repo.list_vms(tenant.id, Some(site.id)).await.unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "web");
        assert_eq!(vms[0].status, VmStatus::Running);

        // Duplicate terminal report is idempotent; still one VM.
        repo.report_plan_result(agent.id, report).await.unwrap();
        assert_eq!(repo.list_vms(tenant.id, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_marks_online_and_sweep_marks_offline() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent = enroll(&repo, &tenant, &site).await;
        repo.ingest_heartbeat(HeartbeatInput {
            agent_id: agent.id,
            facts: HostFacts {
                cpu_cores: 8,
                memory_mib: 16384,
                arch: "x86_64".to_owned(),
                kernel: "6.8.0".to_owned(),
                disks: vec![],
            },
            vm_reports: vec![],
        })
        .await
        .unwrap();
        let agent = repo.agent_by_id(agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Online);
        let site = repo.site_by_id(site.id).await.unwrap();
        assert_eq!(site.connectivity_state, ConnectivityState::Connected);
        assert_eq!(repo.list_hosts(tenant.id, None).await.unwrap().len(), 1);

        // Everything before the far future is stale.
        let swept = repo
            .sweep_offline_agents(Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(swept, 1);
        let agent = repo.agent_by_id(agent.id).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
        let site = repo.site_by_id(site.id).await.unwrap();
        assert_eq!(site.connectivity_state, ConnectivityState::Disconnected);
    }

    #[tokio::test]
    async fn vm_report_never_resurrects_deleted() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent = enroll(&repo, &tenant, &site).await;
        repo.apply_plan(ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![
                PlanActionInput {
                    action_type: ActionType::MicroVmCreate,
                    params: json!({"name": "web"}),
                    timeout_sec: 60,
                },
                PlanActionInput {
                    action_type: ActionType::MicroVmDelete,
                    params: json!({"name": "web"}),
                    timeout_sec: 60,
                },
            ],
        })
        .await
        .unwrap();
        let leased = repo
            .lease_pending_plans(agent.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        for action in &leased[0].actions {
            repo.report_plan_result(
                agent.id,
                ResultReport {
                    execution_id: action.execution_id,
                    ok: true,
                    error_code: None,
                    message: String::new(),
                    started_at: Utc::now(),
                    finished_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        }
        let vms = repo.list_vms(tenant.id, None).await.unwrap();
        assert_eq!(vms[0].status, VmStatus::Deleted);

        // A stale running report does not resurrect the VM.
        repo.ingest_heartbeat(HeartbeatInput {
            agent_id: agent.id,
            facts: HostFacts {
                cpu_cores: 4,
                memory_mib: 8192,
                arch: "x86_64".to_owned(),
                kernel: "6.8.0".to_owned(),
                disks: vec![],
            },
            vm_reports: vec![VmReport {
                vm_id: vms[0].id,
                status: VmStatus::Running,
            }],
        })
        .await
        .unwrap();
        let vms = repo.list_vms(tenant.id, None).await.unwrap();
        assert_eq!(vms[0].status, VmStatus::Deleted);
    }

    #[tokio::test]
    async fn execution_logs_are_sequenced_per_execution() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent = enroll(&repo, &tenant, &site).await;
        repo.apply_plan(ApplyPlanInput {
            tenant_id: tenant.id,
            site_id: site.id,
            idempotency_key: "ik-1".to_owned(),
            actions: vec![PlanActionInput {
                action_type: ActionType::CommandExecute,
                params: json!({"command": "true"}),
                timeout_sec: 30,
            }],
        })
        .await
        .unwrap();
        let leased = repo
            .lease_pending_plans(agent.id, 10, Duration::minutes(5))
            .await
            .unwrap();
        let exec_id = leased[0].actions[0].execution_id;
        let entry = |message: &str| LogEntryInput {
            execution_id: exec_id,
            action_id: None,
            level: "info".to_owned(),
            message: message.to_owned(),
            at: Utc::now(),
        };
        repo.insert_execution_logs(&[entry("one"), entry("two")])
            .await
            .unwrap();
        let logs = repo
            .list_execution_logs(tenant.id, exec_id)
            .await
            .unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!((logs[0].seq, logs[1].seq), (1, 2));
    }

    #[tokio::test]
    async fn revocation_is_idempotent_and_visible() {
        let repo = MemoryRepository::new();
        let (tenant, site) = seed(&repo).await;
        let agent = enroll(&repo, &tenant, &site).await;
        repo.revoke_certificate("serial-1", "rotated", agent.id)
            .await
            .unwrap();
        repo.revoke_certificate("serial-1", "rotated", agent.id)
            .await
            .unwrap();
        assert!(repo.is_certificate_revoked("serial-1").await.unwrap());
        assert_eq!(repo.list_revoked_certificates().await.unwrap().len(), 1);
        let history = repo.list_certificate_history(agent.id).await.unwrap();
        assert!(history[0].revoked_at.is_some());
    }
}
