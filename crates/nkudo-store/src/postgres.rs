//! PostgreSQL repository.
//!
//! Every query is parameterized (sqlx) and multi-row invariants run inside
//! explicit transactions. Lease selection locks rows with
//! `FOR UPDATE SKIP LOCKED` so concurrent agents never double-lease;
//! enrollment consumption is a conditional `UPDATE ... RETURNING` so the
//! consumed-exactly-once invariant holds under a single row lock.

use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    reconcile_vm_status, ActionType, Agent, ApiKey, ApiKeyValidation, ApplyPlanInput,
    ApplyPlanResult, AuditEvent, AuditEventBody, CertificateRecord, CrlEntry, EnrollmentGrant,
    EnrollmentToken, Execution, ExecutionLogRow, ExecutionStatus, HeartbeatInput, Host,
    LeasedAction, LeasedPlan, LogEntryInput, MicroVm, NewAgent, NewTenant, Plan, PlanAction,
    PlanActionInput, ResultReport, Site, Tenant, TenantLimits, VmActionParams,
};
use crate::Repository;

/// PostgreSQL-backed [`Repository`] implementation.
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    /// Connect to PostgreSQL and run pending migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect: {e}")))?;
        tracing::info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, embedded setups).
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| StoreError::Backend(format!("begin failed: {e}")))
    }
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), StoreError> {
    tx.commit()
        .await
        .map_err(|e| StoreError::Backend(format!("commit failed: {e}")))
}

#[async_trait::async_trait]
impl Repository for PgRepository {
    // ── Tenants ──────────────────────────────────────────────────────

    async fn create_tenant(&self, input: NewTenant) -> Result<Tenant, StoreError> {
        let tenant = sqlx::query_as::<_, Tenant>(
            r"INSERT INTO tenants (slug, name, primary_region, data_retention_days)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(&input.slug)
        .bind(&input.name)
        .bind(&input.primary_region)
        .bind(input.data_retention_days)
        .fetch_one(&self.pool)
        .await?;
        Ok(tenant)
    }

    async fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        let tenants =
            sqlx::query_as::<_, Tenant>("SELECT * FROM tenants ORDER BY created_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(tenants)
    }

    async fn tenant_by_id(&self, tenant_id: Uuid) -> Result<Tenant, StoreError> {
        sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?
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
        let key = sqlx::query_as::<_, ApiKey>(
            r"INSERT INTO api_keys (tenant_id, name, key_hash, expires_at)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(key_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(key)
    }

    async fn validate_api_key(&self, key_hash: &str) -> Result<ApiKeyValidation, StoreError> {
        let key = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::Invalid("unknown API key".to_owned()))?;
        if key.revoked_at.is_some() {
            return Err(StoreError::Unauthorized("API key revoked".to_owned()));
        }
        if key.expires_at.is_some_and(|exp| exp <= Utc::now()) {
            return Err(StoreError::Expired("API key expired".to_owned()));
        }
        // Coalesced touch: one write per second per key at most.
        sqlx::query(
            r"UPDATE api_keys SET last_used_at = now()
              WHERE id = $1
                AND (last_used_at IS NULL OR last_used_at < now() - interval '1 second')",
        )
        .bind(key.id)
        .execute(&self.pool)
        .await?;
        Ok(ApiKeyValidation {
            tenant_id: key.tenant_id,
            key_id: key.id,
        })
    }

    async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let keys = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn revoke_api_key(&self, tenant_id: Uuid, key_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE api_keys SET revoked_at = COALESCE(revoked_at, now())
              WHERE id = $1 AND tenant_id = $2",
        )
        .bind(key_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("API key not found".to_owned()));
        }
        Ok(())
    }

    async fn count_api_keys(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM api_keys WHERE tenant_id = $1 AND revoked_at IS NULL",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    // ── Sites ────────────────────────────────────────────────────────

    async fn create_site(
        &self,
        tenant_id: Uuid,
        name: &str,
        external_key: Option<&str>,
        location_country_code: Option<&str>,
    ) -> Result<Site, StoreError> {
        let site = sqlx::query_as::<_, Site>(
            r"INSERT INTO sites (tenant_id, name, external_key, location_country_code)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(tenant_id)
        .bind(name)
        .bind(external_key)
        .bind(location_country_code)
        .fetch_one(&self.pool)
        .await?;
        Ok(site)
    }

    async fn list_sites(&self, tenant_id: Uuid) -> Result<Vec<Site>, StoreError> {
        let sites = sqlx::query_as::<_, Site>(
            "SELECT * FROM sites WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(sites)
    }

    async fn site_by_id(&self, site_id: Uuid) -> Result<Site, StoreError> {
        sqlx::query_as::<_, Site>("SELECT * FROM sites WHERE id = $1")
            .bind(site_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound("site not found".to_owned()))
    }

    async fn site_belongs_to_tenant(
        &self,
        site_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError> {
        let found: Option<bool> =
            sqlx::query_scalar("SELECT true FROM sites WHERE id = $1 AND tenant_id = $2")
                .bind(site_id)
                .bind(tenant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn count_sites(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sites WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    // ── Enrollment ───────────────────────────────────────────────────

    async fn issue_enrollment_token(
        &self,
        tenant_id: Uuid,
        site_id: Uuid,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<EnrollmentToken, StoreError> {
        let token = sqlx::query_as::<_, EnrollmentToken>(
            r"INSERT INTO enrollment_tokens (tenant_id, site_id, token_hash, expires_at)
              VALUES ($1, $2, $3, $4)
              RETURNING *",
        )
        .bind(tenant_id)
        .bind(site_id)
        .bind(token_hash)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(token)
    }

    async fn enrollment_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<EnrollmentToken, StoreError> {
        sqlx::query_as::<_, EnrollmentToken>(
            "SELECT * FROM enrollment_tokens WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::Invalid("unknown enrollment token".to_owned()))
    }

    async fn enroll_agent(
        &self,
        token_hash: &str,
        agent: NewAgent,
    ) -> Result<(EnrollmentGrant, Agent), StoreError> {
        let mut tx = self.begin().await?;
        let agent_id = agent.id;

        // Conditional consume under the row lock the UPDATE takes. Zero rows
        // means the token is unknown, expired, or already used — diagnose
        // with a follow-up read so the caller gets the precise kind.
        let grant: Option<(Uuid, Uuid, Uuid)> = sqlx::query_as(
            r"UPDATE enrollment_tokens
              SET consumed_at = now(), consumed_by_agent_id = $2
              WHERE token_hash = $1 AND consumed_at IS NULL AND expires_at > now()
              RETURNING id, tenant_id, site_id",
        )
        .bind(token_hash)
        .bind(agent_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((token_id, tenant_id, site_id)) = grant else {
            let existing = sqlx::query_as::<_, EnrollmentToken>(
                "SELECT * FROM enrollment_tokens WHERE token_hash = $1",
            )
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .await?;
            return Err(match existing {
                None => StoreError::Invalid("unknown enrollment token".to_owned()),
                Some(t) if t.consumed_at.is_some() => StoreError::AlreadyConsumed,
                Some(_) => StoreError::Expired("enrollment token expired".to_owned()),
            });
        };

        let created = sqlx::query_as::<_, Agent>(
            r"INSERT INTO agents
                (id, tenant_id, site_id, hostname, cert_serial, cert_expires_at,
                 refresh_token_hash, status)
              VALUES ($1, $2, $3, $4, $5, $6, $7, 'ENROLLED')
              RETURNING *",
        )
        .bind(agent_id)
        .bind(tenant_id)
        .bind(site_id)
        .bind(&agent.hostname)
        .bind(&agent.cert_serial)
        .bind(agent.cert_expires_at)
        .bind(&agent.refresh_token_hash)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO certificate_history (agent_id, serial, issued_at, expires_at)
              VALUES ($1, $2, now(), $3)",
        )
        .bind(agent_id)
        .bind(&agent.cert_serial)
        .bind(agent.cert_expires_at)
        .execute(&mut *tx)
        .await?;

        commit(tx).await?;
        Ok((
            EnrollmentGrant {
                token_id,
                tenant_id,
                site_id,
            },
            created,
        ))
    }

    // ── Agents ───────────────────────────────────────────────────────

    async fn agent_by_id(&self, agent_id: Uuid) -> Result<Agent, StoreError> {
        sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))
    }

    async fn agent_by_cert_serial(&self, serial: &str) -> Result<Agent, StoreError> {
        sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE cert_serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))
    }

    async fn unenroll_agent(&self, agent_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE agents SET status = 'UNENROLLED' WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent not found".to_owned()));
        }
        Ok(())
    }

    async fn rotate_agent_certificate(
        &self,
        agent_id: Uuid,
        new_serial: &str,
        new_expires_at: DateTime<Utc>,
        new_refresh_token_hash: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let result = sqlx::query(
            r"UPDATE agents
              SET cert_serial = $2, cert_expires_at = $3, refresh_token_hash = $4
              WHERE id = $1",
        )
        .bind(agent_id)
        .bind(new_serial)
        .bind(new_expires_at)
        .bind(new_refresh_token_hash)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("agent not found".to_owned()));
        }
        sqlx::query(
            r"INSERT INTO certificate_history (agent_id, serial, issued_at, expires_at)
              VALUES ($1, $2, now(), $3)",
        )
        .bind(agent_id)
        .bind(new_serial)
        .bind(new_expires_at)
        .execute(&mut *tx)
        .await?;
        commit(tx).await
    }

    async fn count_agents_for_site(&self, site_id: Uuid) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM agents WHERE site_id = $1 AND status <> 'UNENROLLED'",
        )
        .bind(site_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    // ── Heartbeat & sweep ────────────────────────────────────────────

    async fn ingest_heartbeat(&self, hb: HeartbeatInput) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        let agent: Agent = sqlx::query_as(
            r"UPDATE agents SET last_heartbeat_at = now(), status = 'ONLINE'
              WHERE id = $1
              RETURNING *",
        )
        .bind(hb.agent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::NotFound("agent not found".to_owned()))?;

        sqlx::query(
            r"UPDATE sites SET last_heartbeat_at = now(), connectivity_state = 'CONNECTED'
              WHERE id = $1",
        )
        .bind(agent.site_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"INSERT INTO hosts (tenant_id, site_id, agent_id, cpu_cores, memory_mib, arch, kernel, disks)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              ON CONFLICT (agent_id) DO UPDATE SET
                cpu_cores = EXCLUDED.cpu_cores,
                memory_mib = EXCLUDED.memory_mib,
                arch = EXCLUDED.arch,
                kernel = EXCLUDED.kernel,
                disks = EXCLUDED.disks",
        )
        .bind(agent.tenant_id)
        .bind(agent.site_id)
        .bind(agent.id)
        .bind(hb.facts.cpu_cores)
        .bind(hb.facts.memory_mib)
        .bind(&hb.facts.arch)
        .bind(&hb.facts.kernel)
        .bind(sqlx::types::Json(&hb.facts.disks))
        .execute(&mut *tx)
        .await?;

        for report in &hb.vm_reports {
            let vm: Option<MicroVm> = sqlx::query_as(
                "SELECT * FROM microvms WHERE id = $1 AND tenant_id = $2 AND site_id = $3 FOR UPDATE",
            )
            .bind(report.vm_id)
            .bind(agent.tenant_id)
            .bind(agent.site_id)
            .fetch_optional(&mut *tx)
            .await?;
            let Some(vm) = vm else { continue };
            let next = reconcile_vm_status(vm.status, report.status);
            if next != vm.status {
                sqlx::query("UPDATE microvms SET status = $2, updated_at = now() WHERE id = $1")
                    .bind(vm.id)
                    .bind(next)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        commit(tx).await
    }

    async fn sweep_offline_agents(&self, stale_before: DateTime<Utc>) -> Result<i64, StoreError> {
        let mut tx = self.begin().await?;
        let swept_sites: Vec<(Uuid,)> = sqlx::query_as(
            r"UPDATE agents SET status = 'OFFLINE'
              WHERE status = 'ONLINE' AND last_heartbeat_at < $1
              RETURNING site_id",
        )
        .bind(stale_before)
        .fetch_all(&mut *tx)
        .await?;
        let swept = swept_sites.len() as i64;
        if swept > 0 {
            let site_ids: Vec<Uuid> = swept_sites.into_iter().map(|(s,)| s).collect();
            sqlx::query(
                r"UPDATE sites SET connectivity_state = 'DISCONNECTED'
                  WHERE id = ANY($1)
                    AND NOT EXISTS (
                      SELECT 1 FROM agents
                      WHERE agents.site_id = sites.id AND agents.status = 'ONLINE'
                    )",
            )
            .bind(&site_ids)
            .execute(&mut *tx)
            .await?;
        }
        commit(tx).await?;
        Ok(swept)
    }

    // ── Hosts & VMs ──────────────────────────────────────────────────

    async fn list_hosts(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Host>, StoreError> {
        let hosts = sqlx::query_as::<_, Host>(
            r"SELECT * FROM hosts
              WHERE tenant_id = $1 AND ($2::uuid IS NULL OR site_id = $2)",
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(hosts)
    }

    async fn list_vms(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<MicroVm>, StoreError> {
        let vms = sqlx::query_as::<_, MicroVm>(
            r"SELECT * FROM microvms
              WHERE tenant_id = $1 AND ($2::uuid IS NULL OR site_id = $2)
              ORDER BY created_at",
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(vms)
    }

    async fn count_vms_for_agent(&self, agent_id: Uuid) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM microvms WHERE agent_id = $1 AND status <> 'DELETED'",
        )
        .bind(agent_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    // ── Plans & executions ───────────────────────────────────────────

    async fn apply_plan(&self, input: ApplyPlanInput) -> Result<ApplyPlanResult, StoreError> {
        let mut tx = self.begin().await?;

        let existing: Option<Plan> = sqlx::query_as(
            "SELECT * FROM plans WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(input.tenant_id)
        .bind(&input.idempotency_key)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(plan) = existing {
            let actions = sqlx::query_as::<_, PlanAction>(
                "SELECT * FROM plan_actions WHERE plan_id = $1 ORDER BY action_order",
            )
            .bind(plan.id)
            .fetch_all(&mut *tx)
            .await?;
            let stored: Vec<PlanActionInput> = actions
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
            let executions = executions_of_plan(&mut tx, plan.id).await?;
            commit(tx).await?;
            return Ok(ApplyPlanResult {
                plan_id: plan.id,
                reused: true,
                executions,
            });
        }

        let plan: Plan = sqlx::query_as(
            r"INSERT INTO plans (tenant_id, site_id, idempotency_key)
              VALUES ($1, $2, $3)
              RETURNING *",
        )
        .bind(input.tenant_id)
        .bind(input.site_id)
        .bind(&input.idempotency_key)
        .fetch_one(&mut *tx)
        .await?;

        let mut executions = Vec::with_capacity(input.actions.len());
        for (order, action) in input.actions.into_iter().enumerate() {
            let action_row: PlanAction = sqlx::query_as(
                r"INSERT INTO plan_actions (plan_id, action_order, action_type, params, timeout_sec)
                  VALUES ($1, $2, $3, $4, $5)
                  RETURNING *",
            )
            .bind(plan.id)
            .bind(i32::try_from(order).unwrap_or(i32::MAX))
            .bind(action.action_type)
            .bind(&action.params)
            .bind(action.timeout_sec)
            .fetch_one(&mut *tx)
            .await?;
            let execution: Execution = sqlx::query_as(
                r"INSERT INTO executions (plan_id, action_id, status)
                  VALUES ($1, $2, 'PENDING')
                  RETURNING *",
            )
            .bind(plan.id)
            .bind(action_row.id)
            .fetch_one(&mut *tx)
            .await?;
            executions.push(execution);
        }

        commit(tx).await?;
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
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE tenant_id = $1 AND idempotency_key = $2",
        )
        .bind(tenant_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn count_open_plans(&self, tenant_id: Uuid) -> Result<i64, StoreError> {
        let n: i64 = sqlx::query_scalar(
            r"SELECT COUNT(DISTINCT p.id) FROM plans p
              JOIN executions e ON e.plan_id = p.id
              WHERE p.tenant_id = $1
                AND e.status IN ('PENDING', 'LEASED')",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }

    async fn lease_pending_plans(
        &self,
        agent_id: Uuid,
        limit: usize,
        lease_ttl: Duration,
    ) -> Result<Vec<LeasedPlan>, StoreError> {
        let agent = self.agent_by_id(agent_id).await?;
        let lease_expires_at = Utc::now() + lease_ttl;
        let mut tx = self.begin().await?;

        // Row locks with SKIP LOCKED keep concurrent agents from selecting
        // the same executions; the subsequent UPDATE makes the lease durable.
        let rows: Vec<(Uuid, Uuid, Uuid, ActionType, serde_json::Value, i32)> = sqlx::query_as(
            r"SELECT e.id, e.plan_id, a.id, a.action_type, a.params, a.timeout_sec
              FROM executions e
              JOIN plan_actions a ON a.id = e.action_id
              JOIN plans p ON p.id = e.plan_id
              WHERE p.site_id = $1
                AND (e.status = 'PENDING'
                     OR (e.status = 'LEASED' AND e.lease_expires_at < now()))
              ORDER BY p.created_at ASC, a.action_order ASC, a.id ASC
              LIMIT $2
              FOR UPDATE OF e SKIP LOCKED",
        )
        .bind(agent.site_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await?;

        let mut by_plan: Vec<(Uuid, Vec<LeasedAction>)> = Vec::new();
        for (exec_id, plan_id, action_id, action_type, params, timeout_sec) in rows {
            sqlx::query(
                r"UPDATE executions
                  SET status = 'LEASED', agent_id = $2, lease_expires_at = $3
                  WHERE id = $1",
            )
            .bind(exec_id)
            .bind(agent_id)
            .bind(lease_expires_at)
            .execute(&mut *tx)
            .await?;
            let leased = LeasedAction {
                execution_id: exec_id,
                action_id,
                action_type,
                params,
                timeout_sec,
            };
            match by_plan.iter_mut().find(|(p, _)| *p == plan_id) {
                Some((_, actions)) => actions.push(leased),
                None => by_plan.push((plan_id, vec![leased])),
            }
        }

        commit(tx).await?;
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
        let mut tx = self.begin().await?;
        let exec: Execution =
            sqlx::query_as("SELECT * FROM executions WHERE id = $1 FOR UPDATE")
                .bind(report.execution_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::NotFound("execution not found".to_owned()))?;

        let target_status = if report.ok {
            ExecutionStatus::Succeeded
        } else {
            ExecutionStatus::Failed
        };

        if exec.status.is_terminal() {
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
        if exec.lease_expires_at.is_none_or(|exp| exp <= Utc::now()) {
            return Err(StoreError::LeaseLost("lease expired".to_owned()));
        }

        let action = sqlx::query_as::<_, PlanAction>("SELECT * FROM plan_actions WHERE id = $1")
            .bind(exec.action_id)
            .fetch_one(&mut *tx)
            .await?;
        let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(exec.plan_id)
            .fetch_one(&mut *tx)
            .await?;

        if report.ok && action.action_type.mutates_vm() {
            if let Some(next_status) = action.action_type.vm_status_on_success() {
                reconcile_vm_row(&mut tx, &plan, agent_id, &action, next_status).await?;
            }
        }

        let updated: Execution = sqlx::query_as(
            r"UPDATE executions
              SET status = $2, started_at = $3, finished_at = $4,
                  error_code = $5, message = $6, lease_expires_at = NULL
              WHERE id = $1
              RETURNING *",
        )
        .bind(exec.id)
        .bind(target_status)
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(&report.error_code)
        .bind(&report.message)
        .fetch_one(&mut *tx)
        .await?;

        commit(tx).await?;
        Ok(updated)
    }

    async fn list_executions(
        &self,
        tenant_id: Uuid,
        site_id: Option<Uuid>,
    ) -> Result<Vec<Execution>, StoreError> {
        let execs = sqlx::query_as::<_, Execution>(
            r"SELECT e.* FROM executions e
              JOIN plans p ON p.id = e.plan_id
              JOIN plan_actions a ON a.id = e.action_id
              WHERE p.tenant_id = $1 AND ($2::uuid IS NULL OR p.site_id = $2)
              ORDER BY p.created_at, a.action_order",
        )
        .bind(tenant_id)
        .bind(site_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(execs)
    }

    async fn execution_belongs_to_tenant(
        &self,
        execution_id: Uuid,
        tenant_id: Uuid,
    ) -> Result<bool, StoreError> {
        let found: Option<bool> = sqlx::query_scalar(
            r"SELECT true FROM executions e
              JOIN plans p ON p.id = e.plan_id
              WHERE e.id = $1 AND p.tenant_id = $2",
        )
        .bind(execution_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    // ── Execution logs ───────────────────────────────────────────────

    async fn insert_execution_logs(&self, rows: &[LogEntryInput]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin().await?;
        for row in rows {
            sqlx::query(
                r"INSERT INTO execution_logs (execution_id, seq, level, message, at)
                  SELECT $1,
                         COALESCE((SELECT MAX(seq) FROM execution_logs WHERE execution_id = $1), 0) + 1,
                         $2, $3, $4",
            )
            .bind(row.execution_id)
            .bind(&row.level)
            .bind(&row.message)
            .bind(row.at)
            .execute(&mut *tx)
            .await?;
        }
        commit(tx).await
    }

    async fn list_execution_logs(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionLogRow>, StoreError> {
        if !self
            .execution_belongs_to_tenant(execution_id, tenant_id)
            .await?
        {
            return Err(StoreError::NotFound("execution not found".to_owned()));
        }
        let logs = sqlx::query_as::<_, ExecutionLogRow>(
            "SELECT * FROM execution_logs WHERE execution_id = $1 ORDER BY seq",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }

    // ── Audit chain ──────────────────────────────────────────────────

    async fn last_audit_event(&self) -> Result<Option<AuditEvent>, StoreError> {
        let event = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(event)
    }

    async fn write_audit_event(
        &self,
        body: AuditEventBody,
        prev_hash: &str,
        entry_hash: &str,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r"INSERT INTO audit_events
                (tenant_id, site_id, actor_type, actor_user_id, actor_agent_id,
                 action, resource_type, resource_id, request_id, source_ip,
                 metadata_json, occurred_at, prev_hash, entry_hash, chain_valid)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, true)
              RETURNING id",
        )
        .bind(body.tenant_id)
        .bind(body.site_id)
        .bind(body.actor_type)
        .bind(body.actor_user_id)
        .bind(body.actor_agent_id)
        .bind(&body.action)
        .bind(&body.resource_type)
        .bind(&body.resource_id)
        .bind(&body.request_id)
        .bind(&body.source_ip)
        .bind(&body.metadata_json)
        .bind(body.occurred_at)
        .bind(prev_hash)
        .bind(entry_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn set_audit_event_validity(
        &self,
        event_id: i64,
        valid: bool,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE audit_events SET chain_valid = $2 WHERE id = $1")
            .bind(event_id)
            .bind(valid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("audit event not found".to_owned()));
        }
        Ok(())
    }

    async fn list_audit_events(
        &self,
        tenant_id: Uuid,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let events = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE tenant_id = $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(tenant_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn audit_events_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        let events = sqlx::query_as::<_, AuditEvent>(
            "SELECT * FROM audit_events WHERE id > $1 ORDER BY id ASC LIMIT $2",
        )
        .bind(after_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    // ── PKI ──────────────────────────────────────────────────────────

    async fn record_certificate_issuance(
        &self,
        agent_id: Uuid,
        serial: &str,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO certificate_history (agent_id, serial, issued_at, expires_at)
              VALUES ($1, $2, $3, $4)",
        )
        .bind(agent_id)
        .bind(serial)
        .bind(issued_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_certificate_history(
        &self,
        agent_id: Uuid,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        let history = sqlx::query_as::<_, CertificateRecord>(
            "SELECT * FROM certificate_history WHERE agent_id = $1 ORDER BY issued_at DESC",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(history)
    }

    async fn revoke_certificate(
        &self,
        serial: &str,
        reason: &str,
        agent_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        sqlx::query(
            r"INSERT INTO crl (serial, revoked_at, reason)
              VALUES ($1, now(), $2)
              ON CONFLICT (serial) DO NOTHING",
        )
        .bind(serial)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r"UPDATE certificate_history
              SET revoked_at = now(), reason = $3
              WHERE agent_id = $1 AND serial = $2 AND revoked_at IS NULL",
        )
        .bind(agent_id)
        .bind(serial)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        commit(tx).await
    }

    async fn is_certificate_revoked(&self, serial: &str) -> Result<bool, StoreError> {
        let found: Option<bool> = sqlx::query_scalar("SELECT true FROM crl WHERE serial = $1")
            .bind(serial)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn list_revoked_certificates(&self) -> Result<Vec<CrlEntry>, StoreError> {
        let crl = sqlx::query_as::<_, CrlEntry>("SELECT * FROM crl ORDER BY revoked_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(crl)
    }

    // ── Quotas ───────────────────────────────────────────────────────

    async fn tenant_limits(&self, tenant_id: Uuid) -> Result<Option<TenantLimits>, StoreError> {
        let limits = sqlx::query_as::<_, TenantLimits>(
            r"SELECT max_sites, max_agents_per_site, max_vms_per_agent,
                     max_concurrent_plans, max_api_keys
              FROM tenant_limits WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(limits)
    }

    async fn set_tenant_limits(
        &self,
        tenant_id: Uuid,
        limits: TenantLimits,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO tenant_limits
                (tenant_id, max_sites, max_agents_per_site, max_vms_per_agent,
                 max_concurrent_plans, max_api_keys)
              VALUES ($1, $2, $3, $4, $5, $6)
              ON CONFLICT (tenant_id) DO UPDATE SET
                max_sites = EXCLUDED.max_sites,
                max_agents_per_site = EXCLUDED.max_agents_per_site,
                max_vms_per_agent = EXCLUDED.max_vms_per_agent,
                max_concurrent_plans = EXCLUDED.max_concurrent_plans,
                max_api_keys = EXCLUDED.max_api_keys",
        )
        .bind(tenant_id)
        .bind(limits.max_sites)
        .bind(limits.max_agents_per_site)
        .bind(limits.max_vms_per_agent)
        .bind(limits.max_concurrent_plans)
        .bind(limits.max_api_keys)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Load a plan's executions in action order.
async fn executions_of_plan(
    tx: &mut Transaction<'_, Postgres>,
    plan_id: Uuid,
) -> Result<Vec<Execution>, StoreError> {
    let execs = sqlx::query_as::<_, Execution>(
        r"SELECT e.* FROM executions e
          JOIN plan_actions a ON a.id = e.action_id
          WHERE e.plan_id = $1
          ORDER BY a.action_order",
    )
    .bind(plan_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(execs)
}

/// Apply a successful VM-mutating action to the micro-VM row.
///
/// Create upserts by explicit `vm_id` or by `(site, name)`; every other
/// action updates the row it can find and is a no-op otherwise (the
/// heartbeat path will converge the status).
async fn reconcile_vm_row(
    tx: &mut Transaction<'_, Postgres>,
    plan: &Plan,
    agent_id: Uuid,
    action: &PlanAction,
    next_status: crate::models::VmStatus,
) -> Result<(), StoreError> {
    let params = VmActionParams::from_value(&action.params);
    if action.action_type == ActionType::MicroVmCreate {
        let vm_id = params.vm_id.unwrap_or_else(Uuid::new_v4);
        let name = params.name.clone().unwrap_or_else(|| vm_id.to_string());
        sqlx::query(
            r"INSERT INTO microvms
                (id, tenant_id, site_id, agent_id, name, status, vcpu, mem_mib)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
              ON CONFLICT (site_id, name) DO UPDATE SET
                status = EXCLUDED.status,
                agent_id = EXCLUDED.agent_id,
                updated_at = now()",
        )
        .bind(vm_id)
        .bind(plan.tenant_id)
        .bind(plan.site_id)
        .bind(agent_id)
        .bind(&name)
        .bind(next_status)
        .bind(params.vcpu.unwrap_or(1))
        .bind(params.mem_mib.unwrap_or(256))
        .execute(&mut **tx)
        .await?;
        return Ok(());
    }
    match (params.vm_id, params.name) {
        (Some(vm_id), _) => {
            sqlx::query(
                r"UPDATE microvms SET status = $2, agent_id = $3, updated_at = now()
                  WHERE id = $1 AND site_id = $4",
            )
            .bind(vm_id)
            .bind(next_status)
            .bind(agent_id)
            .bind(plan.site_id)
            .execute(&mut **tx)
            .await?;
        }
        (None, Some(name)) => {
            sqlx::query(
                r"UPDATE microvms SET status = $2, agent_id = $3, updated_at = now()
                  WHERE site_id = $4 AND name = $1",
            )
            .bind(&name)
            .bind(next_status)
            .bind(agent_id)
            .bind(plan.site_id)
            .execute(&mut **tx)
            .await?;
        }
        (None, None) => {}
    }
    Ok(())
}
