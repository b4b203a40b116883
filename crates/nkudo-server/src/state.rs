//! Shared application state.

use std::sync::Arc;

use tokio::sync::RwLock;

use nkudo_core::audit::{ChainWriter, VerifyReport};
use nkudo_core::enroll::EnrollmentService;
use nkudo_core::heartbeat::HeartbeatService;
use nkudo_core::isolation::IsolationGuard;
use nkudo_core::lease::LeaseService;
use nkudo_core::logsink::LogBuffer;
use nkudo_core::pki::CertificateAuthority;
use nkudo_core::plan::PlanService;
use nkudo_core::quota::QuotaService;
use nkudo_store::Repository;

/// Everything the handlers share. Cheap to clone via `Arc`.
pub struct AppState {
    pub repo: Arc<dyn Repository>,
    pub ca: Arc<CertificateAuthority>,
    pub enrollment: EnrollmentService,
    pub plans: PlanService,
    pub leases: LeaseService,
    pub heartbeats: HeartbeatService,
    pub quotas: Arc<QuotaService>,
    pub isolation: Arc<IsolationGuard>,
    pub audit: Arc<ChainWriter>,
    pub logs: LogBuffer,
    /// Last background verification result, for observability.
    pub audit_report: Arc<RwLock<Option<VerifyReport>>>,
    /// Admin bearer key; admin routes reject everything when `None`.
    pub admin_key: Option<String>,
    /// Cap on caller-requested enrollment-token TTLs, seconds.
    pub max_token_ttl_secs: i64,
}
