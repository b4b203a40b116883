//! Micro-VM provider interface.
//!
//! The executor drives VM lifecycle through this capability trait; the
//! concrete hypervisor integration (Firecracker, Cloud Hypervisor) lives
//! behind it and is out of scope here. [`MockProvider`] is the in-memory
//! implementation used by tests and `--provider mock` dev runs; it counts
//! invocations so idempotency can be asserted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// Errors from a provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("vm not found: {vm_id}")]
    NotFound { vm_id: String },

    #[error("provider failure: {reason}")]
    Failure { reason: String },

    #[error("operation not supported on this platform: {reason}")]
    Unsupported { reason: String },
}

/// What a create call asks for.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub vm_id: String,
    pub name: String,
    pub vcpu: u32,
    pub mem_mib: u64,
}

/// A provider's handle on a created VM.
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub vm_id: String,
    /// Host process id of the VMM, for pause/resume signalling.
    pub pid: Option<u32>,
    /// Backing disk image, for snapshots.
    pub disk_path: PathBuf,
}

/// Capability interface the executor dispatches VM actions through.
#[async_trait::async_trait]
pub trait MicroVmProvider: Send + Sync + 'static {
    /// Create and boot a VM.
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, ProviderError>;

    /// Start a stopped VM.
    async fn start(&self, vm_id: &str) -> Result<(), ProviderError>;

    /// Stop a running VM.
    async fn stop(&self, vm_id: &str) -> Result<(), ProviderError>;

    /// Delete a VM and its local resources.
    async fn delete(&self, vm_id: &str) -> Result<(), ProviderError>;

    /// The VMM's host process id, if running.
    async fn pid(&self, vm_id: &str) -> Result<Option<u32>, ProviderError>;

    /// Path of the VM's backing disk image.
    async fn disk_path(&self, vm_id: &str) -> Result<PathBuf, ProviderError>;
}

// ── Mock ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct MockVm {
    running: bool,
    disk_path: PathBuf,
}

/// In-memory provider for tests and dev runs.
#[derive(Default)]
pub struct MockProvider {
    vms: Mutex<HashMap<String, MockVm>>,
    invocations: AtomicU64,
    /// When set, every call fails with this reason.
    fail_with: Option<String>,
}

impl MockProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider whose every call fails, for failure-path tests.
    #[must_use]
    pub fn failing(reason: &str) -> Self {
        Self {
            fail_with: Some(reason.to_owned()),
            ..Self::default()
        }
    }

    /// Total provider invocations so far.
    pub fn invocation_count(&self) -> u64 {
        self.invocations.load(Ordering::SeqCst)
    }

    fn tick(&self) -> Result<(), ProviderError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(reason) => Err(ProviderError::Failure {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl MicroVmProvider for MockProvider {
    async fn create(&self, spec: &VmSpec) -> Result<VmHandle, ProviderError> {
        self.tick()?;
        let disk_path = PathBuf::from(format!("/tmp/nkudo-mock/{}/disk.raw", spec.vm_id));
        self.vms.lock().await.insert(
            spec.vm_id.clone(),
            MockVm {
                running: true,
                disk_path: disk_path.clone(),
            },
        );
        Ok(VmHandle {
            vm_id: spec.vm_id.clone(),
            pid: None,
            disk_path,
        })
    }

    async fn start(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.tick()?;
        let mut vms = self.vms.lock().await;
        let vm = vms.get_mut(vm_id).ok_or_else(|| ProviderError::NotFound {
            vm_id: vm_id.to_owned(),
        })?;
        vm.running = true;
        Ok(())
    }

    async fn stop(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.tick()?;
        let mut vms = self.vms.lock().await;
        let vm = vms.get_mut(vm_id).ok_or_else(|| ProviderError::NotFound {
            vm_id: vm_id.to_owned(),
        })?;
        vm.running = false;
        Ok(())
    }

    async fn delete(&self, vm_id: &str) -> Result<(), ProviderError> {
        self.tick()?;
        self.vms
            .lock()
            .await
            .remove(vm_id)
            .ok_or_else(|| ProviderError::NotFound {
                vm_id: vm_id.to_owned(),
            })?;
        Ok(())
    }

    async fn pid(&self, vm_id: &str) -> Result<Option<u32>, ProviderError> {
        self.tick()?;
        if !self.vms.lock().await.contains_key(vm_id) {
            return Err(ProviderError::NotFound {
                vm_id: vm_id.to_owned(),
            });
        }
        // The mock has no real VMM process.
        Ok(None)
    }

    async fn disk_path(&self, vm_id: &str) -> Result<PathBuf, ProviderError> {
        self.tick()?;
        let vms = self.vms.lock().await;
        let vm = vms.get(vm_id).ok_or_else(|| ProviderError::NotFound {
            vm_id: vm_id.to_owned(),
        })?;
        Ok(vm.disk_path.clone())
    }
}
