//! Plan executor.
//!
//! Runs a leased plan's actions in order, one at a time. Every action is
//! bounded by its timeout and recorded in the secure state before its
//! result is reported, so a re-delivered action replays the recorded
//! outcome instead of touching the provider again. The first failure stops
//! the plan; later actions stay unprocessed for the control plane to
//! re-lease or cancel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use tokio::time::timeout;
use uuid::Uuid;

use crate::client::{ActionKind, LeasedAction, LeasedPlan, ResultReport};
use crate::logs::{LogEntry, LogSink};
use crate::provider::{MicroVmProvider, ProviderError, VmSpec};
use crate::state::{ActionRecord, SecureStateStore, VmRecord};

/// Error code reported for any failed action.
const ACTION_FAILED: &str = "ACTION_FAILED";
/// Default timeout when an action does not carry one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// VM-identifying fields inside an action's params blob.
#[derive(Debug, Clone, Default, Deserialize)]
struct VmParams {
    vm_id: Option<String>,
    name: Option<String>,
    vcpu: Option<u32>,
    mem_mib: Option<u64>,
}

/// Command fields inside a `CommandExecute` params blob.
#[derive(Debug, Clone, Deserialize)]
struct CommandParams {
    command: String,
}

/// Executes leased plans against a provider.
pub struct PlanExecutor {
    provider: Arc<dyn MicroVmProvider>,
    state: Arc<SecureStateStore>,
    logs: Arc<dyn LogSink>,
    snapshot_dir: PathBuf,
}

impl PlanExecutor {
    #[must_use]
    pub fn new(
        provider: Arc<dyn MicroVmProvider>,
        state: Arc<SecureStateStore>,
        logs: Arc<dyn LogSink>,
        snapshot_dir: PathBuf,
    ) -> Self {
        Self {
            provider,
            state,
            logs,
            snapshot_dir,
        }
    }

    /// Execute one plan. Returns the reports to send, in action order;
    /// stops after the first failure.
    pub async fn execute(&self, plan: &LeasedPlan) -> Vec<ResultReport> {
        let mut reports = Vec::with_capacity(plan.actions.len());
        for action in &plan.actions {
            let report = self.execute_action(action).await;
            let failed = !report.ok;
            reports.push(report);
            if failed {
                tracing::warn!(
                    plan_id = %plan.plan_id,
                    action_id = %action.action_id,
                    "action failed, stopping plan"
                );
                break;
            }
        }
        reports
    }

    async fn execute_action(&self, action: &LeasedAction) -> ResultReport {
        // Idempotency: a replayed action returns the recorded outcome
        // without re-invoking the provider.
        if let Some(record) = self.state.action_record(action.action_id).await {
            tracing::debug!(action_id = %action.action_id, "replaying cached action result");
            return ResultReport {
                execution_id: record.execution_id,
                ok: record.ok,
                error_code: record.error_code,
                message: record.message,
                started_at: record.started_at,
                finished_at: record.finished_at,
            };
        }

        let started_at = Utc::now();
        let budget = if action.timeout_sec > 0 {
            Duration::from_secs(action.timeout_sec.unsigned_abs().into())
        } else {
            DEFAULT_TIMEOUT
        };

        let outcome = match timeout(budget, self.dispatch(action)).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("deadline exceeded".to_owned()),
        };
        let finished_at = Utc::now();

        let (ok, error_code, message) = match outcome {
            Ok(message) => {
                self.logs
                    .emit(LogEntry::info(
                        action.execution_id,
                        action.action_id,
                        message.clone(),
                    ))
                    .await;
                (true, None, message)
            }
            Err(message) => {
                self.logs
                    .emit(LogEntry::error(
                        action.execution_id,
                        action.action_id,
                        message.clone(),
                    ))
                    .await;
                (false, Some(ACTION_FAILED.to_owned()), message)
            }
        };

        let record = ActionRecord {
            action_id: action.action_id,
            execution_id: action.execution_id,
            ok,
            error_code: error_code.clone(),
            message: message.clone(),
            started_at,
            finished_at,
        };
        if let Err(e) = self
            .state
            .update(|s| {
                s.actions.insert(action.action_id, record.clone());
            })
            .await
        {
            tracing::error!(error = %e, "failed to persist action record");
        }

        ResultReport {
            execution_id: action.execution_id,
            ok,
            error_code,
            message,
            started_at,
            finished_at,
        }
    }

    async fn dispatch(&self, action: &LeasedAction) -> Result<String, ProviderError> {
        match action.kind {
            ActionKind::Create => self.do_create(action).await,
            ActionKind::Start => {
                let vm_id = vm_id_of(action)?;
                self.provider.start(&vm_id).await?;
                self.record_vm_status(&vm_id, "RUNNING").await;
                Ok(format!("vm {vm_id} started"))
            }
            ActionKind::Stop => {
                let vm_id = vm_id_of(action)?;
                self.provider.stop(&vm_id).await?;
                self.record_vm_status(&vm_id, "STOPPED").await;
                Ok(format!("vm {vm_id} stopped"))
            }
            ActionKind::Delete => {
                let vm_id = vm_id_of(action)?;
                self.provider.delete(&vm_id).await?;
                if let Err(e) = self
                    .state
                    .update(|s| {
                        s.microvms.remove(&vm_id);
                    })
                    .await
                {
                    tracing::error!(error = %e, "failed to drop local vm record");
                }
                Ok(format!("vm {vm_id} deleted"))
            }
            ActionKind::Pause => {
                let vm_id = vm_id_of(action)?;
                self.signal_vm(&vm_id, Signal::Stop).await?;
                self.record_vm_status(&vm_id, "PAUSED").await;
                Ok(format!("vm {vm_id} paused"))
            }
            ActionKind::Resume => {
                let vm_id = vm_id_of(action)?;
                self.signal_vm(&vm_id, Signal::Cont).await?;
                self.record_vm_status(&vm_id, "RUNNING").await;
                Ok(format!("vm {vm_id} resumed"))
            }
            ActionKind::Snapshot => self.do_snapshot(action).await,
            ActionKind::Command => self.do_command(action).await,
        }
    }

    async fn do_create(&self, action: &LeasedAction) -> Result<String, ProviderError> {
        let params: VmParams =
            serde_json::from_value(action.params.clone()).unwrap_or_default();
        let vm_id = params
            .vm_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let name = params.name.unwrap_or_else(|| vm_id.clone());
        let spec = VmSpec {
            vm_id: vm_id.clone(),
            name: name.clone(),
            vcpu: params.vcpu.unwrap_or(1),
            mem_mib: params.mem_mib.unwrap_or(256),
        };
        self.provider.create(&spec).await?;
        if let Err(e) = self
            .state
            .update(|s| {
                s.microvms.insert(
                    vm_id.clone(),
                    VmRecord {
                        vm_id: vm_id.clone(),
                        name,
                        status: "RUNNING".to_owned(),
                        updated_at: Utc::now(),
                    },
                );
            })
            .await
        {
            tracing::error!(error = %e, "failed to persist vm record");
        }
        Ok(format!("vm {vm_id} created"))
    }

    /// Pause, copy the disk image into the snapshot directory, write the
    /// metadata JSON, resume.
    async fn do_snapshot(&self, action: &LeasedAction) -> Result<String, ProviderError> {
        let vm_id = vm_id_of(action)?;
        let disk = self.provider.disk_path(&vm_id).await?;

        self.signal_vm(&vm_id, Signal::Stop).await?;
        let result = self.copy_snapshot(&vm_id, &disk).await;
        // Resume even when the copy failed; a paused VM is worse than a
        // missing snapshot.
        if let Err(e) = self.signal_vm(&vm_id, Signal::Cont).await {
            tracing::error!(error = %e, vm_id, "failed to resume vm after snapshot");
        }
        let snapshot_path = result?;
        Ok(format!(
            "vm {vm_id} snapshot written to {}",
            snapshot_path.display()
        ))
    }

    async fn copy_snapshot(
        &self,
        vm_id: &str,
        disk: &std::path::Path,
    ) -> Result<PathBuf, ProviderError> {
        let dir = self.snapshot_dir.join(vm_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::Failure {
                reason: format!("snapshot dir: {e}"),
            })?;
        let taken_at = Utc::now();
        let snapshot_path = dir.join(format!("disk-{}.raw", taken_at.timestamp()));
        tokio::fs::copy(disk, &snapshot_path)
            .await
            .map_err(|e| ProviderError::Failure {
                reason: format!("disk copy: {e}"),
            })?;
        let metadata = serde_json::json!({
            "vm_id": vm_id,
            "source_disk": disk.display().to_string(),
            "snapshot": snapshot_path.display().to_string(),
            "taken_at": taken_at.to_rfc3339(),
        });
        tokio::fs::write(
            dir.join(format!("snapshot-{}.json", taken_at.timestamp())),
            serde_json::to_vec_pretty(&metadata).unwrap_or_default(),
        )
        .await
        .map_err(|e| ProviderError::Failure {
            reason: format!("snapshot metadata: {e}"),
        })?;
        Ok(snapshot_path)
    }

    /// Spawn the shell command with the action's timeout already applied by
    /// the caller. A non-zero exit is still a successful action — the exit
    /// code travels in the message.
    async fn do_command(&self, action: &LeasedAction) -> Result<String, ProviderError> {
        let params: CommandParams =
            serde_json::from_value(action.params.clone()).map_err(|e| {
                ProviderError::Failure {
                    reason: format!("command params: {e}"),
                }
            })?;
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&params.command)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProviderError::Failure {
                reason: format!("spawn failed: {e}"),
            })?;
        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(format!(
            "exit={code} stdout={} stderr={}",
            tail(&stdout, 2048),
            tail(&stderr, 2048),
        ))
    }

    async fn record_vm_status(&self, vm_id: &str, status: &str) {
        if let Err(e) = self
            .state
            .update(|s| {
                if let Some(vm) = s.microvms.get_mut(vm_id) {
                    vm.status = status.to_owned();
                    vm.updated_at = Utc::now();
                }
            })
            .await
        {
            tracing::error!(error = %e, "failed to persist vm status");
        }
    }

    /// SIGSTOP/SIGCONT the VM's host process.
    async fn signal_vm(&self, vm_id: &str, signal: Signal) -> Result<(), ProviderError> {
        let pid = self.provider.pid(vm_id).await?;
        let Some(pid) = pid else {
            // No VMM process (mock provider, or VM not running): the
            // status bookkeeping still applies.
            return Ok(());
        };
        send_signal(pid, signal)
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Stop,
    Cont,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) -> Result<(), ProviderError> {
    let sig = match signal {
        Signal::Stop => libc::SIGSTOP,
        Signal::Cont => libc::SIGCONT,
    };
    let pid = i32::try_from(pid).map_err(|_| ProviderError::Failure {
        reason: format!("pid {pid} out of range"),
    })?;
    // SAFETY: `kill()` is a simple syscall with no preconditions beyond a
    // valid signal constant; the return value is checked below.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(ProviderError::Failure {
            reason: format!("kill({pid}) failed: {}", std::io::Error::last_os_error()),
        })
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: Signal) -> Result<(), ProviderError> {
    Err(ProviderError::Unsupported {
        reason: "process signalling requires unix".to_owned(),
    })
}

fn vm_id_of(action: &LeasedAction) -> Result<String, ProviderError> {
    let params: VmParams = serde_json::from_value(action.params.clone()).unwrap_or_default();
    params
        .vm_id
        .or(params.name)
        .ok_or_else(|| ProviderError::Failure {
            reason: "action params carry neither vm_id nor name".to_owned(),
        })
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[s.len() - max..]
    }
}
