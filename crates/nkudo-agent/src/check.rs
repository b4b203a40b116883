//! Pre-flight checks.
//!
//! `nkudo-agent check` runs every check and prints one CSV row per result:
//! `check,ok,detail`. The process exits non-zero when any check fails.

use crate::client::ControlPlaneClient;
use crate::config::{state_key_from_env, AgentConfig};
use crate::state::SecureStateStore;

/// One check outcome.
#[derive(Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub ok: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            detail: detail.into(),
        }
    }

    /// CSV row. Commas in details are replaced so the row stays parseable.
    #[must_use]
    pub fn csv(&self) -> String {
        format!(
            "{},{},{}",
            self.name,
            self.ok,
            self.detail.replace(',', ";")
        )
    }
}

/// Run all pre-flight checks.
pub async fn run_checks(config: &AgentConfig) -> Vec<CheckResult> {
    let mut results = Vec::new();

    // State directory must be writable.
    results.push(match std::fs::create_dir_all(&config.state_dir) {
        Ok(()) => {
            let probe = config.state_dir.join(".write-probe");
            match std::fs::write(&probe, b"ok") {
                Ok(()) => {
                    let _ = std::fs::remove_file(&probe);
                    CheckResult::pass("state_dir_writable", config.state_dir.display().to_string())
                }
                Err(e) => CheckResult::fail("state_dir_writable", e.to_string()),
            }
        }
        Err(e) => CheckResult::fail("state_dir_writable", e.to_string()),
    });

    // The state key, when present, must parse; and the store must open
    // with whatever combination exists on disk.
    let key = match state_key_from_env() {
        Ok(key) => {
            results.push(CheckResult::pass(
                "state_key",
                if key.is_some() { "present" } else { "absent" },
            ));
            key
        }
        Err(e) => {
            results.push(CheckResult::fail("state_key", e.to_string()));
            None
        }
    };
    results.push(
        match SecureStateStore::open(&config.state_dir, key) {
            Ok(_) => CheckResult::pass("state_openable", "ok"),
            Err(e) => CheckResult::fail("state_openable", e.to_string()),
        },
    );

    // PKI material present (enrollment writes it).
    let pki_complete = ["client.key", "client.crt", "ca.crt"]
        .iter()
        .all(|f| config.pki_dir.join(f).exists());
    results.push(if pki_complete {
        CheckResult::pass("pki_material", config.pki_dir.display().to_string())
    } else {
        CheckResult::fail(
            "pki_material",
            format!("missing files under {}", config.pki_dir.display()),
        )
    });

    // Control plane reachable.
    results.push(
        match ControlPlaneClient::unauthenticated(&config.server_url) {
            Ok(client) => match client.healthz().await {
                Ok(()) => CheckResult::pass("server_reachable", config.server_url.clone()),
                Err(e) => CheckResult::fail("server_reachable", e.to_string()),
            },
            Err(e) => CheckResult::fail("server_reachable", e.to_string()),
        },
    );

    results
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn csv_escapes_commas() {
        let result = CheckResult::fail("server_reachable", "error, with comma");
        assert_eq!(result.csv(), "server_reachable,false,error; with comma");
    }
}
