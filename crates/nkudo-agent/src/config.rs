//! Agent configuration.

use std::path::PathBuf;

use crate::state::{StateError, StateKey};

/// Environment variable carrying the secure-state key (raw 32 bytes or
/// base64).
pub const STATE_KEY_ENV: &str = "NKUDO_STATE_KEY";

/// Resolved agent configuration, built from CLI flags.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_url: String,
    pub state_dir: PathBuf,
    pub pki_dir: PathBuf,
    /// Per-VM runtime artifacts (snapshots land under here).
    pub runtime_dir: PathBuf,
    pub heartbeat_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub lease_limit: usize,
    /// Renew the client certificate when less than this many hours remain.
    pub renew_window_hours: i64,
}

/// Read the secure-state key from the environment.
///
/// Absence selects unencrypted mode (the store itself still refuses to
/// open an encrypted file without a key); a present-but-malformed key is
/// an error, never a silent downgrade.
pub fn state_key_from_env() -> Result<Option<StateKey>, StateError> {
    match std::env::var(STATE_KEY_ENV) {
        Ok(value) => Ok(Some(StateKey::parse(&value)?)),
        Err(_) => Ok(None),
    }
}
