//! Encrypted-at-rest local state.
//!
//! One JSON blob holding the agent's identity, its view of local micro-VMs,
//! and the action idempotency cache. Written atomically (`*.tmp`, fsync,
//! rename). With a key the file is AES-256-GCM encrypted:
//!
//! ```text
//! version_byte(0x01) || 12-byte nonce || ciphertext || tag
//! ```
//!
//! The version byte gates future re-keying. A directory that already holds
//! an encrypted file cannot be opened without a key — the store never
//! silently degrades to plaintext.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Plaintext state file name.
const PLAIN_FILE: &str = "edge-state.json";
/// Encrypted state file name.
const ENCRYPTED_FILE: &str = "edge-state-encrypted.json";
/// Current encrypted-envelope version.
const ENVELOPE_VERSION: u8 = 0x01;
/// Nonce length for AES-256-GCM.
const NONCE_LEN: usize = 12;
/// Smallest well-formed envelope: version + nonce + tag.
const MIN_ENVELOPE_LEN: usize = 1 + NONCE_LEN + 16;

/// Errors from the secure state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state directory holds an encrypted file but no key was provided")]
    MissingKey,

    #[error("state key is invalid: {reason}")]
    InvalidKey { reason: String },

    #[error("state file is corrupt: {reason}")]
    Corrupt { reason: String },

    /// Wrong key or tampered ciphertext (the GCM tag fails either way).
    #[error("state decryption failed")]
    Decrypt,

    #[error("state encryption failed: {reason}")]
    Encrypt { reason: String },

    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration refused: {reason}")]
    Migration { reason: String },
}

/// 32-byte state key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StateKey([u8; 32]);

impl StateKey {
    /// Parse `NKUDO_STATE_KEY`: either raw 32 bytes or base64 of 32 bytes.
    pub fn parse(value: &str) -> Result<Self, StateError> {
        let raw = value.as_bytes();
        if raw.len() == 32 {
            let mut key = [0u8; 32];
            key.copy_from_slice(raw);
            return Ok(Self(key));
        }
        let decoded = BASE64.decode(value).map_err(|e| StateError::InvalidKey {
            reason: format!("not raw 32 bytes and base64 decode failed: {e}"),
        })?;
        if decoded.len() != 32 {
            return Err(StateError::InvalidKey {
                reason: format!("decoded key is {} bytes, want 32", decoded.len()),
            });
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&decoded);
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

// ── Record types ─────────────────────────────────────────────────────

/// The agent's enrolled identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub agent_id: Uuid,
    pub server_url: String,
    pub refresh_token: String,
    pub cert_expires_at: DateTime<Utc>,
}

/// Local view of one micro-VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub vm_id: String,
    pub name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Cached outcome of one executed action, replayed on retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub action_id: Uuid,
    pub execution_id: Uuid,
    pub ok: bool,
    pub error_code: Option<String>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The whole persisted blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeState {
    pub identity: Option<AgentIdentity>,
    #[serde(default)]
    pub microvms: HashMap<String, VmRecord>,
    #[serde(default)]
    pub actions: HashMap<Uuid, ActionRecord>,
}

// ── Store ────────────────────────────────────────────────────────────

/// The on-disk store. All mutation goes through [`SecureStateStore::update`]
/// which persists atomically before returning.
#[derive(Debug)]
pub struct SecureStateStore {
    dir: PathBuf,
    key: Option<StateKey>,
    state: Mutex<EdgeState>,
}

impl SecureStateStore {
    /// Open (or initialize) the state in `dir`.
    ///
    /// An existing encrypted file requires `key`; an existing plaintext
    /// file loads as-is (use [`migrate_to_encrypted`] to convert); an empty
    /// directory starts fresh, encrypted iff a key is present.
    pub fn open(dir: &Path, key: Option<StateKey>) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir)?;
        let encrypted_path = dir.join(ENCRYPTED_FILE);
        let plain_path = dir.join(PLAIN_FILE);

        let state = if encrypted_path.exists() {
            let Some(ref key) = key else {
                return Err(StateError::MissingKey);
            };
            let envelope = std::fs::read(&encrypted_path)?;
            let plaintext = decrypt_envelope(key, &envelope)?;
            parse_state(&plaintext)?
        } else if plain_path.exists() {
            let bytes = std::fs::read(&plain_path)?;
            parse_state(&bytes)?
        } else {
            EdgeState::default()
        };

        Ok(Self {
            dir: dir.to_owned(),
            key,
            state: Mutex::new(state),
        })
    }

    /// Read a copy of the current state.
    pub async fn load(&self) -> EdgeState {
        self.state.lock().await.clone()
    }

    /// Mutate the state and persist it atomically before returning.
    pub async fn update<F>(&self, mutate: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut EdgeState),
    {
        let mut guard = self.state.lock().await;
        mutate(&mut guard);
        self.persist(&guard)
    }

    /// Cached action outcome, if this action already ran.
    pub async fn action_record(&self, action_id: Uuid) -> Option<ActionRecord> {
        self.state.lock().await.actions.get(&action_id).cloned()
    }

    fn path(&self) -> PathBuf {
        if self.key.is_some() {
            self.dir.join(ENCRYPTED_FILE)
        } else {
            self.dir.join(PLAIN_FILE)
        }
    }

    fn persist(&self, state: &EdgeState) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupt {
            reason: format!("serialize failed: {e}"),
        })?;
        let bytes = match &self.key {
            Some(key) => encrypt_envelope(key, &json)?,
            None => json,
        };
        write_atomic(&self.path(), &bytes)?;
        Ok(())
    }
}

/// Convert a plaintext state file to encrypted, once.
///
/// Refuses when the source already looks encrypted or when an encrypted
/// file is already present.
pub fn migrate_to_encrypted(dir: &Path, key: &StateKey) -> Result<(), StateError> {
    let plain_path = dir.join(PLAIN_FILE);
    let encrypted_path = dir.join(ENCRYPTED_FILE);
    if encrypted_path.exists() {
        return Err(StateError::Migration {
            reason: "encrypted state already exists".to_owned(),
        });
    }
    let bytes = std::fs::read(&plain_path)?;
    if bytes.first() == Some(&ENVELOPE_VERSION) && serde_json::from_slice::<EdgeState>(&bytes).is_err()
    {
        return Err(StateError::Migration {
            reason: "source file already looks encrypted".to_owned(),
        });
    }
    // Round-trip through the model so garbage never gets sealed.
    let state = parse_state(&bytes)?;
    let json = serde_json::to_vec_pretty(&state).map_err(|e| StateError::Corrupt {
        reason: format!("serialize failed: {e}"),
    })?;
    write_atomic(&encrypted_path, &encrypt_envelope(key, &json)?)?;
    std::fs::remove_file(&plain_path)?;
    Ok(())
}

fn parse_state(bytes: &[u8]) -> Result<EdgeState, StateError> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Corrupt {
        reason: format!("parse failed: {e}"),
    })
}

fn encrypt_envelope(key: &StateKey, plaintext: &[u8]) -> Result<Vec<u8>, StateError> {
    let cipher = key.cipher();
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| StateError::Encrypt {
            reason: e.to_string(),
        })?;
    let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    envelope.push(ENVELOPE_VERSION);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&ciphertext);
    Ok(envelope)
}

fn decrypt_envelope(key: &StateKey, envelope: &[u8]) -> Result<Vec<u8>, StateError> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(StateError::Corrupt {
            reason: format!(
                "envelope is {} bytes, want at least {MIN_ENVELOPE_LEN}",
                envelope.len()
            ),
        });
    }
    if envelope[0] != ENVELOPE_VERSION {
        return Err(StateError::Corrupt {
            reason: format!("unknown envelope version {:#04x}", envelope[0]),
        });
    }
    let nonce = Nonce::from_slice(&envelope[1..=NONCE_LEN]);
    key.cipher()
        .decrypt(nonce, &envelope[1 + NONCE_LEN..])
        .map_err(|_| StateError::Decrypt)
}

/// Write-to-tmp, fsync, rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key() -> StateKey {
        StateKey::parse(&BASE64.encode([7u8; 32])).unwrap()
    }

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_id: Uuid::new_v4(),
            server_url: "https://control.example".to_owned(),
            refresh_token: "nrt_test".to_owned(),
            cert_expires_at: Utc::now(),
        }
    }

    #[test]
    fn key_parses_raw_and_base64() {
        let raw: String = "0123456789abcdef0123456789abcdef".to_owned();
        assert!(StateKey::parse(&raw).is_ok());
        assert!(StateKey::parse(&BASE64.encode([1u8; 32])).is_ok());
        assert!(StateKey::parse("short").is_err());
        assert!(StateKey::parse(&BASE64.encode([1u8; 16])).is_err());
    }

    #[tokio::test]
    async fn save_close_open_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity();
        {
            let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
            store
                .update(|s| s.identity = Some(id.clone()))
                .await
                .unwrap();
        }
        let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
        let state = store.load().await;
        assert_eq!(state.identity.unwrap().agent_id, id.agent_id);
    }

    #[tokio::test]
    async fn encrypted_file_without_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
            store.update(|_| {}).await.unwrap();
        }
        let err = SecureStateStore::open(dir.path(), None).unwrap_err();
        assert!(matches!(err, StateError::MissingKey));
    }

    #[tokio::test]
    async fn wrong_key_fails_decryption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
            store.update(|_| {}).await.unwrap();
        }
        let other = StateKey::parse(&BASE64.encode([9u8; 32])).unwrap();
        let err = SecureStateStore::open(dir.path(), Some(other)).unwrap_err();
        assert!(matches!(err, StateError::Decrypt));
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_decryption() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
            store.update(|_| {}).await.unwrap();
        }
        let path = dir.path().join(ENCRYPTED_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = SecureStateStore::open(dir.path(), Some(key())).unwrap_err();
        assert!(matches!(err, StateError::Decrypt));
    }

    #[tokio::test]
    async fn unknown_envelope_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
            store.update(|_| {}).await.unwrap();
        }
        let path = dir.path().join(ENCRYPTED_FILE);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = 0x02;
        std::fs::write(&path, &bytes).unwrap();

        let err = SecureStateStore::open(dir.path(), Some(key())).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn migration_encrypts_once_and_refuses_twice() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity();
        {
            let store = SecureStateStore::open(dir.path(), None).unwrap();
            store
                .update(|s| s.identity = Some(id.clone()))
                .await
                .unwrap();
        }
        migrate_to_encrypted(dir.path(), &key()).unwrap();
        assert!(!dir.path().join(PLAIN_FILE).exists());

        // The data survived the conversion.
        let store = SecureStateStore::open(dir.path(), Some(key())).unwrap();
        assert_eq!(
            store.load().await.identity.unwrap().agent_id,
            id.agent_id
        );

        // A second migration refuses: the plaintext is gone and the
        // encrypted file exists.
        let err = migrate_to_encrypted(dir.path(), &key()).unwrap_err();
        assert!(matches!(err, StateError::Migration { .. }));
    }

    #[tokio::test]
    async fn action_records_persist() {
        let dir = tempfile::tempdir().unwrap();
        let action_id = Uuid::new_v4();
        {
            let store = SecureStateStore::open(dir.path(), None).unwrap();
            store
                .update(|s| {
                    s.actions.insert(
                        action_id,
                        ActionRecord {
                            action_id,
                            execution_id: Uuid::new_v4(),
                            ok: true,
                            error_code: None,
                            message: "done".to_owned(),
                            started_at: Utc::now(),
                            finished_at: Utc::now(),
                        },
                    );
                })
                .await
                .unwrap();
        }
        let store = SecureStateStore::open(dir.path(), None).unwrap();
        let record = store.action_record(action_id).await.unwrap();
        assert!(record.ok);
        assert_eq!(record.message, "done");
    }
}
