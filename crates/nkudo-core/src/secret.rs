//! Opaque secret generation and hashing.
//!
//! All credentials (API keys, enrollment tokens, refresh tokens) are
//! 256-bit values sourced from the OS CSPRNG (two UUID v4s), carried as
//! `prefix_<64 hex>` strings, and stored only as SHA-256 hex hashes.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Prefix for tenant API keys.
pub const API_KEY_PREFIX: &str = "nk";
/// Prefix for enrollment tokens.
pub const ENROLLMENT_TOKEN_PREFIX: &str = "net";
/// Prefix for agent refresh tokens.
pub const REFRESH_TOKEN_PREFIX: &str = "nrt";

/// Generate a fresh secret: `<prefix>_<64 hex chars>` (256 bits from the
/// OS CSPRNG).
#[must_use]
pub fn generate_secret(prefix: &str) -> String {
    let a = uuid::Uuid::new_v4();
    let b = uuid::Uuid::new_v4();
    format!("{prefix}_{}{}", a.as_simple(), b.as_simple())
}

/// Hash a secret with SHA-256 for storage and lookup.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)
}

/// Extract a display prefix for listings (first 12 chars).
#[must_use]
pub fn display_prefix(secret: &str) -> String {
    let end = secret.len().min(12);
    format!("{}...", &secret[..end])
}

/// Constant-time string equality for credential comparison.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn generated_secrets_are_unique_and_prefixed() {
        let a = generate_secret(API_KEY_PREFIX);
        let b = generate_secret(API_KEY_PREFIX);
        assert_ne!(a, b);
        assert!(a.starts_with("nk_"));
        assert_eq!(a.len(), "nk_".len() + 64);
    }

    #[test]
    fn hashing_is_deterministic_and_hex() {
        let h1 = hash_secret("net_abc");
        let h2 = hash_secret("net_abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn constant_time_eq_matches_semantics() {
        assert!(constant_time_eq("same", "same"));
        assert!(!constant_time_eq("same", "diff"));
        assert!(!constant_time_eq("same", "longer-string"));
    }
}
