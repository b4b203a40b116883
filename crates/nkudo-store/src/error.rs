//! Error type for the store boundary.
//!
//! Logical failures (not found, conflict, already used, expired, lease lost)
//! are distinct variants so callers can branch on kind; database failures are
//! surfaced verbatim under [`StoreError::Backend`] and are the only variant
//! eligible for retry. The store never retries internally.

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The target row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint was violated (slug, idempotency key with a
    /// differing body, duplicate serial).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The enrollment token was already consumed.
    #[error("enrollment token already consumed")]
    AlreadyConsumed,

    /// A token, key, or certificate is past its expiry.
    #[error("expired: {0}")]
    Expired(String),

    /// Malformed or unknown input (bad hash, unknown action type).
    #[error("invalid: {0}")]
    Invalid(String),

    /// A credential exists but is not usable (revoked key, wrong refresh token).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A result report arrived for a lease the agent no longer holds.
    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// The underlying database failed; the caller may retry.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_owned()),
            sqlx::Error::Database(db_err) => {
                // PostgreSQL unique violation
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict("unique constraint violated".to_owned())
                } else {
                    Self::Backend(format!("database error: {db_err}"))
                }
            }
            _ => Self::Backend(format!("database error: {err}")),
        }
    }
}
