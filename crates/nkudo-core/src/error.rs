//! Error types for `nkudo-core`.
//!
//! Each subsystem owns its error enum; store errors pass through unchanged so
//! the edge can map every failure to the right status without string
//! matching. PKI errors never carry key material.

use nkudo_store::StoreError;

/// Errors from the certificate authority.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// The CA key or certificate could not be loaded or generated.
    #[error("CA unavailable: {reason}")]
    CaUnavailable { reason: String },

    /// The submitted CSR did not parse or its signature is invalid.
    #[error("invalid CSR: {reason}")]
    InvalidCsr { reason: String },

    /// Certificate signing failed.
    #[error("certificate signing failed: {reason}")]
    Signing { reason: String },

    /// The presented refresh token does not match the agent's current one.
    #[error("refresh token mismatch")]
    RefreshMismatch,

    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from enrollment.
#[derive(Debug, thiserror::Error)]
pub enum EnrollError {
    /// The store returned an error (unknown token, expired, already used).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Signing the agent's first certificate failed.
    #[error(transparent)]
    Pki(#[from] PkiError),
}

/// Errors from the isolation predicate layer.
#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    /// The resource belongs to a different tenant (or does not exist —
    /// deliberately indistinguishable).
    #[error("tenant isolation violation on {resource_type} {resource_id}")]
    Violation {
        resource_type: &'static str,
        resource_id: String,
    },

    /// The store returned an error while resolving ownership.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from quota checks.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// `current + requested` would exceed the tenant's limit.
    #[error("quota exceeded for {resource}: {current} + {requested} > {limit}")]
    Exceeded {
        resource: &'static str,
        limit: i64,
        current: i64,
        requested: i64,
    },

    /// The usage provider failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from plan application.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    /// The plan body failed validation.
    #[error("invalid plan: {reason}")]
    Invalid { reason: String },

    /// The target site belongs to a different tenant.
    #[error(transparent)]
    Isolation(#[from] IsolationError),

    /// A create in the plan would exceed the tenant's VM quota.
    #[error(transparent)]
    Quota(#[from] QuotaError),

    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the audit chain.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Canonical serialization of the event body failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] StoreError),
}
