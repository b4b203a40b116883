//! HTTP error mapping.
//!
//! Every core/store error kind maps to one status code at this edge:
//!
//! | kind | status |
//! |------|--------|
//! | not found | 404 |
//! | conflict / lease lost | 409 |
//! | enrollment token consumed or expired | 410 |
//! | invalid input / bad CSR | 400 |
//! | missing or bad credential | 401 |
//! | tenant isolation violation | 403 |
//! | quota exceeded | 429 |
//! | store backend failure | 503 |
//! | invariant violation / signing failure | 500 |

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use nkudo_core::{AuditError, EnrollError, IsolationError, PkiError, PlanError, QuotaError};
use nkudo_store::StoreError;

/// API error with a stable machine-readable type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// One-shot resource is used up (consumed or expired enrollment token).
    #[error("gone: {0}")]
    Gone(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("quota exceeded for {resource}: {current} + {requested} > {limit}")]
    QuotaExceeded {
        resource: &'static str,
        limit: i64,
        current: i64,
        requested: i64,
    },

    #[error("lease lost: {0}")]
    LeaseLost(String),

    /// Retryable store failure.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current: Option<i64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message, limits) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg, None),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg, None),
            Self::Gone(msg) => (StatusCode::GONE, "gone", msg, None),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg, None),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg, None),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg, None),
            Self::QuotaExceeded {
                resource,
                limit,
                current,
                requested,
            } => (
                StatusCode::TOO_MANY_REQUESTS,
                "quota_exceeded",
                format!("{resource}: {current} + {requested} > {limit}"),
                Some((limit, current)),
            ),
            Self::LeaseLost(msg) => (StatusCode::CONFLICT, "lease_lost", msg, None),
            Self::Transient(msg) => {
                tracing::warn!(error = %msg, "store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "unavailable",
                    "store temporarily unavailable".to_owned(),
                    None,
                )
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "internal server error".to_owned(),
                    None,
                )
            }
        };
        let body = ErrorBody {
            error: error_type,
            message,
            limit: limits.map(|(l, _)| l),
            current: limits.map(|(_, c)| c),
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::AlreadyConsumed => {
                Self::Gone("enrollment token already consumed".to_owned())
            }
            StoreError::Expired(msg) | StoreError::Unauthorized(msg) => Self::Unauthorized(msg),
            StoreError::Invalid(msg) => Self::BadRequest(msg),
            StoreError::LeaseLost(msg) => Self::LeaseLost(msg),
            StoreError::Backend(msg) => Self::Transient(msg),
        }
    }
}

impl From<PkiError> for ApiError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::InvalidCsr { reason } => Self::BadRequest(reason),
            PkiError::RefreshMismatch => {
                Self::Unauthorized("refresh token mismatch".to_owned())
            }
            PkiError::CaUnavailable { reason } | PkiError::Signing { reason } => {
                Self::Internal(reason)
            }
            PkiError::Store(e) => e.into(),
        }
    }
}

impl From<EnrollError> for ApiError {
    fn from(err: EnrollError) -> Self {
        match err {
            // Enrollment tokens are single-use artifacts: both "already
            // consumed" and "expired" read as 410, unlike long-lived
            // credentials.
            EnrollError::Store(StoreError::AlreadyConsumed) => {
                Self::Gone("enrollment token already consumed".to_owned())
            }
            EnrollError::Store(StoreError::Expired(msg)) => Self::Gone(msg),
            EnrollError::Store(e) => e.into(),
            EnrollError::Pki(e) => e.into(),
        }
    }
}

impl From<IsolationError> for ApiError {
    fn from(err: IsolationError) -> Self {
        match err {
            IsolationError::Violation { .. } => {
                Self::Forbidden("resource belongs to another tenant".to_owned())
            }
            IsolationError::Store(e) => e.into(),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded {
                resource,
                limit,
                current,
                requested,
            } => Self::QuotaExceeded {
                resource,
                limit,
                current,
                requested,
            },
            QuotaError::Store(e) => e.into(),
        }
    }
}

impl From<PlanError> for ApiError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Invalid { reason } => Self::BadRequest(reason),
            PlanError::Isolation(e) => e.into(),
            PlanError::Quota(e) => e.into(),
            PlanError::Store(e) => e.into(),
        }
    }
}

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Serialization { reason } => Self::Internal(reason),
            AuditError::Store(e) => e.into(),
        }
    }
}
