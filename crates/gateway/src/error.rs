//! Errors returned across the request boundary.

use std::{fmt, sync::Arc};

use bilicore_authn::{AuthError, AuthErrorKind};
use bilicore_cache::CacheError;
use bilicore_store::{StoreError, StoreKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Stable error codes reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Missing, malformed, expired or revoked session.
    AuthenticationFailed,
    /// The caller's role does not permit the operation.
    AccessDenied,
    /// The resource belongs to another user.
    WrongUser,
    /// No such entity.
    ArNotFound,
    /// A dependency is temporarily unavailable; the call may be retried.
    ServiceUnavailable,
    /// Anything else.
    SystemError,
}

impl ErrorCode {
    /// HTTP status the code is reported with.
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            Self::AuthenticationFailed => 401,
            Self::AccessDenied | Self::WrongUser => 403,
            Self::ArNotFound => 404,
            Self::SystemError => 500,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::WrongUser => "WRONG_USER",
            Self::ArNotFound => "AR_NOT_FOUND",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`ConsistencyGateway`](crate::ConsistencyGateway).
///
/// Cache outages never appear here on the read and write paths; the gateway
/// degrades to the authoritative store instead.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// The session was rejected.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// The entity does not exist in its authoritative store.
    #[error("{kind} entity '{id}' not found")]
    NotFound {
        /// Store queried.
        kind: StoreKind,
        /// Entity requested.
        id: String,
    },

    /// The authoritative store failed.
    ///
    /// Shared because one failed load is delivered to every coalesced reader.
    #[error("authoritative store error: {source}")]
    Store {
        /// Underlying store failure.
        #[source]
        source: Arc<StoreError>,
    },

    /// A pass-through cache operation failed.
    #[error("cache error: {0}")]
    Cache(#[source] CacheError),

    /// Session validation did not finish within the call timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// What was being waited on.
        operation: &'static str,
    },

    /// No store of this kind was registered.
    #[error("no {0} store registered")]
    UnknownStore(StoreKind),
}

impl GatewayError {
    /// Classifies a store failure, lifting not-found out of the store error.
    pub(crate) fn from_store(source: Arc<StoreError>) -> Self {
        if let StoreError::NotFound { kind, id } = source.as_ref() {
            return Self::NotFound { kind: *kind, id: id.to_string() };
        }
        Self::Store { source }
    }

    /// Whether the caller may retry the same request.
    ///
    /// Authentication failures never are.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { source } => source.is_retryable(),
            Self::Cache(err) => err.is_unavailable(),
            Self::Timeout { .. } => true,
            Self::Auth(err) => matches!(err, AuthError::RevocationUnavailable(_)),
            Self::NotFound { .. } | Self::UnknownStore(_) => false,
        }
    }

    /// Client-facing error code.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Auth(AuthError::WrongUser { .. }) => ErrorCode::WrongUser,
            Self::Auth(err) => match err.kind() {
                AuthErrorKind::Expired | AuthErrorKind::Invalid | AuthErrorKind::Revoked => {
                    ErrorCode::AuthenticationFailed
                },
                AuthErrorKind::Forbidden => ErrorCode::AccessDenied,
                AuthErrorKind::Unavailable if self.is_retryable() => ErrorCode::ServiceUnavailable,
                AuthErrorKind::Unavailable => ErrorCode::SystemError,
            },
            Self::NotFound { .. } => ErrorCode::ArNotFound,
            _ if self.is_retryable() => ErrorCode::ServiceUnavailable,
            _ => ErrorCode::SystemError,
        }
    }

    /// HTTP status of [`error_code`](Self::error_code).
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.error_code().status()
    }
}
