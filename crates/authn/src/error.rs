//! Authentication error types.

use std::time::Duration;

use bilicore_cache::CacheError;
use thiserror::Error;

/// Coarse classification of an [`AuthError`] as seen by request handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthErrorKind {
    /// The token was genuine but its lifetime has passed.
    Expired,
    /// The token is malformed, forged, or signed by an unknown key.
    Invalid,
    /// The token was explicitly revoked.
    Revoked,
    /// The caller is authenticated but not allowed to do this.
    Forbidden,
    /// The operation could not be completed for reasons unrelated to the token.
    Unavailable,
}

/// Authentication and authorization errors.
///
/// None of these are retried automatically.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Malformed token: cannot be split, decoded or parsed.
    #[error("Invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Signature verification failed.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Algorithm not in the allow-list.
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The `kid` header names no known verification key.
    #[error("Unknown signing key: {kid}")]
    UnknownKey {
        /// Key ID from the token header.
        kid: String,
    },

    /// The token was issued by someone else.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// Required claim is missing.
    #[error("Missing claim: {0}")]
    MissingClaim(String),

    /// Token lifetime has passed.
    #[error("Token expired")]
    TokenExpired,

    /// Token was revoked before its natural expiry.
    #[error("Token revoked")]
    TokenRevoked,

    /// Renewal requested while the token still has plenty of life left.
    #[error("Token renewal too early: {remaining:?} remaining")]
    RenewalTooEarly {
        /// Lifetime left on the presented token.
        remaining: Duration,
    },

    /// Requested lifetime is zero or above the configured ceiling.
    #[error("Invalid token lifetime: {0}")]
    InvalidLifetime(String),

    /// Key material could not be parsed.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Signing failed.
    #[error("Token encoding failed: {0}")]
    Encoding(String),

    /// No authenticated user.
    #[error("Authentication required")]
    NotLoggedIn,

    /// Authenticated, but the role does not permit the operation.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Authenticated as a different user than the resource owner.
    #[error("Wrong user: session belongs to {actual}, resource to {expected}")]
    WrongUser {
        /// User the resource belongs to.
        expected: String,
        /// User the session belongs to.
        actual: String,
    },

    /// The revocation set could not be read or written.
    #[error("Revocation set unavailable: {0}")]
    RevocationUnavailable(#[source] CacheError),
}

impl AuthError {
    /// Creates an `InvalidTokenFormat` error.
    #[must_use]
    pub fn invalid_token_format(message: impl Into<String>) -> Self {
        Self::InvalidTokenFormat(message.into())
    }

    /// Creates a `MissingClaim` error.
    #[must_use]
    pub fn missing_claim(claim: impl Into<String>) -> Self {
        Self::MissingClaim(claim.into())
    }

    /// Creates an `UnknownKey` error.
    #[must_use]
    pub fn unknown_key(kid: impl Into<String>) -> Self {
        Self::UnknownKey { kid: kid.into() }
    }

    /// Creates an `AccessDenied` error.
    #[must_use]
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::AccessDenied(message.into())
    }

    /// Classifies this error.
    #[must_use]
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            Self::TokenExpired => AuthErrorKind::Expired,
            Self::TokenRevoked => AuthErrorKind::Revoked,
            Self::AccessDenied(_) | Self::WrongUser { .. } | Self::RenewalTooEarly { .. } => {
                AuthErrorKind::Forbidden
            },
            Self::RevocationUnavailable(_)
            | Self::Encoding(_)
            | Self::InvalidKey(_)
            | Self::InvalidLifetime(_) => AuthErrorKind::Unavailable,
            Self::InvalidTokenFormat(_)
            | Self::InvalidSignature
            | Self::UnsupportedAlgorithm(_)
            | Self::UnknownKey { .. }
            | Self::InvalidIssuer(_)
            | Self::MissingClaim(_)
            | Self::NotLoggedIn => AuthErrorKind::Invalid,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            ErrorKind::InvalidIssuer => AuthError::InvalidIssuer("Issuer validation failed".into()),
            ErrorKind::InvalidAlgorithm => {
                AuthError::UnsupportedAlgorithm("Algorithm not supported".into())
            },
            ErrorKind::InvalidKeyFormat => AuthError::InvalidKey(err.to_string()),
            ErrorKind::MissingRequiredClaim(claim) => AuthError::MissingClaim(claim.clone()),
            _ => AuthError::InvalidTokenFormat(format!("JWT error: {err}")),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;
