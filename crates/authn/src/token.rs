//! Session token claims and the validated token value.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Claims carried by every session token.
///
/// ```json
/// {
///   "sub": "USR000000000000000042",
///   "iss": "bilicore",
///   "iat": 1729123456,
///   "exp": 1729127056,
///   "jti": "0b6c1f9e-5f0e-4f8f-8d59-0d3a1f4e2c11",
///   "claims": {"name": "ricky", "role": "ORDINARY_USER"}
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: the user id the session belongs to.
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Issued at (seconds since epoch).
    pub iat: i64,
    /// Expiration time (seconds since epoch).
    pub exp: i64,
    /// Token id, the key of the revocation set.
    pub jti: String,
    /// Application claims.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub claims: BTreeMap<String, String>,
}

impl SessionClaims {
    /// Issue time as a timestamp.
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// A token is expired from the first second of `exp` onward.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.exp
    }

    /// Looks up an application claim.
    #[must_use]
    pub fn claim(&self, name: &str) -> Option<&str> {
        self.claims.get(name).map(String::as_str)
    }
}

/// A signed session token together with its decoded claims.
///
/// Obtained from [`TokenCodec::issue`](crate::TokenCodec::issue) or
/// [`TokenCodec::validate`](crate::TokenCodec::validate). The serialized form
/// is a bearer credential, so `Debug` never prints it.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    raw: String,
    claims: SessionClaims,
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionToken")
            .field("sub", &self.claims.sub)
            .field("jti", &self.claims.jti)
            .field("exp", &self.claims.exp)
            .field("raw", &"<redacted>")
            .finish()
    }
}

impl SessionToken {
    pub(crate) fn new(raw: String, claims: SessionClaims) -> Self {
        Self { raw, claims }
    }

    /// The serialized token, as carried in the session field.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Consumes the token, returning its serialized form.
    #[must_use]
    pub fn into_string(self) -> String {
        self.raw
    }

    /// Decoded claims.
    #[must_use]
    pub fn claims(&self) -> &SessionClaims {
        &self.claims
    }

    /// Subject id.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    /// Token id.
    #[must_use]
    pub fn token_id(&self) -> &str {
        &self.claims.jti
    }

    /// Issue time.
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.claims.issued_at()
    }

    /// Expiry.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.claims.expires_at()
    }

    /// The base64url signature segment.
    #[must_use]
    pub fn signature(&self) -> &str {
        self.raw.rsplit('.').next().unwrap_or_default()
    }
}
