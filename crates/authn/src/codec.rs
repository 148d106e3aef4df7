//! Session token issue, validation, revocation and renewal.
//!
//! Validation runs its checks in a fixed order and stops at the first
//! failure:
//!
//! 1. format: three segments, a parseable header, an accepted `alg`, a `kid`
//! 2. signature, against the verification key named by `kid`
//! 3. expiry, against the injected clock
//! 4. revocation-set membership
//!
//! A forged token therefore reports [`AuthError::InvalidSignature`] even when
//! its claimed expiry has passed.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bilicore_storage::{SharedClock, clock::remaining};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Header, Validation};
use parking_lot::RwLock;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    config::TokenConfig,
    context::SessionContext,
    error::{AuthError, Result},
    keys::SigningKeys,
    revocation::RevocationSet,
    token::{SessionClaims, SessionToken},
    validation::{validate_algorithm, validate_kid},
};

/// The two header fields consulted before verification.
#[derive(Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

fn peek_header(token: &str) -> Result<RawHeader> {
    let mut parts = token.split('.');
    let (Some(header), Some(_), Some(_), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::invalid_token_format("JWT must have 3 parts separated by dots"));
    };

    let bytes = URL_SAFE_NO_PAD.decode(header).map_err(|e| {
        AuthError::invalid_token_format(format!("Failed to decode JWT header: {e}"))
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::invalid_token_format(format!("Failed to parse JWT header: {e}")))
}

/// Issues and validates session tokens.
///
/// Cheap to clone; clones share keys, configuration and the revocation set.
#[derive(Clone)]
pub struct TokenCodec {
    keys: Arc<RwLock<SigningKeys>>,
    config: Arc<TokenConfig>,
    revocations: Arc<dyn RevocationSet>,
    clock: SharedClock,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("keys", &*self.keys.read())
            .field("config", &self.config)
            .field("revocations", &self.revocations)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Creates a codec.
    pub fn new(
        keys: SigningKeys,
        config: TokenConfig,
        revocations: Arc<dyn RevocationSet>,
        clock: SharedClock,
    ) -> Self {
        Self {
            keys: Arc::new(RwLock::new(keys)),
            config: Arc::new(config),
            revocations,
            clock,
        }
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Issues a token for `subject` carrying `claims`, valid for `ttl`.
    ///
    /// Lifetimes are whole seconds; the fractional part of `ttl` is dropped.
    ///
    /// # Errors
    ///
    /// - [`AuthError::MissingClaim`] for a blank subject
    /// - [`AuthError::InvalidLifetime`] for a lifetime under one second or
    ///   above the configured maximum
    /// - [`AuthError::Encoding`] if signing fails
    #[tracing::instrument(skip(self, claims), fields(jti))]
    pub fn issue(
        &self,
        subject: &str,
        claims: BTreeMap<String, String>,
        ttl: Duration,
    ) -> Result<SessionToken> {
        if subject.trim().is_empty() {
            return Err(AuthError::missing_claim("sub"));
        }
        if ttl.as_secs() == 0 || ttl > self.config.max_ttl() {
            return Err(AuthError::InvalidLifetime(format!(
                "{ttl:?} is outside 1s..={:?}",
                self.config.max_ttl()
            )));
        }

        let iat = self.clock.now().timestamp();
        let exp = i64::try_from(ttl.as_secs())
            .ok()
            .and_then(|secs| iat.checked_add(secs))
            .ok_or_else(|| AuthError::InvalidLifetime(format!("{ttl:?} overflows")))?;

        let claims = SessionClaims {
            sub: subject.to_owned(),
            iss: self.config.issuer().to_owned(),
            iat,
            exp,
            jti: Uuid::new_v4().to_string(),
            claims,
        };
        tracing::Span::current().record("jti", claims.jti.as_str());

        let keys = self.keys.read();
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(keys.active_kid().to_owned());
        let raw = jsonwebtoken::encode(&header, &claims, keys.encoding_key())
            .map_err(|e| AuthError::Encoding(e.to_string()))?;

        tracing::debug!(exp, "issued session token");
        Ok(SessionToken::new(raw, claims))
    }

    /// Issues a token with the configured default lifetime.
    ///
    /// # Errors
    ///
    /// See [`issue`](Self::issue).
    pub fn issue_default(
        &self,
        subject: &str,
        claims: BTreeMap<String, String>,
    ) -> Result<SessionToken> {
        self.issue(subject, claims, self.config.default_ttl())
    }

    /// Checks format and signature only, returning the claims.
    fn verify(&self, token: &str) -> Result<SessionClaims> {
        let header = peek_header(token)?;
        validate_algorithm(&header.alg)?;
        let kid = header
            .kid
            .ok_or_else(|| AuthError::invalid_token_format("JWT header missing 'kid' field"))?;
        validate_kid(&kid)?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = {
            let keys = self.keys.read();
            let key = keys.decoding_key(&kid).ok_or_else(|| AuthError::unknown_key(&kid))?;
            jsonwebtoken::decode::<SessionClaims>(token, key, &validation)?.claims
        };

        if claims.iss != self.config.issuer() {
            return Err(AuthError::InvalidIssuer(format!(
                "expected '{}', got '{}'",
                self.config.issuer(),
                claims.iss
            )));
        }
        if claims.sub.is_empty() {
            return Err(AuthError::missing_claim("sub"));
        }
        if claims.jti.is_empty() {
            return Err(AuthError::missing_claim("jti"));
        }
        if claims.exp <= claims.iat {
            return Err(AuthError::invalid_token_format("exp must be after iat"));
        }
        Ok(claims)
    }

    /// Validates a serialized token and returns it with its claims.
    ///
    /// When the revocation set is unreachable the token is accepted if
    /// `revocation_fail_open` is set, and the event is logged as degraded.
    ///
    /// # Errors
    ///
    /// Format errors, [`AuthError::InvalidSignature`],
    /// [`AuthError::TokenExpired`], [`AuthError::TokenRevoked`], or
    /// [`AuthError::RevocationUnavailable`] when failing closed.
    #[tracing::instrument(skip_all, fields(jti))]
    pub async fn validate(&self, token: &str) -> Result<SessionToken> {
        let claims = self.verify(token)?;
        tracing::Span::current().record("jti", claims.jti.as_str());

        if claims.is_expired_at(self.clock.now()) {
            return Err(AuthError::TokenExpired);
        }

        match self.revocations.is_revoked(&claims.jti).await {
            Ok(false) => {},
            Ok(true) => return Err(AuthError::TokenRevoked),
            Err(err) if self.config.revocation_fail_open() => {
                tracing::warn!(
                    target: "bilicore::degraded",
                    error = %err,
                    "revocation set unavailable, accepting token"
                );
            },
            Err(err) => return Err(err),
        }

        Ok(SessionToken::new(token.to_owned(), claims))
    }

    /// Validates a token and derives the caller's [`SessionContext`].
    ///
    /// # Errors
    ///
    /// See [`validate`](Self::validate); an unknown `role` claim is a format
    /// error.
    pub async fn session_context(&self, token: &str) -> Result<SessionContext> {
        let token = self.validate(token).await?;
        SessionContext::from_claims(token.claims())
    }

    /// Revokes `token_id` until `expires_at`.
    ///
    /// Revoking a token that has already expired is a no-op.
    ///
    /// # Errors
    ///
    /// [`AuthError::RevocationUnavailable`] if the set cannot be written.
    #[tracing::instrument(skip(self))]
    pub async fn revoke(&self, token_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let ttl = remaining(self.clock.now(), expires_at);
        if ttl.is_zero() {
            tracing::debug!("token already expired, nothing to revoke");
            return Ok(());
        }
        self.revocations.revoke(token_id, ttl).await?;
        tracing::info!(?ttl, "revoked session token");
        Ok(())
    }

    /// Revokes an issued or validated token.
    ///
    /// # Errors
    ///
    /// See [`revoke`](Self::revoke).
    pub async fn revoke_token(&self, token: &SessionToken) -> Result<()> {
        self.revoke(token.token_id(), token.expires_at()).await
    }

    /// Exchanges a token nearing expiry for a fresh one with the same subject
    /// and claims. The presented token is revoked.
    ///
    /// # Errors
    ///
    /// Any validation error, [`AuthError::RenewalTooEarly`] while more than
    /// the renew window remains, or an issue/revocation failure.
    #[tracing::instrument(skip_all)]
    pub async fn renew(&self, token: &str, ttl: Duration) -> Result<SessionToken> {
        let current = self.validate(token).await?;
        let left = remaining(self.clock.now(), current.expires_at());
        if left > self.config.renew_window() {
            return Err(AuthError::RenewalTooEarly { remaining: left });
        }

        let fresh = self.issue(current.subject(), current.claims().claims.clone(), ttl)?;
        self.revoke_token(&current).await?;
        Ok(fresh)
    }

    /// Key id of the signing key.
    #[must_use]
    pub fn active_kid(&self) -> String {
        self.keys.read().active_kid().to_owned()
    }

    /// Public half of the signing key, base64url.
    #[must_use]
    pub fn active_public_key(&self) -> String {
        self.keys.read().active_public_key().to_owned()
    }

    /// Switches to a freshly generated signing key; tokens signed by the old
    /// key stay valid.
    ///
    /// # Errors
    ///
    /// See [`SigningKeys::rotate`].
    pub fn rotate_signing_key(&self, kid: impl Into<String>) -> Result<String> {
        let public_key = self.keys.write().rotate(kid)?;
        tracing::info!(kid = %self.active_kid(), "rotated signing key");
        Ok(public_key)
    }

    /// Accepts tokens signed by a peer instance's key.
    ///
    /// # Errors
    ///
    /// See [`SigningKeys::add_verification_key`].
    pub fn add_verification_key(&self, kid: impl Into<String>, public_key_b64: &str) -> Result<()> {
        self.keys.write().add_verification_key(kid, public_key_b64)
    }

    /// Stops accepting tokens signed under `kid`.
    ///
    /// # Errors
    ///
    /// See [`SigningKeys::remove_verification_key`].
    pub fn remove_verification_key(&self, kid: &str) -> Result<bool> {
        self.keys.write().remove_verification_key(kid)
    }
}
