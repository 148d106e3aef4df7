//! Shared test utilities for session-token testing.
//!
//! Feature-gated behind `testutil`. Provides a ready-made codec over a manual
//! clock, raw token crafting for attack tests, and [`assert_auth_error!`].
//!
//! ```toml
//! [dev-dependencies]
//! bilicore-authn = { workspace = true, features = ["testutil"] }
//! ```

#![allow(clippy::expect_used)]

use std::sync::Arc;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use bilicore_storage::ManualClock;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use zeroize::Zeroizing;

use crate::{
    codec::TokenCodec,
    config::TokenConfig,
    keys::{SigningKeys, seed_to_pkcs8},
    revocation::InMemoryRevocationSet,
};

/// Key id used by [`test_codec`].
pub const TEST_KID: &str = "test-key";

/// Fixed seed used by [`test_codec`], so tests can forge correctly signed
/// tokens with [`sign_raw_claims`].
pub const TEST_SEED: [u8; 32] = [42u8; 32];

/// A codec with default configuration, an in-memory revocation set, and the
/// fixed [`TEST_SEED`] key under [`TEST_KID`].
///
/// # Panics
///
/// Never, for the fixed key material.
pub fn test_codec(clock: &ManualClock) -> TokenCodec {
    test_codec_with(clock, TokenConfig::default())
}

/// Like [`test_codec`] with a custom configuration.
///
/// # Panics
///
/// Never, for the fixed key material.
pub fn test_codec_with(clock: &ManualClock, config: TokenConfig) -> TokenCodec {
    TokenCodec::new(
        SigningKeys::from_seed(TEST_KID, &TEST_SEED).expect("fixed test key"),
        config,
        Arc::new(InMemoryRevocationSet::new(10_000, clock.shared())),
        clock.shared(),
    )
}

/// Signs arbitrary claims JSON with `seed` under `kid`, bypassing every check
/// the codec applies when issuing.
///
/// # Panics
///
/// Panics if JSON serialization or signing fails.
pub fn sign_raw_claims(seed: &[u8; 32], kid: &str, claims: &serde_json::Value) -> String {
    let pkcs8: Zeroizing<Vec<u8>> = seed_to_pkcs8(seed);
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, claims, &EncodingKey::from_ed_der(&pkcs8))
        .expect("Failed to encode test JWT")
}

/// Creates a raw JWT string `{header_b64}.{payload_b64}.` with an empty
/// signature, for rejection tests (`alg: "none"`, algorithm confusion).
///
/// # Panics
///
/// Panics if JSON serialization fails.
pub fn craft_raw_jwt(header_json: &serde_json::Value, payload_json: &serde_json::Value) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.")
}

/// Asserts that a `Result<T, AuthError>` is an `Err` of the given variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use bilicore_authn::assert_auth_error;
/// use bilicore_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::TokenExpired);
/// assert_auth_error!(result, TokenExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::AuthError;

    #[test]
    fn test_craft_raw_jwt_format() {
        let jwt = craft_raw_jwt(&json!({"alg": "none"}), &json!({"sub": "test"}));
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty(), "signature should be empty for raw JWTs");
    }

    #[test]
    fn test_sign_raw_claims_has_signature() {
        let jwt = sign_raw_claims(&TEST_SEED, TEST_KID, &json!({"sub": "x"}));
        assert!(!jwt.rsplit('.').next().unwrap_or_default().is_empty());
    }

    #[test]
    fn test_assert_auth_error_variants() {
        let result: Result<(), AuthError> = Err(AuthError::TokenExpired);
        assert_auth_error!(result, TokenExpired);
        let result: Result<(), AuthError> = Err(AuthError::unknown_key("k"));
        assert_auth_error!(result, UnknownKey, "kid lookup");
        let result: Result<(), AuthError> = Err(AuthError::invalid_token_format("x"));
        assert_auth_error!(result, InvalidTokenFormat);
    }
}
