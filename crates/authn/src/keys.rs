//! Ed25519 key material for signing and verifying session tokens.
//!
//! One key signs new tokens at any time; any number of retired keys remain
//! available for verification until the tokens they signed have expired.

use std::{collections::HashMap, fmt};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand_core::OsRng;
use zeroize::Zeroizing;

use crate::{error::AuthError, validation::validate_kid};

/// DER prefix of a PKCS#8 v1 document wrapping a raw 32-byte Ed25519 seed.
const PKCS8_ED25519_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the seed)
];

/// Wraps a 32-byte Ed25519 seed as PKCS#8 DER, scrubbed on drop.
#[must_use]
pub fn seed_to_pkcs8(seed: &[u8; 32]) -> Zeroizing<Vec<u8>> {
    let mut der = Zeroizing::new(Vec::with_capacity(PKCS8_ED25519_PREFIX.len() + seed.len()));
    der.extend_from_slice(&PKCS8_ED25519_PREFIX);
    der.extend_from_slice(seed);
    der
}

/// The key currently used to sign.
struct ActiveKey {
    kid: String,
    encoding: EncodingKey,
    public_key: String,
}

/// Signing key plus the set of keys accepted for verification.
pub struct SigningKeys {
    active: ActiveKey,
    verifying: HashMap<String, DecodingKey>,
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kids: Vec<&str> = self.verifying.keys().map(String::as_str).collect();
        kids.sort_unstable();
        f.debug_struct("SigningKeys")
            .field("active_kid", &self.active.kid)
            .field("verifying_kids", &kids)
            .finish()
    }
}

impl SigningKeys {
    /// Generates a fresh random key under `kid`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidTokenFormat`] for a malformed `kid`.
    pub fn generate(kid: impl Into<String>) -> Result<Self, AuthError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let seed = Zeroizing::new(signing_key.to_bytes());
        Self::from_seed(kid, &seed)
    }

    /// Builds keys from a 32-byte Ed25519 seed.
    ///
    /// Every instance that shares the seed can verify every other instance's
    /// tokens.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed `kid` or unusable key material.
    pub fn from_seed(kid: impl Into<String>, seed: &[u8; 32]) -> Result<Self, AuthError> {
        let active = active_key(kid.into(), seed)?;
        let decoding = decoding_key(&active.public_key)?;
        let mut verifying = HashMap::new();
        verifying.insert(active.kid.clone(), decoding);
        Ok(Self { active, verifying })
    }

    /// Builds keys from a base64url-encoded seed, as found in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKey`] if the seed does not decode to 32
    /// bytes.
    pub fn from_seed_b64(kid: impl Into<String>, seed_b64: &str) -> Result<Self, AuthError> {
        let bytes = Zeroizing::new(
            URL_SAFE_NO_PAD
                .decode(seed_b64.trim_end_matches('='))
                .map_err(|e| AuthError::InvalidKey(format!("seed is not base64url: {e}")))?,
        );
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| AuthError::InvalidKey(format!("seed must be 32 bytes, got {}", bytes.len())))?,
        );
        Self::from_seed(kid, &seed)
    }

    /// Key id stamped on newly issued tokens.
    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active.kid
    }

    /// Base64url public half of the active key, for distribution to peers.
    #[must_use]
    pub fn active_public_key(&self) -> &str {
        &self.active.public_key
    }

    pub(crate) fn encoding_key(&self) -> &EncodingKey {
        &self.active.encoding
    }

    /// Looks up the verification key named by a token's `kid` header.
    pub(crate) fn decoding_key(&self, kid: &str) -> Option<&DecodingKey> {
        self.verifying.get(kid)
    }

    /// Whether tokens signed under `kid` are accepted.
    #[must_use]
    pub fn accepts(&self, kid: &str) -> bool {
        self.verifying.contains_key(kid)
    }

    /// Accepts tokens signed by a peer's key.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed `kid` or public key.
    pub fn add_verification_key(
        &mut self,
        kid: impl Into<String>,
        public_key_b64: &str,
    ) -> Result<(), AuthError> {
        let kid = kid.into();
        validate_kid(&kid)?;
        let decoding = decoding_key(public_key_b64)?;
        self.verifying.insert(kid, decoding);
        Ok(())
    }

    /// Stops accepting tokens signed under `kid`.
    ///
    /// The active key cannot be removed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidKey`] when `kid` is the active key.
    pub fn remove_verification_key(&mut self, kid: &str) -> Result<bool, AuthError> {
        if kid == self.active.kid {
            return Err(AuthError::InvalidKey(format!("cannot remove active key '{kid}'")));
        }
        Ok(self.verifying.remove(kid).is_some())
    }

    /// Makes a freshly generated key active. The previous key keeps verifying.
    ///
    /// Returns the new key's public half.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed or already used `kid`.
    pub fn rotate(&mut self, kid: impl Into<String>) -> Result<String, AuthError> {
        let kid = kid.into();
        if self.verifying.contains_key(&kid) {
            return Err(AuthError::InvalidKey(format!("key id '{kid}' is already in use")));
        }
        let signing_key = SigningKey::generate(&mut OsRng);
        let seed = Zeroizing::new(signing_key.to_bytes());
        let active = active_key(kid, &seed)?;
        let decoding = decoding_key(&active.public_key)?;
        let public_key = active.public_key.clone();
        self.verifying.insert(active.kid.clone(), decoding);
        self.active = active;
        Ok(public_key)
    }
}

fn active_key(kid: String, seed: &[u8; 32]) -> Result<ActiveKey, AuthError> {
    validate_kid(&kid)?;
    let signing_key = SigningKey::from_bytes(seed);
    let public_key = URL_SAFE_NO_PAD.encode(signing_key.verifying_key().to_bytes());
    let pkcs8 = seed_to_pkcs8(seed);
    let encoding = EncodingKey::from_ed_der(&pkcs8);
    Ok(ActiveKey { kid, encoding, public_key })
}

fn decoding_key(public_key_b64: &str) -> Result<DecodingKey, AuthError> {
    let raw = URL_SAFE_NO_PAD
        .decode(public_key_b64)
        .map_err(|e| AuthError::InvalidKey(format!("public key is not base64url: {e}")))?;
    if raw.len() != 32 {
        return Err(AuthError::InvalidKey(format!("public key must be 32 bytes, got {}", raw.len())));
    }
    DecodingKey::from_ed_components(public_key_b64).map_err(AuthError::from)
}
