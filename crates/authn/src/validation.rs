//! Header checks applied before any signature work.
//!
//! Only Ed25519 (`EdDSA`) is accepted. Symmetric algorithms and `none` are
//! rejected outright so a forged header can never downgrade verification.

use crate::error::AuthError;

/// Algorithms that are never accepted.
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms accepted for session tokens.
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA"];

/// Longest key id accepted in a token header.
pub const MAX_KID_LEN: usize = 64;

/// Validates the `alg` header value against the allow-list.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] for forbidden algorithms and
/// anything not in [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use bilicore_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("RS256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.iter().any(|f| f.eq_ignore_ascii_case(alg)) {
        return Err(AuthError::UnsupportedAlgorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::UnsupportedAlgorithm(format!(
            "Algorithm '{alg}' is not in accepted list (only EdDSA is supported)"
        )));
    }

    Ok(())
}

/// Validates the `kid` header value.
///
/// Key ids are short identifiers made of ASCII alphanumerics, `-`, `_` and `.`.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] if the id is empty, too long, or
/// contains other characters.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::invalid_token_format("kid must not be empty"));
    }
    if kid.len() > MAX_KID_LEN {
        return Err(AuthError::invalid_token_format(format!(
            "kid exceeds {MAX_KID_LEN} characters"
        )));
    }
    if !kid.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.')) {
        return Err(AuthError::invalid_token_format("kid contains invalid characters"));
    }
    Ok(())
}
