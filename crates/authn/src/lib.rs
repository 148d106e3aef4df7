//! # bilicore authentication
//!
//! Session tokens for the bilicore services.
//!
//! This crate provides:
//! - **[`TokenCodec`]**: issue, validate, revoke and renew Ed25519-signed JWTs
//! - **Revocation**: a [`RevocationSet`] backed by the shared cache, so a
//!   logout on one instance is honoured by all of them
//! - **[`SessionContext`]**: role and ownership checks derived from claims
//!
//! Symmetric algorithms and `none` are rejected before any key lookup.
//!
//! ## Example
//!
//! ```
//! use std::{collections::BTreeMap, sync::Arc, time::Duration};
//! use bilicore_authn::{InMemoryRevocationSet, SigningKeys, TokenCodec, TokenConfig};
//! use bilicore_storage::system_clock;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let clock = system_clock();
//! let codec = TokenCodec::new(
//!     SigningKeys::generate("k1").unwrap(),
//!     TokenConfig::default(),
//!     Arc::new(InMemoryRevocationSet::new(10_000, clock.clone())),
//!     clock,
//! );
//!
//! let token = codec.issue("USR000000000000000042", BTreeMap::new(), Duration::from_secs(3600)).unwrap();
//! let validated = codec.validate(token.as_str()).await.unwrap();
//! assert_eq!(validated.subject(), "USR000000000000000042");
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Token issue and validation.
pub mod codec;
/// Codec configuration.
pub mod config;
/// Role and ownership checks.
pub mod context;
/// Authentication error types.
pub mod error;
/// Ed25519 key material.
pub mod keys;
/// Revoked token ids.
pub mod revocation;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
/// Claims and token values.
pub mod token;
/// Header validation.
pub mod validation;

pub use codec::TokenCodec;
pub use config::TokenConfig;
pub use context::{ADMIN_USER_UID, Role, SessionContext};
pub use error::{AuthError, AuthErrorKind, Result};
pub use keys::SigningKeys;
pub use revocation::{CacheRevocationSet, InMemoryRevocationSet, RevocationSet};
pub use token::{SessionClaims, SessionToken};
pub use validation::{ACCEPTED_ALGORITHMS, FORBIDDEN_ALGORITHMS, validate_algorithm};
