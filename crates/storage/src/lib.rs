//! Shared key-value storage abstraction for the bilicore services.
//!
//! Every piece of cross-instance state in the platform core (cache entries,
//! token revocations, lock records, reconciliation checkpoints) lives behind
//! the [`StorageBackend`] trait defined here.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConsistencyGateway                          │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │  TokenCodec  │  CacheStore  │ LockCoord.   │ Reconciliation │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │                 bilicore-storage                            │
//! │  StorageBackend: get / set / TTL / CAS / compare-and-delete │
//! ├─────────────────────────────────────────────────────────────┤
//! │              MemoryBackend (or a networked store)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//! use bilicore_storage::{MemoryBackend, StorageBackend, StorageError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     // Create-if-absent with a lease.
//!     backend
//!         .compare_and_set_with_ttl(b"lock:job", None, b"a".to_vec(), Duration::from_secs(30))
//!         .await?;
//!
//!     // A second claimant loses.
//!     let second = backend
//!         .compare_and_set_with_ttl(b"lock:job", None, b"b".to_vec(), Duration::from_secs(30))
//!         .await;
//!     assert!(matches!(second, Err(StorageError::Conflict)));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: test helpers ([`testutil::FlakyBackend`], key generators, assertion macros)
//! - **`failpoints`**: activates `fail_point!` hooks for fault-injection tests

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod clock;
pub mod error;
pub mod memory;
pub mod retry;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod types;

pub use backend::{StorageBackend, prefix_end};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use retry::{RetryPolicy, compute_backoff, with_retry, with_timeout};
pub use types::KeyValue;
