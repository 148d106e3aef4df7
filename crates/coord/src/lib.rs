//! Lease-based named locks for the bilicore services.
//!
//! A [`LockCoordinator`] grants at most one live lease per lock name across
//! every instance sharing the same coordination store. Leases expire on
//! their own, so a crashed holder cannot block others forever; a holder that
//! outlives its lease finds out on its next [`renew`](LockCoordinator::renew)
//! and must stop.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bilicore_coord::{LockConfig, LockCoordinator};
//! use bilicore_storage::{MemoryBackend, system_clock};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let coord = LockCoordinator::new(MemoryBackend::new(), LockConfig::default(), system_clock());
//!
//! let mut handle = coord.acquire("reconcile:video", Duration::from_secs(30)).await.unwrap();
//! assert!(coord.acquire("reconcile:video", Duration::from_secs(30)).await.unwrap_err().is_contended());
//!
//! coord.renew(&mut handle).await.unwrap();
//! assert!(coord.release(handle).await.unwrap());
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod record;

pub use config::LockConfig;
pub use coordinator::LockCoordinator;
pub use error::{LockError, LockResult};
pub use record::{LockHandle, LockRecord};
