//! Versioned shared cache for the bilicore services.
//!
//! [`CacheStore`] sits on a [`StorageBackend`](bilicore_storage::StorageBackend)
//! shared by every service instance and provides:
//!
//! - `get` / `set` / `invalidate` with per-entry TTL
//! - [`compare_and_invalidate`](CacheStore::compare_and_invalidate), so a
//!   reconciliation pass never clobbers a newer write
//! - [`get_or_load`](CacheStore::get_or_load) with single-flight loading
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bytes::Bytes;
//! use bilicore_cache::{CacheConfig, CacheStore};
//! use bilicore_storage::{MemoryBackend, system_clock};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let cache = CacheStore::new(MemoryBackend::new(), CacheConfig::default(), system_clock());
//!
//! let version = cache.set("video::1", Bytes::from("{}"), Duration::from_secs(60)).await.unwrap();
//! assert!(cache.compare_and_invalidate("video::1", version).await.unwrap());
//! assert_eq!(cache.get("video::1").await.unwrap(), None);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod entry;
pub mod error;
pub mod store;

pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use error::{CacheError, CacheResult, LoadError};
pub use store::{CacheStore, family_key};
