//! Authoritative stores for the bilicore services.
//!
//! The [`AuthoritativeStore`] trait is the one capability every source of
//! truth offers: read an entity, write it, and scan what changed since a
//! [`Cursor`]. Two implementations ship here and are chosen when the service
//! is composed:
//!
//! - [`RelationalStore`]: rows with revisions and an ordered change log
//! - [`DocumentStore`]: a document collection with a change feed, kept on a
//!   shared [`StorageBackend`](bilicore_storage::StorageBackend)
//!
//! [`CachedRecord`] and [`cache_key`] fix how records look in the cache, so
//! that read-through and reconciliation agree.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use futures::TryStreamExt;
//! use bilicore_store::{AuthoritativeStore, EntityId, RelationalStore};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = RelationalStore::new();
//! let id = EntityId::from("user-1");
//! let revision = store.write(&id, Bytes::from("{}")).await.unwrap();
//!
//! let changes: Vec<_> = store.scan_changes_since(None).try_collect().await.unwrap();
//! assert_eq!(changes[0].revision, revision);
//! # });
//! ```
//!
//! # Features
//!
//! - **`testutil`**: [`testutil::FlakyStore`] for fault injection in tests
//! - **`failpoints`**: activates `fail_point!` hooks (`store-read`,
//!   `store-before-write`, `store-scan-page`)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authoritative;
pub mod document;
pub mod error;
pub mod record;
pub mod relational;
mod scan;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod types;

pub use authoritative::{AuthoritativeStore, DEFAULT_SCAN_PAGE_SIZE};
pub use document::DocumentStore;
pub use error::{StoreError, StoreResult};
pub use record::{CachedRecord, cache_key};
pub use relational::RelationalStore;
pub use types::{AuthoritativeRecord, Change, Cursor, EntityId, Revision, StoreKind};

/// Base64 encoding for payload bytes inside JSON.
mod b64 {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}
