//! # bilicore gateway
//!
//! The façade request handlers use to read and write entities while keeping
//! the shared cache coherent with the authoritative stores.
//!
//! - reads: validate the session, then read through the cache
//! - writes: validate the session, write the store, then invalidate
//! - cache outages degrade to direct store access instead of failing requests
//!
//! ## Example
//!
//! ```
//! use std::{collections::BTreeMap, sync::Arc, time::Duration};
//! use bytes::Bytes;
//! use bilicore_authn::{InMemoryRevocationSet, SigningKeys, TokenCodec, TokenConfig};
//! use bilicore_cache::{CacheConfig, CacheStore};
//! use bilicore_gateway::{ConsistencyGateway, GatewayConfig};
//! use bilicore_storage::{MemoryBackend, system_clock};
//! use bilicore_store::{EntityId, RelationalStore, StoreKind};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let clock = system_clock();
//! let codec = TokenCodec::new(
//!     SigningKeys::generate("k1").unwrap(),
//!     TokenConfig::default(),
//!     Arc::new(InMemoryRevocationSet::new(1_000, clock.clone())),
//!     clock.clone(),
//! );
//! let cache = CacheStore::new(MemoryBackend::new(), CacheConfig::default(), clock);
//! let gateway = ConsistencyGateway::new(codec, cache, GatewayConfig::default())
//!     .with_store(Arc::new(RelationalStore::new()));
//!
//! let claims = BTreeMap::from([("role".to_owned(), "VIP".to_owned())]);
//! let token = gateway.codec().issue("USR000000000000000042", claims, Duration::from_secs(600)).unwrap();
//!
//! let id = EntityId::from("u42");
//! let revision = gateway.write(token.as_str(), StoreKind::Relational, &id, Bytes::from("{}")).await.unwrap();
//! let record = gateway.read(token.as_str(), StoreKind::Relational, &id).await.unwrap();
//! assert_eq!(record.revision, revision);
//! # });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod gateway;

pub use config::GatewayConfig;
pub use error::{ErrorCode, GatewayError, GatewayResult};
pub use gateway::{ConsistencyGateway, SESSION_FIELD};
