//! # bilicore service
//!
//! Composition root of the platform core: loads [`ServiceConfig`] from TOML
//! and builds a [`Service`] holding the request gateway and the
//! reconciliation engine over one shared backend.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bilicore_service::{Service, ServiceConfig, init_tracing};
//! use bilicore_storage::MemoryBackend;
//! use bilicore_store::RelationalStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServiceConfig::from_file("bilicore.toml")?;
//! init_tracing(config.log_filter());
//!
//! let mut service = Service::build(&config, MemoryBackend::new(), vec![Arc::new(RelationalStore::new())])?;
//! service.start();
//! // ... serve requests through service.gateway() ...
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod service;
pub mod telemetry;

pub use config::{ServiceConfig, SigningKeyConfig};
pub use error::{ServiceError, ServiceResult};
pub use service::Service;
pub use telemetry::init_tracing;
