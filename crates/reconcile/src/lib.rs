//! Scheduled reconciliation of authoritative stores into the shared cache.
//!
//! Each job scans one store's changes since its last checkpoint and
//! invalidates cached entities that are older than the change, under a
//! named lease so that only one instance runs a given job at a time.
//!
//! - [`ReconciliationEngine::run`] performs one lock-guarded run and returns a
//!   [`RunOutcome`]; contention is [`RunOutcome::Skipped`], never an error
//! - [`Scheduler`] ticks every job on its interval until cancelled
//! - [`CheckpointStore`] persists per-job cursors with compare-and-set
//!
//! A run that fails or loses its lease leaves the checkpoint where it was;
//! the next run reprocesses the same changes, which is idempotent.
//!
//! # Features
//!
//! - **`failpoints`**: activates `reconcile-after-change` and
//!   `reconcile-before-checkpoint` (and the store's scan fail points)

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod status;

pub use checkpoint::{CheckpointStore, ReconciliationCheckpoint};
pub use config::{JobSpec, ReconcileConfig, RefreshPolicy};
pub use engine::ReconciliationEngine;
pub use error::{ReconcileError, ReconcileResult};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use status::{JobState, JobStatus, RunOutcome, RunReport, SkipReason};
