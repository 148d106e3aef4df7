//! Durable per-job progress markers.
//!
//! A checkpoint lives under `"{prefix}{job}"` as JSON:
//!
//! ```json
//! {"job_name":"video-sync","last_run_at":"2024-10-17T00:00:00Z","last_cursor":"doc:video/42"}
//! ```
//!
//! It is only ever written with compare-and-set against the exact bytes read
//! at the start of the run, so a run that lost its lock to a faster holder
//! cannot move the cursor backwards.

use std::fmt;

use bilicore_storage::{RetryPolicy, StorageBackend, StorageError, with_retry};
use bilicore_store::Cursor;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, ReconcileResult};

/// Progress of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationCheckpoint {
    /// Job name.
    pub job_name: String,
    /// When the last successful run finished.
    pub last_run_at: DateTime<Utc>,
    /// Where the next run resumes; `None` scans from the beginning.
    pub last_cursor: Option<Cursor>,
}

/// A checkpoint together with the exact bytes it was read from.
#[derive(Debug, Clone, Default)]
pub(crate) struct Loaded {
    pub(crate) checkpoint: Option<ReconciliationCheckpoint>,
    pub(crate) raw: Option<Bytes>,
}

/// Reads and conditionally writes checkpoints.
#[derive(Clone)]
pub struct CheckpointStore<B> {
    backend: B,
    prefix: String,
    retry: RetryPolicy,
}

impl<B> fmt::Debug for CheckpointStore<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckpointStore").field("prefix", &self.prefix).finish_non_exhaustive()
    }
}

impl<B: StorageBackend> CheckpointStore<B> {
    /// Creates a store writing under `prefix`.
    pub fn new(backend: B, prefix: impl Into<String>, retry: RetryPolicy) -> Self {
        Self { backend, prefix: prefix.into(), retry }
    }

    fn key(&self, job: &str) -> Vec<u8> {
        format!("{}{job}", self.prefix).into_bytes()
    }

    /// The job's checkpoint, if it has completed a run.
    ///
    /// # Errors
    ///
    /// [`ReconcileError::Checkpoint`] or [`ReconcileError::CorruptCheckpoint`].
    pub async fn get(&self, job: &str) -> ReconcileResult<Option<ReconciliationCheckpoint>> {
        Ok(self.load(job).await?.checkpoint)
    }

    pub(crate) async fn load(&self, job: &str) -> ReconcileResult<Loaded> {
        let key = self.key(job);
        let raw = with_retry(&self.retry, "checkpoint_load", StorageError::is_transient, || {
            self.backend.get(&key)
        })
        .await
        .map_err(ReconcileError::Checkpoint)?;

        let Some(raw) = raw else {
            return Ok(Loaded::default());
        };
        let checkpoint = serde_json::from_slice(&raw).map_err(|e| ReconcileError::CorruptCheckpoint {
            job: job.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Loaded { checkpoint: Some(checkpoint), raw: Some(raw) })
    }

    /// Replaces the checkpoint read as `expected`.
    ///
    /// A conflict means another holder committed since `expected` was read,
    /// which only happens after this run's lease was lost. The exception is a
    /// retried attempt conflicting with an earlier attempt whose
    /// acknowledgement was lost; the stored bytes then already equal `next`.
    pub(crate) async fn commit(
        &self,
        expected: &Loaded,
        next: &ReconciliationCheckpoint,
    ) -> ReconcileResult<()> {
        let key = self.key(&next.job_name);
        let bytes = serde_json::to_vec(next).map_err(|e| {
            ReconcileError::Checkpoint(StorageError::serialization_with_source("checkpoint", e))
        })?;

        let result = with_retry(&self.retry, "checkpoint_commit", StorageError::is_transient, || {
            self.backend.compare_and_set(&key, expected.raw.as_deref(), bytes.clone())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict) => match self.backend.get(&key).await {
                Ok(Some(current)) if current[..] == bytes[..] => {
                    tracing::debug!(job = %next.job_name, "checkpoint already committed by an earlier attempt");
                    Ok(())
                },
                Ok(_) => Err(ReconcileError::LockLost { job: next.job_name.clone() }),
                Err(err) => Err(ReconcileError::Checkpoint(err)),
            },
            Err(err) => Err(ReconcileError::Checkpoint(err)),
        }
    }
}
