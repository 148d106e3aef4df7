//! Run outcomes and per-job state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use bilicore_store::Cursor;

use crate::error::ReconcileError;

/// Where a job is in its run cycle.
///
/// `Idle -> Acquiring -> Running -> (Succeeded | Failed) -> Idle`; a
/// contended acquisition goes straight back to `Idle`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for the next tick.
    #[default]
    Idle,
    /// Trying to take the job lock.
    Acquiring,
    /// Scanning under the lock.
    Running,
    /// The run just completed and committed its checkpoint.
    Succeeded,
    /// The run just failed; the checkpoint is unchanged.
    Failed,
}

/// Counters of one successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Changes read from the store.
    pub scanned: u64,
    /// Changes whose cache entry was absent or already current.
    pub in_sync: u64,
    /// Stale entries invalidated.
    pub invalidated: u64,
    /// Stale entries left alone because a newer write replaced them first.
    pub version_conflicts: u64,
    /// Invalidated entries written back with the current record.
    pub refreshed: u64,
    /// Cursor the checkpoint now holds.
    pub new_cursor: Option<Cursor>,
}

/// Why a tick did no work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Another instance holds the job lock.
    Contended {
        /// Current holder, if it could be observed.
        holder: Option<String>,
    },
    /// A run of this job is already in progress on this instance.
    AlreadyRunning,
}

/// Result of one call to [`run`](crate::ReconciliationEngine::run).
#[derive(Debug)]
pub enum RunOutcome {
    /// Nothing was done; not an error.
    Skipped(SkipReason),
    /// The run completed and its checkpoint was committed.
    Succeeded(RunReport),
    /// The run stopped early; the checkpoint is unchanged.
    Failed(ReconcileError),
}

impl RunOutcome {
    /// Whether the run completed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Whether the tick was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// The report of a successful run.
    #[must_use]
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            Self::Succeeded(report) => Some(report),
            _ => None,
        }
    }

    /// The error of a failed run.
    #[must_use]
    pub fn error(&self) -> Option<&ReconcileError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Health snapshot of one job on this instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    /// Current state.
    pub state: JobState,
    /// When the last run on this instance (skipped or not) started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// When a run last succeeded on this instance.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Report of the last successful run.
    pub last_report: Option<RunReport>,
    /// Message of the last failure.
    pub last_error: Option<String>,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Ticks skipped because another instance held the lock.
    pub skipped: u64,
}

impl JobStatus {
    pub(crate) fn is_busy(&self) -> bool {
        matches!(self.state, JobState::Acquiring | JobState::Running)
    }

    pub(crate) fn record(&mut self, outcome: &RunOutcome, finished_at: DateTime<Utc>) {
        match outcome {
            RunOutcome::Skipped(SkipReason::Contended { .. }) => {
                self.state = JobState::Idle;
                self.skipped += 1;
            },
            RunOutcome::Skipped(SkipReason::AlreadyRunning) => {},
            RunOutcome::Succeeded(report) => {
                self.state = JobState::Succeeded;
                self.last_success_at = Some(finished_at);
                self.last_report = Some(report.clone());
                self.last_error = None;
                self.consecutive_failures = 0;
            },
            RunOutcome::Failed(err) => {
                self.state = JobState::Failed;
                self.last_error = Some(err.to_string());
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            },
        }
    }
}
