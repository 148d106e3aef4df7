//! Persisted lock records and the handles held by their owners.

use std::{fmt, time::Duration};

use bilicore_storage::clock::remaining;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One lease on a named lock, as stored in the coordination store.
///
/// ```json
/// {"lock_name":"reconcile:video","holder_id":"3f9a..:6c1d..","acquired_at":"...","lease_expires_at":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Name of the lock.
    pub lock_name: String,
    /// Unique id of this acquisition.
    pub holder_id: String,
    /// When the lease was first granted.
    pub acquired_at: DateTime<Utc>,
    /// When the lease runs out unless renewed.
    pub lease_expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Whether the lease has run out at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.lease_expires_at
    }
}

/// Proof of a held lease.
///
/// A handle is not `Clone`: exactly one owner renews or releases it, and
/// [`release`](crate::LockCoordinator::release) consumes it.
pub struct LockHandle {
    pub(crate) record: LockRecord,
    pub(crate) lease: Duration,
    /// The exact bytes last written for this lease; renew and release only
    /// act while the store still holds them.
    pub(crate) fence: Vec<u8>,
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("name", &self.record.lock_name)
            .field("holder_id", &self.record.holder_id)
            .field("lease_expires_at", &self.record.lease_expires_at)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    /// Lock name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.lock_name
    }

    /// Holder id of this acquisition.
    #[must_use]
    pub fn holder_id(&self) -> &str {
        &self.record.holder_id
    }

    /// Lease length applied on acquire and on every renew.
    #[must_use]
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// When the lease was first granted.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.record.acquired_at
    }

    /// When the lease runs out unless renewed.
    #[must_use]
    pub fn lease_expires_at(&self) -> DateTime<Utc> {
        self.record.lease_expires_at
    }

    /// Lease time left at `now`.
    #[must_use]
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        remaining(now, self.record.lease_expires_at)
    }

    /// The record as last written by this holder.
    #[must_use]
    pub fn record(&self) -> &LockRecord {
        &self.record
    }
}
