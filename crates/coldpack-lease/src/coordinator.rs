//! Lease coordinator
//!
//! Leases are best-effort mutual exclusion: a worker that misses its renewal
//! loses the lease, and another worker may take it over. Callers must keep
//! the guarded work idempotent.

use crate::store::LeaseTable;
use crate::types::StoredLease;
use coldpack_common::{Clock, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A lease this worker holds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseHandle {
    name: String,
    holder: String,
    token: u128,
    created_at_ms: u64,
    expires_at_ms: u64,
    renewals: u32,
}

impl LeaseHandle {
    fn from_stored(lease: &StoredLease) -> Self {
        Self {
            name: lease.name.clone(),
            holder: lease.holder.clone(),
            token: lease.token,
            created_at_ms: lease.created_at_ms,
            expires_at_ms: lease.expires_at_ms,
            renewals: lease.renewals,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub const fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    #[must_use]
    pub const fn expires_at_ms(&self) -> u64 {
        self.expires_at_ms
    }

    #[must_use]
    pub const fn renewals(&self) -> u32 {
        self.renewals
    }

    /// Validity left at `now_ms`, zero once expired
    #[must_use]
    pub const fn remaining(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(now_ms))
    }

    #[must_use]
    pub const fn is_valid_at(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Result of [`LeaseCoordinator::acquire`]
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(LeaseHandle),
    /// Someone else holds a valid lease with this name
    Busy { holder: String, expires_at_ms: u64 },
}

impl AcquireOutcome {
    #[must_use]
    pub fn into_handle(self) -> Option<LeaseHandle> {
        match self {
            Self::Acquired(handle) => Some(handle),
            Self::Busy { .. } => None,
        }
    }
}

/// Result of a renewal
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewOutcome {
    /// The lease is held for at least another renewal margin
    Renewed,
    /// The lease lapsed or was taken over; abandon the guarded work
    Expired,
}

/// Grants, renews and releases named leases on behalf of one worker
pub struct LeaseCoordinator {
    table: Arc<dyn LeaseTable>,
    holder: String,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl LeaseCoordinator {
    /// Leases granted by this coordinator live `ttl` past each acquire or renewal
    pub fn new(
        table: Arc<dyn LeaseTable>,
        holder: impl Into<String>,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            table,
            holder: holder.into(),
            ttl,
            clock,
        }
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The shared table behind this coordinator
    #[must_use]
    pub fn table(&self) -> &Arc<dyn LeaseTable> {
        &self.table
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Try once to take the lease `name`. Contention is `Busy`, not an error.
    pub fn acquire(&self, name: &str) -> Result<AcquireOutcome> {
        let now = self.clock.now_ms();
        let lease = StoredLease {
            name: name.to_string(),
            holder: self.holder.clone(),
            token: uuid::Uuid::new_v4().as_u128(),
            created_at_ms: now,
            expires_at_ms: now.saturating_add(self.ttl_ms()),
            renewals: 0,
        };
        match self.table.insert_if_free(&lease, now)? {
            None => {
                debug!("Acquired lease {} (holder {})", name, self.holder);
                Ok(AcquireOutcome::Acquired(LeaseHandle::from_stored(&lease)))
            }
            Some(existing) => {
                debug!(
                    "Lease {} busy: held by {} for another {} ms",
                    name,
                    existing.holder,
                    existing.expires_at_ms.saturating_sub(now)
                );
                Ok(AcquireOutcome::Busy {
                    holder: existing.holder,
                    expires_at_ms: existing.expires_at_ms,
                })
            }
        }
    }

    /// Extend the lease by the TTL, provided it is still valid and ours
    pub fn renew(&self, handle: &mut LeaseHandle) -> Result<RenewOutcome> {
        let now = self.clock.now_ms();
        let new_expiry = now.saturating_add(self.ttl_ms());
        match self
            .table
            .compare_and_renew(&handle.name, handle.token, now, new_expiry)?
        {
            Some(stored) => {
                handle.expires_at_ms = stored.expires_at_ms;
                handle.renewals = stored.renewals;
                debug!("Renewed lease {} (renewal #{})", handle.name, handle.renewals);
                Ok(RenewOutcome::Renewed)
            }
            None => {
                warn!("Lease {} expired before renewal", handle.name);
                Ok(RenewOutcome::Expired)
            }
        }
    }

    /// Renew only once less than `margin` of validity is left
    pub fn renew_if_due(&self, handle: &mut LeaseHandle, margin: Duration) -> Result<RenewOutcome> {
        let now = self.clock.now_ms();
        if handle.is_valid_at(now) && handle.remaining(now) >= margin {
            return Ok(RenewOutcome::Renewed);
        }
        self.renew(handle)
    }

    /// Give the lease back. Releasing a lease someone else took over is a no-op.
    pub fn release(&self, handle: LeaseHandle) -> Result<()> {
        if self.table.release_if_owned(&handle.name, handle.token)? {
            debug!("Released lease {}", handle.name);
        } else {
            debug!("Lease {} was no longer ours at release", handle.name);
        }
        Ok(())
    }

    /// Current row for `name`, if any (valid or not)
    pub fn inspect(&self, name: &str) -> Result<Option<StoredLease>> {
        Ok(self.table.get(name)?)
    }

    /// All rows, for status reporting
    pub fn list(&self) -> Result<Vec<StoredLease>> {
        Ok(self.table.list()?)
    }

    /// Remove dead rows
    pub fn purge_expired(&self) -> Result<usize> {
        let purged = self.table.purge_expired(self.clock.now_ms())?;
        if purged > 0 {
            debug!("Purged {} expired leases", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryLeaseTable, RedbLeaseTable};
    use coldpack_common::ManualClock;
    use tempfile::tempdir;

    const TTL: Duration = Duration::from_secs(10);

    fn pair(table: Arc<dyn LeaseTable>, clock: &Arc<ManualClock>) -> (LeaseCoordinator, LeaseCoordinator) {
        let clock: Arc<dyn Clock> = clock.clone();
        (
            LeaseCoordinator::new(table.clone(), "worker-a", TTL, clock.clone()),
            LeaseCoordinator::new(table, "worker-b", TTL, clock),
        )
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let dir = tempdir().unwrap();
        let table = Arc::new(RedbLeaseTable::open(dir.path().join("leases.redb")).unwrap());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (a, b) = pair(table, &clock);

        let handle = a.acquire("store:n1/x").unwrap().into_handle().unwrap();
        assert_eq!(handle.holder(), "worker-a");
        match b.acquire("store:n1/x").unwrap() {
            AcquireOutcome::Busy { holder, .. } => assert_eq!(holder, "worker-a"),
            AcquireOutcome::Acquired(_) => panic!("second acquire must be busy"),
        }
        // Same worker is not reentrant either
        assert!(a.acquire("store:n1/x").unwrap().into_handle().is_none());

        // Other names are independent
        assert!(b.acquire("store:n1/y").unwrap().into_handle().is_some());

        a.release(handle).unwrap();
        assert!(b.acquire("store:n1/x").unwrap().into_handle().is_some());
    }

    #[test]
    fn test_reclaim_after_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let (a, b) = pair(Arc::new(MemoryLeaseTable::new()), &clock);

        let mut stale = a.acquire("restore:n1/x").unwrap().into_handle().unwrap();
        clock.advance(TTL);
        let mut fresh = b.acquire("restore:n1/x").unwrap().into_handle().unwrap();

        // The lapsed owner learns it lost the lease and cannot release the new one
        assert_eq!(a.renew(&mut stale).unwrap(), RenewOutcome::Expired);
        a.release(stale).unwrap();
        assert_eq!(b.renew(&mut fresh).unwrap(), RenewOutcome::Renewed);
        assert_eq!(fresh.renewals(), 1);
    }

    #[test]
    fn test_renew_extends_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let (a, b) = pair(Arc::new(MemoryLeaseTable::new()), &clock);

        let mut handle = a.acquire("restore:n1/x").unwrap().into_handle().unwrap();
        for _ in 0..3 {
            clock.advance(Duration::from_secs(8));
            assert_eq!(a.renew(&mut handle).unwrap(), RenewOutcome::Renewed);
        }
        // 24 s after acquisition, well past the original TTL, still held
        assert!(b.acquire("restore:n1/x").unwrap().into_handle().is_none());
        assert_eq!(handle.remaining(clock.now_ms()), TTL);
    }

    #[test]
    fn test_renew_if_due_only_near_expiry() {
        let clock = Arc::new(ManualClock::new(0));
        let (a, _) = pair(Arc::new(MemoryLeaseTable::new()), &clock);
        let margin = Duration::from_secs(2);

        let mut handle = a.acquire("l").unwrap().into_handle().unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(a.renew_if_due(&mut handle, margin).unwrap(), RenewOutcome::Renewed);
        assert_eq!(handle.renewals(), 0);

        clock.advance(Duration::from_secs(4));
        assert_eq!(a.renew_if_due(&mut handle, margin).unwrap(), RenewOutcome::Renewed);
        assert_eq!(handle.renewals(), 1);
        assert_eq!(handle.expires_at_ms(), 19_000);

        clock.advance(Duration::from_secs(30));
        assert_eq!(a.renew_if_due(&mut handle, margin).unwrap(), RenewOutcome::Expired);
    }

    #[test]
    fn test_purge_expired_rows() {
        let clock = Arc::new(ManualClock::new(0));
        let (a, _) = pair(Arc::new(MemoryLeaseTable::new()), &clock);
        let _held = a.acquire("one").unwrap();
        clock.advance(TTL);
        let _fresh = a.acquire("two").unwrap();
        assert_eq!(a.purge_expired().unwrap(), 1);
        assert_eq!(a.list().unwrap().len(), 1);
        assert!(a.inspect("one").unwrap().is_none());
    }
}
