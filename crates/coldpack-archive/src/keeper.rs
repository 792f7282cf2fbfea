//! Renewing a lease while long-running work holds it.

use coldpack_common::{Error, Result};
use coldpack_lease::{LeaseCoordinator, LeaseHandle, RenewOutcome};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// What to do with the work when the lease is lost underneath it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OnLapse {
    /// Idempotent work; let it finish
    Finish,
    /// Drop the work and fail with `LeaseExpired`
    Abort,
}

/// Drive `work` to completion, renewing `handle` every half TTL.
///
/// The renewal runs alongside the work, so slow remote calls and long
/// sleeps inside it never outlast the lease.
pub(crate) async fn keep_lease_while<T>(
    leases: &LeaseCoordinator,
    handle: &mut LeaseHandle,
    on_lapse: OnLapse,
    work: impl Future<Output = Result<T>>,
) -> Result<T> {
    let period = (leases.ttl() / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    tokio::pin!(work);
    loop {
        tokio::select! {
            res = &mut work => return res,
            _ = ticker.tick() => match leases.renew(handle) {
                Ok(RenewOutcome::Renewed) => {}
                Ok(RenewOutcome::Expired) => match on_lapse {
                    OnLapse::Finish => warn!("Lost {}; finishing anyway", handle.name()),
                    OnLapse::Abort => return Err(Error::LeaseExpired(handle.name().to_string())),
                },
                Err(e) => warn!("Could not renew {}: {}", handle.name(), e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldpack_common::{Clock, ManualClock};
    use coldpack_lease::{AcquireOutcome, MemoryLeaseTable};
    use std::sync::Arc;

    fn coordinator(table: Arc<MemoryLeaseTable>, holder: &str, clock: Arc<ManualClock>) -> LeaseCoordinator {
        LeaseCoordinator::new(table, holder, Duration::from_millis(100), clock)
    }

    #[tokio::test]
    async fn test_work_longer_than_ttl_keeps_lease() {
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(MemoryLeaseTable::new());
        let leases = coordinator(table.clone(), "w1", clock.clone());
        let mut handle = leases.acquire("restore:n1/a").unwrap().into_handle().unwrap();

        let ticking = clock.clone();
        let work = async move {
            // Lease time moves on while the work sleeps in real time
            for _ in 0..6 {
                tokio::time::sleep(Duration::from_millis(40)).await;
                ticking.advance(Duration::from_millis(40));
            }
            Ok(7)
        };
        let out = keep_lease_while(&leases, &mut handle, OnLapse::Abort, work).await.unwrap();
        assert_eq!(out, 7);
        assert!(handle.renewals() > 0);
        assert!(handle.is_valid_at(clock.now_ms()));
    }

    #[tokio::test]
    async fn test_lost_lease_aborts_or_finishes() {
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(MemoryLeaseTable::new());
        let leases = coordinator(table.clone(), "w1", clock.clone());
        let thief = coordinator(table, "w2", clock.clone());

        let mut handle = leases.acquire("restore:n1/a").unwrap().into_handle().unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(matches!(thief.acquire("restore:n1/a").unwrap(), AcquireOutcome::Acquired(_)));

        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        };
        let err = keep_lease_while(&leases, &mut handle, OnLapse::Abort, slow).await.unwrap_err();
        assert!(matches!(err, Error::LeaseExpired(_)));

        let slow = async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok(())
        };
        keep_lease_while(&leases, &mut handle, OnLapse::Finish, slow).await.unwrap();
    }
}
