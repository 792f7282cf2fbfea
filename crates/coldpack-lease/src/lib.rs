//! coldpack lease coordinator
//!
//! Named, time-bounded exclusive claims stored in a table every worker can
//! reach. Used to keep two workers from uploading the same archive and to
//! decide when a restored cache entry may be deleted.

pub mod coordinator;
pub mod store;
pub mod tables;
pub mod types;

pub use coordinator::{AcquireOutcome, LeaseCoordinator, LeaseHandle, RenewOutcome};
pub use store::{LeaseStoreError, LeaseStoreResult, LeaseTable, MemoryLeaseTable, RedbLeaseTable};
pub use types::StoredLease;
