//! Lease tables.
//!
//! Every conditional write (insert-if-absent-or-expired, renew, release)
//! reads and writes inside one redb write transaction. redb serializes write
//! transactions, which makes each of them atomic against every other worker
//! using the same database file.

use crate::tables;
use crate::types::StoredLease;
use parking_lot::Mutex;
use redb::{Database, ReadableTable};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// How often a shared-mode open is retried while another process holds the file
const SHARED_OPEN_ATTEMPTS: u32 = 400;
const SHARED_OPEN_BACKOFF: Duration = Duration::from_millis(5);

/// Error type for lease table operations
#[derive(Debug, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lease database {0} stayed locked by another process")]
    Contended(PathBuf),
}

impl From<redb::TransactionError> for LeaseStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<LeaseStoreError> for coldpack_common::Error {
    fn from(e: LeaseStoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type LeaseStoreResult<T> = Result<T, LeaseStoreError>;

/// Shared key-value table holding one row per lease name
pub trait LeaseTable: Send + Sync {
    /// Insert `lease` unless a valid lease with the same name exists.
    /// Returns the blocking lease when the insert did not happen.
    fn insert_if_free(&self, lease: &StoredLease, now_ms: u64)
    -> LeaseStoreResult<Option<StoredLease>>;

    /// Move the expiry of the lease identified by `(name, token)` to
    /// `new_expiry_ms`, provided it is still valid at `now_ms`.
    fn compare_and_renew(
        &self,
        name: &str,
        token: u128,
        now_ms: u64,
        new_expiry_ms: u64,
    ) -> LeaseStoreResult<Option<StoredLease>>;

    /// Remove the row if it still belongs to `token`
    fn release_if_owned(&self, name: &str, token: u128) -> LeaseStoreResult<bool>;

    fn get(&self, name: &str) -> LeaseStoreResult<Option<StoredLease>>;

    fn list(&self) -> LeaseStoreResult<Vec<StoredLease>>;

    /// Drop rows that expired before `now_ms`
    fn purge_expired(&self, now_ms: u64) -> LeaseStoreResult<usize>;
}

enum Backing {
    /// Database kept open for the lifetime of the table (one process)
    Owned(Database),
    /// Opened per operation so several processes can take turns on the file
    Shared(PathBuf),
}

/// Lease table backed by a redb database file
pub struct RedbLeaseTable {
    backing: Backing,
}

impl RedbLeaseTable {
    /// Open (or create) the database and keep it open.
    ///
    /// redb locks the file while a `Database` is alive, so only this process
    /// can use it. Use [`RedbLeaseTable::open_shared`] for multi-process hosts.
    pub fn open(path: impl AsRef<Path>) -> LeaseStoreResult<Self> {
        let db = Self::create(path.as_ref())?;
        Ok(Self {
            backing: Backing::Owned(db),
        })
    }

    /// Open the database for use by several worker processes.
    ///
    /// The file is opened for each operation and closed right after, waiting
    /// briefly when another process has it open.
    pub fn open_shared(path: impl AsRef<Path>) -> LeaseStoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        drop(Self::open_with_retry(&path)?);
        Ok(Self {
            backing: Backing::Shared(path),
        })
    }

    fn create(path: &Path) -> LeaseStoreResult<Database> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::LEASES)?;
        }
        write_txn.commit()?;
        Ok(db)
    }

    fn open_with_retry(path: &Path) -> LeaseStoreResult<Database> {
        for attempt in 0..SHARED_OPEN_ATTEMPTS {
            match Self::create(path) {
                Err(LeaseStoreError::Redb(redb::DatabaseError::DatabaseAlreadyOpen)) => {
                    if attempt % 100 == 99 {
                        debug!("Lease database {} still busy, retrying", path.display());
                    }
                    std::thread::sleep(SHARED_OPEN_BACKOFF);
                }
                other => return other,
            }
        }
        Err(LeaseStoreError::Contended(path.to_path_buf()))
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> LeaseStoreResult<T>) -> LeaseStoreResult<T> {
        match &self.backing {
            Backing::Owned(db) => f(db),
            Backing::Shared(path) => {
                let db = Self::open_with_retry(path)?;
                f(&db)
            }
        }
    }

    fn decode(bytes: &[u8]) -> LeaseStoreResult<StoredLease> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl LeaseTable for RedbLeaseTable {
    fn insert_if_free(
        &self,
        lease: &StoredLease,
        now_ms: u64,
    ) -> LeaseStoreResult<Option<StoredLease>> {
        let bytes = bincode::serialize(lease)?;
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(tables::LEASES)?;
                // Read and compare, then drop the guard before mutating
                let existing = match table.get(lease.name.as_str())? {
                    Some(guard) => Some(Self::decode(guard.value())?),
                    None => None,
                };
                if let Some(existing) = existing.filter(|l| l.is_valid_at(now_ms)) {
                    return Ok(Some(existing));
                }
                table.insert(lease.name.as_str(), bytes.as_slice())?;
            }
            write_txn.commit()?;
            Ok(None)
        })
    }

    fn compare_and_renew(
        &self,
        name: &str,
        token: u128,
        now_ms: u64,
        new_expiry_ms: u64,
    ) -> LeaseStoreResult<Option<StoredLease>> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let renewed = {
                let mut table = write_txn.open_table(tables::LEASES)?;
                let current = match table.get(name)? {
                    Some(guard) => Some(Self::decode(guard.value())?),
                    None => None,
                };
                match current {
                    Some(mut lease) if lease.token == token && lease.is_valid_at(now_ms) => {
                        lease.expires_at_ms = new_expiry_ms;
                        lease.renewals += 1;
                        let bytes = bincode::serialize(&lease)?;
                        table.insert(name, bytes.as_slice())?;
                        Some(lease)
                    }
                    _ => None,
                }
            };
            if renewed.is_some() {
                write_txn.commit()?;
            }
            Ok(renewed)
        })
    }

    fn release_if_owned(&self, name: &str, token: u128) -> LeaseStoreResult<bool> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let owned = {
                let mut table = write_txn.open_table(tables::LEASES)?;
                let owned = match table.get(name)? {
                    Some(guard) => Self::decode(guard.value())?.token == token,
                    None => false,
                };
                if owned {
                    table.remove(name)?;
                }
                owned
            };
            if owned {
                write_txn.commit()?;
            }
            Ok(owned)
        })
    }

    fn get(&self, name: &str) -> LeaseStoreResult<Option<StoredLease>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::LEASES)?;
            match table.get(name)? {
                Some(guard) => Ok(Some(Self::decode(guard.value())?)),
                None => Ok(None),
            }
        })
    }

    fn list(&self) -> LeaseStoreResult<Vec<StoredLease>> {
        self.with_db(|db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(tables::LEASES)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let entry = entry?;
                result.push(Self::decode(entry.1.value())?);
            }
            Ok(result)
        })
    }

    fn purge_expired(&self, now_ms: u64) -> LeaseStoreResult<usize> {
        self.with_db(|db| {
            let write_txn = db.begin_write()?;
            let purged = {
                let mut table = write_txn.open_table(tables::LEASES)?;
                let mut dead = Vec::new();
                for entry in table.iter()? {
                    let entry = entry?;
                    if !Self::decode(entry.1.value())?.is_valid_at(now_ms) {
                        dead.push(entry.0.value().to_string());
                    }
                }
                for name in &dead {
                    table.remove(name.as_str())?;
                }
                dead.len()
            };
            write_txn.commit()?;
            Ok(purged)
        })
    }
}

/// In-process lease table, for tests and single-worker setups
#[derive(Default)]
pub struct MemoryLeaseTable {
    rows: Mutex<HashMap<String, StoredLease>>,
}

impl MemoryLeaseTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseTable for MemoryLeaseTable {
    fn insert_if_free(
        &self,
        lease: &StoredLease,
        now_ms: u64,
    ) -> LeaseStoreResult<Option<StoredLease>> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.get(&lease.name).filter(|l| l.is_valid_at(now_ms)) {
            return Ok(Some(existing.clone()));
        }
        rows.insert(lease.name.clone(), lease.clone());
        Ok(None)
    }

    fn compare_and_renew(
        &self,
        name: &str,
        token: u128,
        now_ms: u64,
        new_expiry_ms: u64,
    ) -> LeaseStoreResult<Option<StoredLease>> {
        let mut rows = self.rows.lock();
        Ok(rows
            .get_mut(name)
            .filter(|l| l.token == token && l.is_valid_at(now_ms))
            .map(|lease| {
                lease.expires_at_ms = new_expiry_ms;
                lease.renewals += 1;
                lease.clone()
            }))
    }

    fn release_if_owned(&self, name: &str, token: u128) -> LeaseStoreResult<bool> {
        let mut rows = self.rows.lock();
        if rows.get(name).is_some_and(|l| l.token == token) {
            rows.remove(name);
            return Ok(true);
        }
        Ok(false)
    }

    fn get(&self, name: &str) -> LeaseStoreResult<Option<StoredLease>> {
        Ok(self.rows.lock().get(name).cloned())
    }

    fn list(&self) -> LeaseStoreResult<Vec<StoredLease>> {
        Ok(self.rows.lock().values().cloned().collect())
    }

    fn purge_expired(&self, now_ms: u64) -> LeaseStoreResult<usize> {
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|_, l| l.is_valid_at(now_ms));
        Ok(before - rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn lease(name: &str, token: u128, expires_at_ms: u64) -> StoredLease {
        StoredLease {
            name: name.to_string(),
            holder: format!("worker-{token}"),
            token,
            created_at_ms: 0,
            expires_at_ms,
            renewals: 0,
        }
    }

    fn exercise(table: &dyn LeaseTable) {
        assert!(table.insert_if_free(&lease("a", 1, 100), 0).unwrap().is_none());

        // Live row blocks a second insert
        let blocking = table.insert_if_free(&lease("a", 2, 200), 50).unwrap();
        assert_eq!(blocking.map(|l| l.token), Some(1));

        // Renewal only by the owner, only while valid
        assert!(table.compare_and_renew("a", 2, 50, 300).unwrap().is_none());
        let renewed = table.compare_and_renew("a", 1, 50, 300).unwrap().unwrap();
        assert_eq!(renewed.expires_at_ms, 300);
        assert_eq!(renewed.renewals, 1);
        assert!(table.compare_and_renew("a", 1, 300, 400).unwrap().is_none());

        // Expired row can be taken over
        assert!(table.insert_if_free(&lease("a", 2, 600), 300).unwrap().is_none());
        assert!(!table.release_if_owned("a", 1).unwrap());
        assert_eq!(table.get("a").unwrap().map(|l| l.token), Some(2));
        assert!(table.release_if_owned("a", 2).unwrap());
        assert!(table.get("a").unwrap().is_none());

        table.insert_if_free(&lease("x", 3, 10), 0).unwrap();
        table.insert_if_free(&lease("y", 4, 1_000), 0).unwrap();
        assert_eq!(table.purge_expired(500).unwrap(), 1);
        let names: Vec<_> = table.list().unwrap().into_iter().map(|l| l.name).collect();
        assert_eq!(names, vec!["y".to_string()]);
    }

    #[test]
    fn test_redb_table_semantics() {
        let dir = tempdir().unwrap();
        let table = RedbLeaseTable::open(dir.path().join("leases.redb")).unwrap();
        exercise(&table);
    }

    #[test]
    fn test_shared_redb_table_semantics() {
        let dir = tempdir().unwrap();
        let table = RedbLeaseTable::open_shared(dir.path().join("leases.redb")).unwrap();
        exercise(&table);
    }

    #[test]
    fn test_memory_table_semantics() {
        exercise(&MemoryLeaseTable::new());
    }

    #[test]
    fn test_shared_handles_see_each_other() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("leases.redb");
        let first = RedbLeaseTable::open_shared(&path).unwrap();
        let second = RedbLeaseTable::open_shared(&path).unwrap();

        assert!(first.insert_if_free(&lease("store:n/a", 1, 1_000), 0).unwrap().is_none());
        let blocking = second
            .insert_if_free(&lease("store:n/a", 2, 1_000), 10)
            .unwrap();
        assert_eq!(blocking.map(|l| l.holder), Some("worker-1".to_string()));
    }
}
