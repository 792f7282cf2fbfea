//! Restore cache.
//!
//! A read of a member whose archive only exists remotely materializes the
//! whole bundle under the node's cache directory. The worker that restored
//! it keeps the `restore:<node>/<archive>` lease for as long as a deferred
//! deletion task considers the entry in use, so no other worker deletes a
//! bundle that is still being read. Cache hits never take the lease; they
//! touch the file's modification time instead.
//!
//! The lease is renewed alongside the restore wait and the download, so the
//! poll backoff and the lease lifetime are independent settings.

use crate::bundle::{self, PART_SUFFIX};
use crate::catalog::ArchiveLocation;
use crate::keeper::{OnLapse, keep_lease_while};
use coldpack_backend::naming::BUNDLE_EXTENSION;
use coldpack_backend::{ArchiveBackend, NamingStrategy, RestoreStatus};
use coldpack_common::clock::system_time_ms;
use coldpack_common::config::RestoreConfig;
use coldpack_common::{ArchiveId, Clock, Error, NodeId, Result};
use coldpack_lease::{AcquireOutcome, LeaseCoordinator, LeaseHandle, RenewOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// How a bundle came to be in the cache
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheFetch {
    Hit,
    Restored,
}

/// Deferred deletion of one restored bundle
#[derive(Clone, Debug)]
pub struct RestoreTask {
    pub node: NodeId,
    pub archive: ArchiveId,
    pub cache_path: PathBuf,
    pub lease_name: String,
    pub lease_created_at_ms: u64,
    pub renew_interval: Duration,
    pub renewals_left: u32,
}

struct TaskEntry {
    task: RestoreTask,
    last_access_ms: Arc<AtomicU64>,
}

/// Result of a cache sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub busy: usize,
    pub live: usize,
}

/// Lease name guarding the cache entry of one archive
#[must_use]
pub fn restore_lease_name(node: &NodeId, archive: &ArchiveId) -> String {
    format!("restore:{node}/{archive}")
}

pub struct RestoreCache {
    cache_root: PathBuf,
    naming: Arc<dyn NamingStrategy>,
    backend: Arc<dyn ArchiveBackend>,
    leases: Arc<LeaseCoordinator>,
    config: RestoreConfig,
    clock: Arc<dyn Clock>,
    tasks: Mutex<HashMap<PathBuf, TaskEntry>>,
    handles: Mutex<JoinSet<()>>,
    shutdown: watch::Sender<bool>,
}

impl RestoreCache {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        naming: Arc<dyn NamingStrategy>,
        backend: Arc<dyn ArchiveBackend>,
        leases: Arc<LeaseCoordinator>,
        config: RestoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            cache_root: cache_root.into(),
            naming,
            backend,
            leases,
            config,
            clock,
            tasks: Mutex::new(HashMap::new()),
            handles: Mutex::new(JoinSet::new()),
            shutdown,
        }
    }

    #[must_use]
    pub fn cache_path(&self, node: &NodeId, archive: &ArchiveId) -> PathBuf {
        self.naming.cache_path(&self.cache_root, node, archive)
    }

    /// Deferred deletion tasks currently owned by this process
    #[must_use]
    pub fn tasks(&self) -> Vec<RestoreTask> {
        let mut tasks: Vec<_> = self.tasks.lock().values().map(|e| e.task.clone()).collect();
        tasks.sort_by(|a, b| a.cache_path.cmp(&b.cache_path));
        tasks
    }

    /// Make the bundle of a submitted archive available locally
    pub async fn fetch(self: &Arc<Self>, location: &ArchiveLocation) -> Result<(PathBuf, CacheFetch)> {
        let key = location.remote_key.clone().ok_or_else(|| {
            Error::internal(format!("{}/{} has no remote key", location.node, location.archive))
        })?;
        let path = self.cache_path(&location.node, &location.archive);
        let lease_name = restore_lease_name(&location.node, &location.archive);
        let started = Instant::now();
        let mut waits = 0;

        loop {
            if tokio::fs::try_exists(&path).await? {
                self.touch(&path);
                debug!("Cache hit for {}", path.display());
                return Ok((path, CacheFetch::Hit));
            }
            match self.leases.acquire(&lease_name)? {
                AcquireOutcome::Acquired(mut handle) => {
                    if tokio::fs::try_exists(&path).await? {
                        // Left behind by a worker that stopped renewing
                        info!("Adopting cache entry {}", path.display());
                        self.register(location, path.clone(), handle);
                        self.touch(&path);
                        return Ok((path, CacheFetch::Hit));
                    }
                    return match self.restore_into(&key, &path, &mut handle, location).await {
                        Ok(()) => {
                            self.register(location, path.clone(), handle);
                            Ok((path, CacheFetch::Restored))
                        }
                        Err(e) => {
                            if !matches!(e, Error::LeaseExpired(_)) {
                                let _ = tokio::fs::remove_file(bundle::part_path(&path)).await;
                            }
                            if let Err(release) = self.leases.release(handle) {
                                warn!("Failed to release {}: {}", lease_name, release);
                            }
                            Err(e)
                        }
                    };
                }
                AcquireOutcome::Busy { holder, .. } => {
                    waits += 1;
                    if waits > self.config.restore_wait_max_iterations {
                        return Err(Error::RestoreTimeout {
                            target: lease_name,
                            waited_ms: elapsed_ms(started),
                        });
                    }
                    debug!(
                        "{} is being restored by {}; waiting ({}/{})",
                        path.display(),
                        holder,
                        waits,
                        self.config.restore_wait_max_iterations
                    );
                    tokio::time::sleep(self.config.max_iteration_waiting_period()).await;
                }
            }
        }
    }

    async fn restore_into(
        &self,
        key: &str,
        path: &Path,
        handle: &mut LeaseHandle,
        location: &ArchiveLocation,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = bundle::part_path(path);
        let started = Instant::now();
        let work = self.download(key, &part, location);
        let size = keep_lease_while(&self.leases, handle, OnLapse::Abort, work).await?;
        // Whoever took the lease over may be downloading into the same part file
        if self.leases.renew(handle)? == RenewOutcome::Expired {
            return Err(Error::LeaseExpired(handle.name().to_string()));
        }
        tokio::fs::rename(&part, path).await?;
        info!(
            "Restored {} into {} ({} bytes, {} ms)",
            key,
            path.display(),
            size,
            elapsed_ms(started)
        );
        Ok(())
    }

    /// Request a restore of `key`, wait until it is readable and download it
    /// into `part`, verified against the archive's checksum
    async fn download(&self, key: &str, part: &Path, location: &ArchiveLocation) -> Result<u64> {
        info!("Requesting restore of {} from {}", key, self.backend.kind());
        self.backend.request_restore(key).await?;

        let started = Instant::now();
        let deadline = started + self.config.s3_access_timeout();
        let mut delay = self.config.poll_initial_delay();
        let mut unreachable = 0;
        loop {
            match self.backend.restore_status(key).await {
                Ok(RestoreStatus::Available) => break,
                Ok(RestoreStatus::Pending) => unreachable = 0,
                Ok(status @ (RestoreStatus::NotRequested | RestoreStatus::Expired)) => {
                    unreachable = 0;
                    info!("Restore of {} reported {:?}; requesting again", key, status);
                    self.backend.request_restore(key).await?;
                }
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    unreachable += 1;
                    if unreachable >= self.config.max_unreachable_attempts {
                        return Err(e);
                    }
                    warn!(
                        "Restore status of {} unavailable ({}/{}): {}",
                        key, unreachable, self.config.max_unreachable_attempts, e
                    );
                }
            }
            if Instant::now() + delay > deadline {
                return Err(Error::RestoreTimeout {
                    target: key.to_string(),
                    waited_ms: elapsed_ms(started),
                });
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.max_iteration_waiting_period());
        }

        let size = self.backend.get(key, part).await?;
        let check = part.to_path_buf();
        let (_, checksum) = tokio::task::spawn_blocking(move || bundle::checksum_file(&check))
            .await
            .map_err(|e| Error::internal(e.to_string()))??;
        let expected = location.bundle_checksum.as_ref();
        if expected.is_some_and(|c| !c.same_content(&checksum))
            || location.bundle_size.is_some_and(|s| s != size)
        {
            let _ = tokio::fs::remove_file(part).await;
            return Err(Error::corrupt(
                &location.archive,
                format!(
                    "restored bundle is {size} bytes with checksum {checksum}, expected {} bytes with {}",
                    location.bundle_size.unwrap_or_default(),
                    expected.map(ToString::to_string).unwrap_or_default()
                ),
            ));
        }
        Ok(size)
    }

    /// Record interest in a cache entry
    fn touch(&self, path: &Path) {
        let now_ms = self.clock.now_ms();
        if let Some(entry) = self.tasks.lock().get(path) {
            entry.last_access_ms.fetch_max(now_ms, Ordering::SeqCst);
        }
        let stamp = UNIX_EPOCH + Duration::from_millis(now_ms);
        if let Err(e) = std::fs::File::options()
            .write(true)
            .open(path)
            .and_then(|f| f.set_modified(stamp))
        {
            debug!("Could not touch {}: {}", path.display(), e);
        }
    }

    fn register(self: &Arc<Self>, location: &ArchiveLocation, path: PathBuf, handle: LeaseHandle) {
        let renew_interval = self
            .config
            .renew_duration()
            .saturating_sub(self.config.renew_call_margin())
            .max(Duration::from_millis(1));
        let lifetime = self.config.cache_lifetime().as_millis();
        let renewals_left =
            u32::try_from(lifetime.div_ceil(renew_interval.as_millis())).unwrap_or(u32::MAX);
        let task = RestoreTask {
            node: location.node.clone(),
            archive: location.archive.clone(),
            cache_path: path.clone(),
            lease_name: handle.name().to_string(),
            lease_created_at_ms: handle.created_at_ms(),
            renew_interval,
            renewals_left,
        };
        let last_access_ms = Arc::new(AtomicU64::new(self.clock.now_ms()));
        self.tasks.lock().insert(
            path,
            TaskEntry {
                task: task.clone(),
                last_access_ms: last_access_ms.clone(),
            },
        );
        let this = Arc::clone(self);
        let shutdown = self.shutdown.subscribe();
        self.handles
            .lock()
            .spawn(async move { this.deferred_deletion(task, handle, last_access_ms, shutdown).await });
    }

    async fn deferred_deletion(
        self: Arc<Self>,
        task: RestoreTask,
        mut handle: LeaseHandle,
        last_access_ms: Arc<AtomicU64>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(task.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut renewals_left = task.renewals_left;

        let delete = loop {
            if *shutdown.borrow() {
                break true;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break true,
            }
            let idle = self.idle_for(&task.cache_path, &last_access_ms).await;
            if idle >= self.config.cache_idle_timeout() {
                debug!("{} idle for {:?}", task.cache_path.display(), idle);
                break true;
            }
            if renewals_left == 0 {
                info!("{} reached its cache lifetime", task.cache_path.display());
                break true;
            }
            match self.leases.renew(&mut handle) {
                Ok(RenewOutcome::Renewed) => {
                    renewals_left -= 1;
                    if let Some(entry) = self.tasks.lock().get_mut(&task.cache_path) {
                        entry.task.renewals_left = renewals_left;
                    }
                }
                Ok(RenewOutcome::Expired) => {
                    warn!(
                        "Lost {}; leaving {} to its new owner",
                        task.lease_name,
                        task.cache_path.display()
                    );
                    break false;
                }
                Err(e) => warn!("Could not renew {}: {}", task.lease_name, e),
            }
        };

        self.tasks.lock().remove(&task.cache_path);
        if !delete {
            return;
        }
        match tokio::fs::remove_file(&task.cache_path).await {
            Ok(()) => info!("Deleted cache entry {}", task.cache_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                // Keep the lease; it expires and the sweep retries
                error!("Could not delete {}: {}", task.cache_path.display(), e);
                return;
            }
        }
        if let Err(e) = self.leases.release(handle) {
            warn!("Failed to release {}: {}", task.lease_name, e);
        }
    }

    /// Time since the last recorded interest, in memory or on disk
    async fn idle_for(&self, path: &Path, last_access_ms: &AtomicU64) -> Duration {
        let mut last = last_access_ms.load(Ordering::SeqCst);
        if let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) {
            last = last.max(system_time_ms(modified));
        }
        Duration::from_millis(self.clock.now_ms().saturating_sub(last))
    }

    /// Delete cache files of `node` that nobody in this process looks after
    /// and that are past their lifetime, or abandoned partial downloads.
    pub async fn sweep_cache(&self, node: &NodeId) -> Result<SweepReport> {
        {
            let mut handles = self.handles.lock();
            while handles.try_join_next().is_some() {}
        }
        let mut report = SweepReport::default();
        let dir = self.naming.cache_dir(&self.cache_root, node);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };
        let now_ms = self.clock.now_ms();
        let lifetime_ms = u64::try_from(self.config.cache_lifetime().as_millis()).unwrap_or(u64::MAX);

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (id, partial) = match name.strip_suffix(PART_SUFFIX) {
                Some(bundle_name) => (bundle_name, true),
                None => (name, false),
            };
            let Some(id) = id.strip_suffix(&format!(".{BUNDLE_EXTENSION}")) else {
                continue;
            };
            let bundle_path = path.with_file_name(format!("{id}.{BUNDLE_EXTENSION}"));
            if self.tasks.lock().contains_key(&bundle_path) {
                report.live += 1;
                continue;
            }
            if !partial {
                let modified = entry.metadata().await?.modified().unwrap_or(SystemTime::now());
                if now_ms.saturating_sub(system_time_ms(modified)) < lifetime_ms {
                    report.live += 1;
                    continue;
                }
            }

            let lease_name = restore_lease_name(node, &ArchiveId::new_unchecked(id));
            match self.leases.acquire(&lease_name)? {
                AcquireOutcome::Acquired(handle) => {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            info!("Swept {}", path.display());
                            report.removed += 1;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!("Could not sweep {}: {}", path.display(), e),
                    }
                    self.leases.release(handle)?;
                }
                AcquireOutcome::Busy { .. } => report.busy += 1,
            }
        }
        Ok(report)
    }

    /// Delete every entry owned by this process now and wait for the tasks
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut handles = std::mem::take(&mut *self.handles.lock());
        while let Some(res) = handles.join_next().await {
            if let Err(e) = res {
                warn!("Deferred deletion task failed: {}", e);
            }
        }
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::MemberEntry;
    use chrono::Utc;
    use coldpack_backend::{ColdStoreBackend, DefaultNaming, MemoryColdStore};
    use coldpack_common::{ArchiveState, Checksum, ManualClock, MemberPath, SystemClock};
    use coldpack_lease::{LeaseTable, MemoryLeaseTable};
    use tempfile::tempdir;

    fn fast_config() -> RestoreConfig {
        RestoreConfig {
            renew_duration_ms: 200,
            renew_call_margin_ms: 100,
            poll_initial_delay_ms: 1,
            renew_max_iteration_waiting_period_ms: 20,
            restore_wait_max_iterations: 50,
            s3_access_timeout_s: 10,
            cache_idle_timeout_ms: 300,
            ..RestoreConfig::default()
        }
    }

    struct Harness {
        store: Arc<MemoryColdStore>,
        table: Arc<MemoryLeaseTable>,
        cache: Arc<RestoreCache>,
        root: PathBuf,
    }

    fn harness(root: &Path, store: Arc<MemoryColdStore>, config: RestoreConfig, holder: &str) -> Harness {
        harness_with_table(root, store, Arc::new(MemoryLeaseTable::new()), config, holder)
    }

    fn harness_with_table(
        root: &Path,
        store: Arc<MemoryColdStore>,
        table: Arc<MemoryLeaseTable>,
        config: RestoreConfig,
        holder: &str,
    ) -> Harness {
        harness_at(root, store, table, config, holder, Arc::new(SystemClock))
    }

    fn harness_at(
        root: &Path,
        store: Arc<MemoryColdStore>,
        table: Arc<MemoryLeaseTable>,
        config: RestoreConfig,
        holder: &str,
        clock: Arc<dyn Clock>,
    ) -> Harness {
        let leases = Arc::new(LeaseCoordinator::new(
            table.clone(),
            holder,
            config.renew_duration(),
            clock.clone(),
        ));
        let backend = Arc::new(ColdStoreBackend::new(store.clone(), 5 * 1024 * 1024, 2));
        let cache = Arc::new(RestoreCache::new(
            root,
            Arc::new(DefaultNaming::default()),
            backend,
            leases,
            config,
            clock,
        ));
        Harness {
            store,
            table,
            cache,
            root: root.to_path_buf(),
        }
    }

    /// Upload a one-member bundle and describe it the way the catalog would
    async fn remote_archive(store: &MemoryColdStore, payload: &[u8]) -> ArchiveLocation {
        use coldpack_backend::ColdStoreClient;

        let node = NodeId::new("n1").unwrap();
        let archive = ArchiveId::generate(Utc::now());
        let dir = tempdir().unwrap();
        let path = bundle::bundle_path(dir.path(), &archive);
        bundle::create_bundle(&path).unwrap();
        let offset = bundle::append_member(&path, bundle::HEADER_LEN, payload).unwrap();
        let entry = MemberEntry {
            offset,
            length: payload.len() as u64,
            checksum: Checksum::of(payload),
            added_at: Utc::now(),
        };
        let member = MemberPath::new("f.dat").unwrap();
        let members = [(member.clone(), entry.clone())].into_iter().collect();
        let (size, checksum) =
            bundle::write_trailer(&path, offset + payload.len() as u64, &members).unwrap();
        let key = DefaultNaming::default().remote_key(&node, &archive);
        store
            .put_object(&key, std::fs::read(&path).unwrap().into(), Default::default())
            .await
            .unwrap();
        ArchiveLocation {
            node,
            archive,
            state: ArchiveState::Submitted,
            member,
            entry,
            remote_key: Some(key),
            bundle_size: Some(size),
            bundle_checksum: Some(checksum),
            corrupt: false,
        }
    }

    #[tokio::test]
    async fn test_restore_after_third_poll() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            Arc::new(MemoryColdStore::with_restore_after_polls(3)),
            fast_config(),
            "w1",
        );
        let loc = remote_archive(&h.store, b"cold bytes").await;

        let (path, how) = h.cache.fetch(&loc).await.unwrap();
        assert_eq!(how, CacheFetch::Restored);
        assert_eq!(h.store.status_polls(), 3);
        assert_eq!(h.store.restore_requests(), 1);
        assert!(!bundle::part_path(&path).exists());
        let data = bundle::read_member(&path, &loc.archive, &loc.member, &loc.entry).unwrap();
        assert_eq!(data, b"cold bytes");

        // The lease stays held while the entry is in use
        let tasks = h.cache.tasks();
        assert_eq!(tasks.len(), 1);
        assert!(h.table.get(&tasks[0].lease_name).unwrap().is_some());

        let (_, how) = h.cache.fetch(&loc).await.unwrap();
        assert_eq!(how, CacheFetch::Hit);
        assert_eq!(h.store.restore_requests(), 1);
        h.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_restore_outlives_lease_ttl() {
        let dir = tempdir().unwrap();
        // Backoff reaches 400 ms against a 200 ms lease
        let config = RestoreConfig {
            renew_duration_ms: 200,
            renew_call_margin_ms: 3,
            poll_initial_delay_ms: 3,
            renew_max_iteration_waiting_period_ms: 400,
            cache_idle_timeout_ms: 60_000,
            ..fast_config()
        };
        let h = harness(
            dir.path(),
            Arc::new(MemoryColdStore::with_restore_after_polls(10)),
            config,
            "w1",
        );
        let loc = remote_archive(&h.store, b"slow bytes").await;

        let (path, how) = h.cache.fetch(&loc).await.unwrap();
        assert_eq!(how, CacheFetch::Restored);
        assert_eq!(h.store.status_polls(), 10);
        assert_eq!(h.store.restore_requests(), 1);

        let lease = h
            .table
            .get(&restore_lease_name(&loc.node, &loc.archive))
            .unwrap()
            .unwrap();
        assert_eq!(lease.holder, "w1");
        assert!(lease.renewals > 0);
        let data = bundle::read_member(&path, &loc.archive, &loc.member, &loc.entry).unwrap();
        assert_eq!(data, b"slow bytes");
        h.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_lease_lost_during_download() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(MemoryLeaseTable::new());
        let store = Arc::new(MemoryColdStore::new());
        store.delay_gets(Duration::from_millis(300));
        let h = harness_at(
            dir.path(),
            store.clone(),
            table.clone(),
            fast_config(),
            "w1",
            clock.clone(),
        );
        let loc = remote_archive(&store, b"bytes").await;
        let name = restore_lease_name(&loc.node, &loc.archive);
        let thief = LeaseCoordinator::new(table.clone(), "w2", Duration::from_secs(60), clock.clone());

        let (res, stolen) = tokio::join!(h.cache.fetch(&loc), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            clock.advance(Duration::from_secs(10));
            thief.acquire(&name).unwrap()
        });
        assert!(matches!(stolen, AcquireOutcome::Acquired(_)));
        assert!(matches!(res.unwrap_err(), Error::LeaseExpired(_)));
        assert!(!h.cache.cache_path(&loc.node, &loc.archive).exists());
        assert!(h.cache.tasks().is_empty());
        // The new owner keeps its lease
        assert_eq!(table.get(&name).unwrap().unwrap().holder, "w2");
    }

    #[tokio::test]
    async fn test_idle_entry_is_deleted_and_lease_released() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), fast_config(), "w1");
        let loc = remote_archive(&h.store, b"bytes").await;
        let (path, _) = h.cache.fetch(&loc).await.unwrap();
        let lease = restore_lease_name(&loc.node, &loc.archive);

        for _ in 0..100 {
            if !path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!path.exists());
        // The task releases right after deleting
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.table.get(&lease).unwrap().is_none());
        assert!(h.cache.tasks().is_empty());
        assert!(h.store.object_bytes(loc.remote_key.as_deref().unwrap()).is_some());
    }

    #[tokio::test]
    async fn test_shutdown_deletes_entries() {
        let dir = tempdir().unwrap();
        let config = RestoreConfig {
            cache_idle_timeout_ms: 60_000,
            ..fast_config()
        };
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), config, "w1");
        let loc = remote_archive(&h.store, b"bytes").await;
        let (path, _) = h.cache.fetch(&loc).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(path.exists());
        h.cache.shutdown().await;
        assert!(!path.exists());
        assert!(h.table.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_uses_entry_restored_by_other_worker() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryColdStore::with_restore_after_polls(5));
        let table = Arc::new(MemoryLeaseTable::new());
        let config = RestoreConfig {
            poll_initial_delay_ms: 10,
            cache_idle_timeout_ms: 60_000,
            ..fast_config()
        };
        let a = harness_with_table(dir.path(), store.clone(), table.clone(), config.clone(), "w1");
        let b = harness_with_table(dir.path(), store.clone(), table, config, "w2");
        let loc = remote_archive(&store, b"shared").await;

        let (first, second) = tokio::join!(a.cache.fetch(&loc), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            b.cache.fetch(&loc).await
        });
        assert_eq!(first.unwrap().1, CacheFetch::Restored);
        assert_eq!(second.unwrap().1, CacheFetch::Hit);
        assert_eq!(store.restore_requests(), 1);
        assert_eq!(a.root, b.root);
        a.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_budget_exhausted() {
        let dir = tempdir().unwrap();
        let config = RestoreConfig {
            restore_wait_max_iterations: 3,
            renew_max_iteration_waiting_period_ms: 5,
            ..fast_config()
        };
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), config, "w1");
        let loc = remote_archive(&h.store, b"bytes").await;
        let other = LeaseCoordinator::new(
            h.table.clone(),
            "w2",
            Duration::from_secs(60),
            Arc::new(SystemClock),
        );
        let _held = other.acquire(&restore_lease_name(&loc.node, &loc.archive)).unwrap();

        let err = h.cache.fetch(&loc).await.unwrap_err();
        assert!(matches!(err, Error::RestoreTimeout { .. }));
        assert!(err.is_temporarily_unavailable());
        assert_eq!(h.store.restore_requests(), 0);
    }

    #[tokio::test]
    async fn test_lapsed_copy_is_restored_again() {
        let dir = tempdir().unwrap();
        let h = harness(
            dir.path(),
            Arc::new(MemoryColdStore::with_restore_after_polls(2)),
            fast_config(),
            "w1",
        );
        let loc = remote_archive(&h.store, b"bytes").await;
        // A previous restore whose copy has since lapsed
        h.store.expire_restored_copy(loc.remote_key.as_deref().unwrap());
        h.store.fail_next_status_checks(2);

        let (path, how) = h.cache.fetch(&loc).await.unwrap();
        assert_eq!(how, CacheFetch::Restored);
        assert_eq!(h.store.restore_requests(), 1);
        assert_eq!(h.store.status_polls(), 2);
        assert!(path.exists());
        h.cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_store_gives_up() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), fast_config(), "w1");
        let loc = remote_archive(&h.store, b"bytes").await;
        h.store.fail_next_status_checks(100);

        let err = h.cache.fetch(&loc).await.unwrap_err();
        assert!(err.is_temporarily_unavailable());
        assert!(!h.cache.cache_path(&loc.node, &loc.archive).exists());
        assert!(h.table.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_remote_object() {
        let dir = tempdir().unwrap();
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), fast_config(), "w1");
        let mut loc = remote_archive(&h.store, b"bytes").await;
        loc.remote_key = Some("coldpack/n1/missing.cpk".to_string());

        assert!(h.cache.fetch(&loc).await.unwrap_err().is_not_found());
        // Lease released on failure
        assert!(h.table.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_respects_held_leases() {
        let dir = tempdir().unwrap();
        let config = RestoreConfig {
            cache_lifetime_hours: 0,
            ..fast_config()
        };
        let h = harness(dir.path(), Arc::new(MemoryColdStore::new()), config, "w1");
        let node = NodeId::new("n1").unwrap();
        let cache_dir = DefaultNaming::default().cache_dir(dir.path(), &node);
        std::fs::create_dir_all(&cache_dir).unwrap();

        let held = ArchiveId::new_unchecked("20240101000000000-held0000");
        let free = ArchiveId::new_unchecked("20240101000000000-free0000");
        let held_path = h.cache.cache_path(&node, &held);
        let free_path = h.cache.cache_path(&node, &free);
        std::fs::write(&held_path, b"x").unwrap();
        std::fs::write(&free_path, b"x").unwrap();
        std::fs::write(bundle::part_path(&free_path), b"partial").unwrap();

        let other = LeaseCoordinator::new(
            h.table.clone(),
            "w2",
            Duration::from_secs(60),
            Arc::new(SystemClock),
        );
        let _guard = other.acquire(&restore_lease_name(&node, &held)).unwrap();

        let report = h.cache.sweep_cache(&node).await.unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.busy, 1);
        assert!(held_path.exists());
        assert!(!free_path.exists());
        assert!(!bundle::part_path(&free_path).exists());
    }
}
