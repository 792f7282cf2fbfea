//! Entry points used by the worker: `store`, `retrieve`, `delete` and
//! `periodic_maintenance`.
//!
//! Several processes may share one workspace. Writes take the node's build
//! lease and wait briefly when another process holds it; reads fall back to
//! re-reading the manifests when the index does not know a member.

use crate::builder::ArchiveBuilder;
use crate::bundle;
use crate::catalog::{ArchiveCatalog, ArchiveLocation, NodeWorkspace};
use crate::restore::{CacheFetch, RestoreCache, SweepReport};
use crate::submitter::{ArchiveSubmitter, SubmissionResult, store_lease_name};
use bytes::Bytes;
use coldpack_backend::{ArchiveBackend, NamingStrategy};
use coldpack_common::{
    ArchiveId, ArchiveRef, ArchiveState, Checksum, Clock, Config, Error, MemberPath, NodeId,
    Result, SealReason, SmallFile,
};
use coldpack_lease::{AcquireOutcome, LeaseCoordinator, LeaseTable};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts at taking a node's build lease before giving up with `LeaseBusy`
const WRITER_ATTEMPTS: u32 = 50;
const WRITER_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Times a delete chases a member that another worker moved meanwhile
const DELETE_ATTEMPTS: u32 = 3;

/// Where a retrieved file was read from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieveSource {
    /// The archive has not been uploaded yet
    Workspace,
    CacheHit,
    Restored,
}

#[derive(Clone, Debug)]
pub struct RetrievedFile {
    pub node: NodeId,
    pub path: MemberPath,
    pub archive: ArchiveId,
    pub data: Bytes,
    pub checksum: Checksum,
    pub source: RetrieveSource,
}

/// What `delete` did
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Dropped from `archive`, which is gone now; its other members live in
    /// `replacement`
    Removed {
        archive: ArchiveId,
        replacement: Option<ArchiveId>,
    },
    /// Nothing stored under that path
    Absent,
}

/// Outcome of one maintenance pass over a node
#[derive(Clone, Debug, Default)]
pub struct MaintenanceReport {
    pub sealed: Vec<(ArchiveId, SealReason)>,
    pub submissions: Vec<SubmissionResult>,
    pub sweep: SweepReport,
    pub purged_leases: usize,
}

/// Archive counts for one node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node: String,
    pub building: usize,
    pub sealed: usize,
    pub submitted: usize,
    pub failed: usize,
    pub corrupt: usize,
    pub members: usize,
    /// Member bytes still waiting in the workspace
    pub pending_bytes: u64,
}

pub struct ColdArchiveService {
    config: Config,
    builder: Arc<ArchiveBuilder>,
    submitter: ArchiveSubmitter,
    cache: Arc<RestoreCache>,
    leases: Arc<LeaseCoordinator>,
}

impl ColdArchiveService {
    pub fn open(
        config: Config,
        backend: Arc<dyn ArchiveBackend>,
        lease_table: Arc<dyn LeaseTable>,
        naming: Arc<dyn NamingStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let leases = Arc::new(LeaseCoordinator::new(
            lease_table,
            config.worker.holder_id(),
            config.restore.renew_duration(),
            clock.clone(),
        ));
        let catalog = Arc::new(ArchiveCatalog::new(
            &config.worker.workspace_dir,
            naming.clone(),
            clock.clone(),
        ));
        let builder = Arc::new(ArchiveBuilder::new(
            catalog,
            leases.clone(),
            config.archive.clone(),
            clock.clone(),
        ));
        let submitter = ArchiveSubmitter::new(
            builder.clone(),
            backend.clone(),
            leases.clone(),
            config.upload.clone(),
            clock.clone(),
        );
        let cache = Arc::new(RestoreCache::new(
            &config.worker.cache_dir,
            naming,
            backend,
            leases.clone(),
            config.restore.clone(),
            clock,
        ));
        info!(
            "Archive service ready (holder {}, workspace {}, cache {})",
            leases.holder(),
            config.worker.workspace_dir.display(),
            config.worker.cache_dir.display()
        );
        Ok(Self {
            config,
            builder,
            submitter,
            cache,
            leases,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn builder(&self) -> &Arc<ArchiveBuilder> {
        &self.builder
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<RestoreCache> {
        &self.cache
    }

    #[must_use]
    pub const fn leases(&self) -> &Arc<LeaseCoordinator> {
        &self.leases
    }

    fn catalog(&self) -> &ArchiveCatalog {
        self.builder.catalog()
    }

    /// Load (or reload) a node's workspace
    pub fn open_node(&self, node: &NodeId) -> Result<()> {
        self.catalog().load_node(node).map(|_| ())
    }

    /// Run a workspace write, waiting while another process holds the
    /// node's build lease
    async fn with_writer<T>(&self, node: &NodeId, mut write: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match write() {
                Err(Error::LeaseBusy(holder)) if attempt < WRITER_ATTEMPTS => {
                    debug!("Workspace of {} busy ({}); attempt {}", node, holder, attempt);
                    attempt += 1;
                    tokio::time::sleep(WRITER_RETRY_DELAY).await;
                }
                other => return other,
            }
        }
    }

    /// Write path: append to the node's building archive, rolling over once
    /// when it is full
    pub async fn store(&self, node: &NodeId, file: &SmallFile, data: &[u8]) -> Result<ArchiveRef> {
        let append = || self.builder.append_file(node, file, data);
        match self.with_writer(node, append).await {
            Err(Error::CapacityExceeded { archive, .. }) => {
                debug!("{}/{} full; retrying {} in a new archive", node, archive, file.path);
                self.with_writer(node, append).await
            }
            other => other,
        }
    }

    /// Read path: from the workspace while the archive is local, otherwise
    /// through the restore cache
    pub async fn retrieve(&self, node: &NodeId, path: &MemberPath) -> Result<RetrievedFile> {
        let ws = self.catalog().node(node)?;
        let mut synced = false;
        loop {
            let Some(location) = ws.locate(path) else {
                if synced {
                    return Err(Error::not_found(format!("{node}/{path}")));
                }
                ws.sync(&mut ws.lock())?;
                synced = true;
                continue;
            };
            match self.read_located(&ws, &location).await {
                Ok(file) => return Ok(file),
                // Moved, uploaded or discarded by another worker since the
                // index was loaded
                Err(e) if !synced && (is_missing(&e) || e.is_not_found()) => {
                    debug!("{}/{} not where the index says ({}); rescanning", node, path, e);
                    ws.sync(&mut ws.lock())?;
                    synced = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_located(&self, ws: &NodeWorkspace, location: &ArchiveLocation) -> Result<RetrievedFile> {
        if location.state.is_local() {
            let data = read(ws, location, &ws.bundle_path(&location.archive))?;
            return Ok(retrieved(location.clone(), data, RetrieveSource::Workspace));
        }
        let mut retried = false;
        loop {
            let (bundle_path, how) = self.cache.fetch(location).await?;
            match read(ws, location, &bundle_path) {
                Ok(data) => {
                    let source = match how {
                        CacheFetch::Hit => RetrieveSource::CacheHit,
                        CacheFetch::Restored => RetrieveSource::Restored,
                    };
                    return Ok(retrieved(location.clone(), data, source));
                }
                // Deleted between fetch and read
                Err(e) if is_missing(&e) && !retried => retried = true,
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete path: drop one member.
    ///
    /// The other members of its archive are copied into a new archive and
    /// the old one is discarded, including its remote object once it was
    /// submitted. Deleting a path that is not stored is `Absent`.
    pub async fn delete(&self, node: &NodeId, path: &MemberPath) -> Result<DeleteOutcome> {
        let ws = self.catalog().node(node)?;
        for attempt in 1..=DELETE_ATTEMPTS {
            let location = match ws.locate(path) {
                Some(location) => location,
                None => {
                    ws.sync(&mut ws.lock())?;
                    match ws.locate(path) {
                        Some(location) => location,
                        None => {
                            debug!("{}/{} is not stored; nothing to delete", node, path);
                            return Ok(DeleteOutcome::Absent);
                        }
                    }
                }
            };
            let name = store_lease_name(node, &location.archive);
            let handle = match self.leases.acquire(&name)? {
                AcquireOutcome::Acquired(handle) => handle,
                AcquireOutcome::Busy { holder, .. } => {
                    return Err(Error::LeaseBusy(format!("{name} held by {holder}")));
                }
            };
            let outcome = self.delete_leased(&ws, path, &location.archive).await;
            if let Err(e) = self.leases.release(handle) {
                warn!("Failed to release {}: {}", name, e);
            }
            match outcome? {
                Some(outcome) => return Ok(outcome),
                None => {
                    debug!("{}/{} moved while deleting (attempt {})", node, path, attempt);
                    ws.sync(&mut ws.lock())?;
                }
            }
        }
        Err(Error::LeaseBusy(format!("{node}/{path} kept moving while deleting")))
    }

    /// Delete `path` from `archive` while holding the archive's `store:`
    /// lease. `None` when the member is no longer in that archive.
    async fn delete_leased(
        &self,
        ws: &NodeWorkspace,
        path: &MemberPath,
        archive: &ArchiveId,
    ) -> Result<Option<DeleteOutcome>> {
        let node = ws.node();
        let refreshed = {
            let mut index = ws.lock();
            ws.refresh(&mut index, archive)
        };
        match refreshed {
            Ok(_) => {}
            Err(e) if is_missing(&e) => return Ok(None),
            Err(e) => return Err(e),
        }
        let Some(location) = ws.locate(path).filter(|l| l.archive == *archive) else {
            return Ok(None);
        };
        if location.corrupt {
            return Err(Error::corrupt(archive, "flagged corrupt; not deleting from it"));
        }

        // Under the store lease nobody uploads or discards the archive, so
        // its state only moves from BUILDING to SEALED
        let source = if location.state.is_local() {
            ws.bundle_path(archive)
        } else {
            self.cache.fetch(&location).await?.0
        };
        let rewrite = self
            .with_writer(node, || self.builder.rewrite_without(node, archive, path, &source))
            .await
            .inspect_err(|e| {
                if let Error::CorruptArchive { reason, .. } = e
                    && let Err(flag) = ws.mark_corrupt(archive, reason)
                {
                    warn!("Could not flag {}/{}: {}", node, archive, flag);
                }
            })?;

        if let Err(e) = self.submitter.discard(ws, &rewrite.retired).await {
            // Retired archives are discarded by the next scan
            warn!("Retired archive {}/{} left for maintenance: {}", node, rewrite.retired, e);
        }
        info!("Deleted {}/{} from {}", node, path, archive);
        Ok(Some(DeleteOutcome::Removed {
            archive: rewrite.retired,
            replacement: rewrite.replacement,
        }))
    }

    /// Seal due archives, submit pending ones, sweep the cache and purge
    /// dead leases
    pub async fn periodic_maintenance(&self, node: &NodeId) -> Result<MaintenanceReport> {
        let sealed = match self.builder.seal_due(node) {
            Ok(sealed) => sealed,
            Err(Error::LeaseBusy(holder)) => {
                debug!("Not sealing {} this pass: {}", node, holder);
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        let submissions = self.submitter.scan_and_submit(node).await?;
        let sweep = self.cache.sweep_cache(node).await?;
        let purged_leases = self.leases.purge_expired()?;
        let report = MaintenanceReport {
            sealed,
            submissions,
            sweep,
            purged_leases,
        };
        if !report.sealed.is_empty() || !report.submissions.is_empty() || report.sweep.removed > 0 {
            info!(
                "Maintenance of {}: {} sealed, {} submitted, {} pending, {} cache entries removed",
                node,
                report.sealed.len(),
                report.submissions.iter().filter(|r| r.is_submitted()).count(),
                report.submissions.iter().filter(|r| !r.is_submitted()).count(),
                report.sweep.removed
            );
        }
        Ok(report)
    }

    pub fn status(&self, node: &NodeId) -> Result<NodeStatus> {
        let ws = self.catalog().node(node)?;
        let mut index = ws.lock();
        ws.sync(&mut index)?;
        let mut status = NodeStatus {
            node: node.to_string(),
            members: index.member_count(),
            ..NodeStatus::default()
        };
        for archive in index.archives() {
            match archive.state {
                ArchiveState::Building => status.building += 1,
                ArchiveState::Sealed => status.sealed += 1,
                ArchiveState::Submitted => status.submitted += 1,
                ArchiveState::Failed => status.failed += 1,
            }
            if archive.corrupt {
                status.corrupt += 1;
            }
            if archive.state.is_local() {
                status.pending_bytes += archive.accumulated_size();
            }
        }
        Ok(status)
    }

    /// Seal open archives if configured, then let every deferred deletion
    /// run now
    pub async fn shutdown(&self) -> Result<()> {
        if self.config.archive.seal_on_shutdown {
            for node in self.catalog().loaded_nodes() {
                let seal = || self.builder.seal_current(&node, SealReason::Shutdown);
                if let Some(id) = self.with_writer(&node, seal).await? {
                    info!("Sealed {}/{} on shutdown", node, id);
                }
            }
        }
        self.cache.shutdown().await;
        Ok(())
    }
}

/// Read a member, flagging the archive when its bytes do not match
fn read(ws: &NodeWorkspace, location: &ArchiveLocation, bundle_path: &Path) -> Result<Vec<u8>> {
    bundle::read_member(bundle_path, &location.archive, &location.member, &location.entry).inspect_err(
        |e| {
            if let Error::CorruptArchive { reason, .. } = e
                && let Err(flag) = ws.mark_corrupt(&location.archive, reason)
            {
                warn!("Could not flag {}/{}: {}", ws.node(), location.archive, flag);
            }
        },
    )
}

fn is_missing(e: &Error) -> bool {
    matches!(e, Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound)
}

fn retrieved(location: ArchiveLocation, data: Vec<u8>, source: RetrieveSource) -> RetrievedFile {
    RetrievedFile {
        node: location.node,
        path: location.member,
        archive: location.archive,
        data: Bytes::from(data),
        checksum: location.entry.checksum,
        source,
    }
}
