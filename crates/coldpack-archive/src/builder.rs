//! Archive builder: appends small files to the node's current bundle.
//!
//! Every mutation of a node's archives runs under the `build:<node>` lease
//! and starts from the manifests on disk, so workers in other processes
//! sharing the workspace never write over each other's appends.

use crate::bundle::{self, ArchiveManifest, HEADER_LEN, MemberEntry};
use crate::catalog::{ArchiveCatalog, NodeIndex, NodeWorkspace};
use coldpack_common::config::ArchiveConfig;
use coldpack_common::{
    ArchiveId, ArchiveRef, ArchiveState, Checksum, Clock, Error, MemberPath, NodeId, Result,
    SealReason, SmallFile,
};
use coldpack_lease::{AcquireOutcome, LeaseCoordinator, LeaseHandle};
use parking_lot::MutexGuard;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Placement {
    /// Same name and content already stored
    Existing(ArchiveRef),
    /// Free member name to store under
    New(MemberPath),
}

/// Result of [`ArchiveBuilder::rewrite_without`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rewrite {
    /// Emptied archive, waiting to be discarded
    pub retired: ArchiveId,
    /// Archive now holding the remaining members, if any remained
    pub replacement: Option<ArchiveId>,
    pub moved: usize,
}

/// Lease name serializing writers of one node's workspace
#[must_use]
pub fn build_lease_name(node: &NodeId) -> String {
    format!("build:{node}")
}

/// The node's build lease, released on drop
struct NodeWriter<'a> {
    leases: &'a LeaseCoordinator,
    handle: Option<LeaseHandle>,
}

impl Drop for NodeWriter<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = self.leases.release(handle)
        {
            warn!("Failed to release build lease: {}", e);
        }
    }
}

/// Writer of node workspaces
pub struct ArchiveBuilder {
    catalog: Arc<ArchiveCatalog>,
    leases: Arc<LeaseCoordinator>,
    config: ArchiveConfig,
    clock: Arc<dyn Clock>,
}

impl ArchiveBuilder {
    pub fn new(
        catalog: Arc<ArchiveCatalog>,
        leases: Arc<LeaseCoordinator>,
        config: ArchiveConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            leases,
            config,
            clock,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &Arc<ArchiveCatalog> {
        &self.catalog
    }

    #[must_use]
    pub const fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Take the node's build lease without waiting, then bring the index up
    /// to date with the disk. `LeaseBusy` when another writer is active.
    fn lock_for_write<'a>(
        &'a self,
        ws: &'a NodeWorkspace,
    ) -> Result<(NodeWriter<'a>, MutexGuard<'a, NodeIndex>)> {
        let name = build_lease_name(ws.node());
        let handle = match self.leases.acquire(&name)? {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::Busy { holder, .. } => {
                return Err(Error::LeaseBusy(format!("{name} held by {holder}")));
            }
        };
        let writer = NodeWriter {
            leases: &self.leases,
            handle: Some(handle),
        };
        let mut index = ws.lock();
        ws.sync(&mut index)?;
        Ok((writer, index))
    }

    /// Append `data` as `file` to the node's building archive.
    ///
    /// When the bytes would push the archive past the hard ceiling, the
    /// archive is sealed and `CapacityExceeded` is returned; a retry lands in
    /// a fresh archive.
    pub fn append_file(&self, node: &NodeId, file: &SmallFile, data: &[u8]) -> Result<ArchiveRef> {
        let size = data.len() as u64;
        if size != file.size {
            return Err(Error::invalid_argument(format!(
                "{}: declared {} bytes, got {size}",
                file.path, file.size
            )));
        }
        if size > self.config.small_file_max_size {
            return Err(Error::invalid_argument(format!(
                "{}: {size} bytes exceeds the small file limit of {}",
                file.path, self.config.small_file_max_size
            )));
        }
        if HEADER_LEN + size > self.config.archive_hard_ceiling {
            return Err(Error::invalid_argument(format!(
                "{}: {size} bytes cannot fit in any archive (ceiling {})",
                file.path, self.config.archive_hard_ceiling
            )));
        }
        let checksum = Checksum::of(data);
        if let Some(expected) = &file.checksum
            && !expected.same_content(&checksum)
        {
            return Err(Error::ChecksumMismatch {
                path: file.path.to_string(),
                expected: expected.hex(),
                actual: checksum.hex(),
            });
        }

        let ws = self.catalog.node(node)?;
        let (_writer, mut index) = self.lock_for_write(&ws)?;
        let member = match place(&index, node, &file.path, &checksum) {
            Placement::Existing(existing) => {
                debug!("{} already stored as {}", file.path, existing);
                return Ok(existing);
            }
            Placement::New(member) => member,
        };

        let archive = match index.current() {
            Some(current) => current.id.clone(),
            None => self.open_archive(&ws, &mut index)?,
        };
        let data_len = index.current().map_or(HEADER_LEN, |m| m.data_len);
        if data_len + size > self.config.archive_hard_ceiling {
            let current = data_len - HEADER_LEN;
            seal_locked(&ws, &mut index, &archive, SealReason::Capacity, self.clock.as_ref())?;
            return Err(Error::CapacityExceeded {
                archive,
                current,
                incoming: size,
                ceiling: self.config.archive_hard_ceiling,
            });
        }

        let path = ws.bundle_path(&archive);
        let offset = bundle::append_member(&path, data_len, data)?;
        let Some(manifest) = index.current_mut() else {
            return Err(Error::internal(format!("{node}: building archive vanished")));
        };
        manifest.members.insert(
            member.clone(),
            MemberEntry {
                offset,
                length: size,
                checksum: checksum.clone(),
                added_at: self.clock.now(),
            },
        );
        manifest.data_len = offset + size;
        if let Err(e) = bundle::write_manifest(&ws.index_path(&archive), manifest) {
            // The bytes stay behind as an unreferenced tail
            manifest.members.remove(&member);
            manifest.data_len = data_len;
            return Err(e);
        }
        index.record_member(member.clone(), archive.clone());

        debug!("Appended {} ({} bytes) to {}/{}", member, size, node, archive);
        Ok(ArchiveRef {
            node: node.clone(),
            archive,
            member,
            size,
            checksum,
        })
    }

    fn open_archive(&self, ws: &NodeWorkspace, index: &mut NodeIndex) -> Result<ArchiveId> {
        let now = self.clock.now();
        let id = ArchiveId::generate(now);
        bundle::create_bundle(&ws.bundle_path(&id))?;
        ws.commit(index, ArchiveManifest::new(id.clone(), ws.node().clone(), now))?;
        info!("Opened archive {}/{}", ws.node(), id);
        Ok(id)
    }

    /// Why `manifest` should be sealed now, if at all
    #[must_use]
    pub fn seal_reason(&self, manifest: &ArchiveManifest) -> Option<SealReason> {
        if manifest.state != ArchiveState::Building || manifest.corrupt || manifest.is_empty() {
            return None;
        }
        if manifest.accumulated_size() >= self.config.archive_max_size {
            return Some(SealReason::Size);
        }
        if manifest.file_count() >= self.config.archive_max_files {
            return Some(SealReason::Count);
        }
        let age = self.clock.now().signed_duration_since(manifest.created_at);
        let max_age = chrono::Duration::from_std(self.config.archive_max_age())
            .unwrap_or(chrono::Duration::MAX);
        (age >= max_age).then_some(SealReason::Age)
    }

    /// Seal every building archive of `node` that reached a threshold
    pub fn seal_due(&self, node: &NodeId) -> Result<Vec<(ArchiveId, SealReason)>> {
        let ws = self.catalog.node(node)?;
        let (_writer, mut index) = self.lock_for_write(&ws)?;
        let due: Vec<_> = index
            .archives()
            .filter_map(|m| self.seal_reason(m).map(|r| (m.id.clone(), r)))
            .collect();
        for (id, reason) in &due {
            seal_locked(&ws, &mut index, id, *reason, self.clock.as_ref())?;
        }
        Ok(due)
    }

    /// Seal the current archive regardless of thresholds (if it has members)
    pub fn seal_current(&self, node: &NodeId, reason: SealReason) -> Result<Option<ArchiveId>> {
        let ws = self.catalog.node(node)?;
        let (_writer, mut index) = self.lock_for_write(&ws)?;
        let Some(id) = index
            .current()
            .filter(|m| !m.is_empty())
            .map(|m| m.id.clone())
        else {
            return Ok(None);
        };
        seal_locked(&ws, &mut index, &id, reason, self.clock.as_ref())?;
        Ok(Some(id))
    }

    /// Move every member of `archive` except `member` into a new archive and
    /// retire `archive`.
    ///
    /// `source` holds the archive's bytes: the workspace bundle while it is
    /// local, a restored copy once it was submitted. The new archive is
    /// `BUILDING` when the old one was, otherwise `SEALED` and waiting for
    /// upload.
    pub fn rewrite_without(
        &self,
        node: &NodeId,
        archive: &ArchiveId,
        member: &MemberPath,
        source: &Path,
    ) -> Result<Rewrite> {
        let ws = self.catalog.node(node)?;
        let (_writer, mut index) = self.lock_for_write(&ws)?;
        let Some(old) = index.get(archive).cloned() else {
            return Err(Error::not_found(format!("{node}/{archive}")));
        };
        if !old.members.contains_key(member) {
            return Err(Error::not_found(format!("{node}/{member} in {archive}")));
        }
        if old.corrupt {
            return Err(Error::corrupt(archive, "flagged corrupt; not rewriting"));
        }
        let mut remaining = old.members.clone();
        remaining.remove(member);
        let moved = remaining.len();

        let replacement = if remaining.is_empty() {
            None
        } else {
            let id = ArchiveId::generate(self.clock.now());
            let path = ws.bundle_path(&id);
            bundle::create_bundle(&path)?;
            let (members, data_len) = match bundle::copy_members(source, archive, &path, &remaining)
            {
                Ok(copied) => copied,
                Err(e) => {
                    let _ = std::fs::remove_file(&path);
                    return Err(e);
                }
            };
            let mut manifest = ArchiveManifest::new(id.clone(), node.clone(), old.created_at);
            manifest.members = members;
            manifest.data_len = data_len;
            if old.state != ArchiveState::Building {
                seal_manifest(&path, &mut manifest, SealReason::Rewrite, self.clock.as_ref())?;
            }
            ws.commit(&mut index, manifest)?;
            Some(id)
        };

        let mut retired = old;
        retired.members.clear();
        if retired.state == ArchiveState::Building {
            retired.state = ArchiveState::Sealed;
            retired.seal_reason = Some(SealReason::Rewrite);
            retired.sealed_at = Some(self.clock.now());
        }
        ws.commit(&mut index, retired)?;
        info!(
            "Removed {} from {}/{}; {} members moved to {}",
            member,
            node,
            archive,
            moved,
            replacement.as_ref().map_or("nowhere", ArchiveId::as_str)
        );
        Ok(Rewrite {
            retired: archive.clone(),
            replacement,
            moved,
        })
    }
}

/// First free member name for `path`, or the existing reference when the
/// same content is already stored under one of its names
fn place(index: &NodeIndex, node: &NodeId, path: &MemberPath, checksum: &Checksum) -> Placement {
    let mut candidate = path.clone();
    let mut counter = 1;
    while let Some((archive, entry)) = index.member(&candidate) {
        if entry.checksum.same_content(checksum) {
            return Placement::Existing(ArchiveRef {
                node: node.clone(),
                archive: archive.id.clone(),
                member: candidate,
                size: entry.length,
                checksum: entry.checksum.clone(),
            });
        }
        counter += 1;
        candidate = path.with_counter(counter);
    }
    Placement::New(candidate)
}

/// Write the trailer and fill in the sealed fields of `manifest`
fn seal_manifest(
    path: &Path,
    manifest: &mut ArchiveManifest,
    reason: SealReason,
    clock: &dyn Clock,
) -> Result<()> {
    let (size, checksum) = bundle::write_trailer(path, manifest.data_len, &manifest.members)?;
    manifest.state = ArchiveState::Sealed;
    manifest.seal_reason = Some(reason);
    manifest.sealed_at = Some(clock.now());
    manifest.bundle_size = Some(size);
    manifest.bundle_checksum = Some(checksum);
    Ok(())
}

/// Write the trailer, then publish the `SEALED` manifest
fn seal_locked(
    ws: &NodeWorkspace,
    index: &mut NodeIndex,
    id: &ArchiveId,
    reason: SealReason,
    clock: &dyn Clock,
) -> Result<()> {
    let mut manifest = index
        .get(id)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("{}/{id}", ws.node())))?;
    seal_manifest(&ws.bundle_path(id), &mut manifest, reason, clock)?;
    let files = manifest.file_count();
    let size = manifest.bundle_size.unwrap_or_default();
    ws.commit(index, manifest)?;
    info!(
        "Sealed archive {}/{} ({}, {} files, {} bytes)",
        ws.node(),
        id,
        reason,
        files,
        size
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldpack_backend::DefaultNaming;
    use coldpack_common::ManualClock;
    use coldpack_lease::MemoryLeaseTable;
    use std::time::Duration;
    use tempfile::tempdir;

    const MIB: u64 = 1024 * 1024;

    fn builder(root: &std::path::Path, config: ArchiveConfig, clock: Arc<ManualClock>) -> ArchiveBuilder {
        builder_sharing(root, Arc::new(MemoryLeaseTable::new()), "w1", config, clock)
    }

    /// A builder as another process on the same host would create it
    fn builder_sharing(
        root: &std::path::Path,
        table: Arc<MemoryLeaseTable>,
        holder: &str,
        config: ArchiveConfig,
        clock: Arc<ManualClock>,
    ) -> ArchiveBuilder {
        let catalog = Arc::new(ArchiveCatalog::new(
            root,
            Arc::new(DefaultNaming::default()),
            clock.clone(),
        ));
        let leases = Arc::new(LeaseCoordinator::new(
            table,
            holder,
            Duration::from_secs(60),
            clock.clone(),
        ));
        ArchiveBuilder::new(catalog, leases, config, clock)
    }

    fn file(path: &str, data: &[u8]) -> SmallFile {
        SmallFile::new(MemberPath::new(path).unwrap(), data.len() as u64)
    }

    #[test]
    fn test_append_and_locate() {
        let dir = tempdir().unwrap();
        let b = builder(dir.path(), ArchiveConfig::default(), Arc::new(ManualClock::starting_now()));
        let node = NodeId::new("n1").unwrap();

        let a = b.append_file(&node, &file("a.dat", b"alpha"), b"alpha").unwrap();
        let r = b.append_file(&node, &file("sub/b.dat", b"beta"), b"beta").unwrap();
        assert_eq!(a.archive, r.archive);

        let ws = b.catalog().node(&node).unwrap();
        let loc = ws.locate(&r.member).unwrap();
        assert_eq!(loc.state, ArchiveState::Building);
        let bytes =
            bundle::read_member(&ws.bundle_path(&loc.archive), &loc.archive, &loc.member, &loc.entry)
                .unwrap();
        assert_eq!(bytes, b"beta");
    }

    #[test]
    fn test_duplicate_names() {
        let dir = tempdir().unwrap();
        let b = builder(dir.path(), ArchiveConfig::default(), Arc::new(ManualClock::starting_now()));
        let node = NodeId::new("n1").unwrap();

        let first = b.append_file(&node, &file("obs.dat", b"v1"), b"v1").unwrap();
        let same = b.append_file(&node, &file("obs.dat", b"v1"), b"v1").unwrap();
        assert_eq!(first, same);

        let second = b.append_file(&node, &file("obs.dat", b"v2"), b"v2").unwrap();
        assert_eq!(second.member.as_str(), "obs_2.dat");
        let third = b.append_file(&node, &file("obs.dat", b"v3"), b"v3").unwrap();
        assert_eq!(third.member.as_str(), "obs_3.dat");
        // Same content as an earlier renamed copy
        let again = b.append_file(&node, &file("obs.dat", b"v2"), b"v2").unwrap();
        assert_eq!(again, second);

        let ws = b.catalog().node(&node).unwrap();
        assert_eq!(ws.lock().member_count(), 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let config = ArchiveConfig {
            small_file_max_size: 16,
            ..ArchiveConfig::default()
        };
        let b = builder(dir.path(), config, Arc::new(ManualClock::starting_now()));
        let node = NodeId::new("n1").unwrap();

        let big = [0u8; 17];
        assert!(matches!(
            b.append_file(&node, &file("big", &big), &big),
            Err(Error::InvalidArgument(_))
        ));
        let lying = SmallFile::new(MemberPath::new("x").unwrap(), 3);
        assert!(matches!(
            b.append_file(&node, &lying, b"four"),
            Err(Error::InvalidArgument(_))
        ));
        let wrong = file("y", b"data").with_checksum(Checksum::of(b"other"));
        assert!(matches!(
            b.append_file(&node, &wrong, b"data"),
            Err(Error::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_capacity_rolls_over() {
        let dir = tempdir().unwrap();
        let config = ArchiveConfig {
            small_file_max_size: 8 * MIB,
            archive_max_size: 10 * MIB,
            archive_hard_ceiling: 10 * MIB,
            ..ArchiveConfig::default()
        };
        let b = builder(dir.path(), config, Arc::new(ManualClock::starting_now()));
        let node = NodeId::new("n1").unwrap();
        let six = vec![6u8; 6 * MIB as usize];

        let first = b.append_file(&node, &file("one", &six), &six).unwrap();
        let err = b.append_file(&node, &file("two", &six), &six).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { ref archive, .. } if *archive == first.archive));

        let ws = b.catalog().node(&node).unwrap();
        {
            let index = ws.lock();
            let sealed = index.get(&first.archive).unwrap();
            assert_eq!(sealed.state, ArchiveState::Sealed);
            assert_eq!(sealed.seal_reason, Some(SealReason::Capacity));
            assert!(index.current().is_none());
        }

        let second = b.append_file(&node, &file("two", &six), &six).unwrap();
        assert_ne!(second.archive, first.archive);
        for archive in ws.lock().archives() {
            assert!(archive.accumulated_size() <= 10 * MIB);
            assert_eq!(archive.file_count(), 1);
        }
    }

    #[test]
    fn test_seal_thresholds() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let config = ArchiveConfig {
            archive_max_files: 2,
            archive_max_age_hours: 1,
            ..ArchiveConfig::default()
        };
        let b = builder(dir.path(), config, clock.clone());
        let node = NodeId::new("n1").unwrap();

        // Empty archives are never sealed
        assert!(b.seal_due(&node).unwrap().is_empty());

        let a = b.append_file(&node, &file("a", b"a"), b"a").unwrap();
        assert!(b.seal_due(&node).unwrap().is_empty());
        b.append_file(&node, &file("b", b"b"), b"b").unwrap();
        assert_eq!(b.seal_due(&node).unwrap(), vec![(a.archive.clone(), SealReason::Count)]);
        // Idempotent
        assert!(b.seal_due(&node).unwrap().is_empty());

        let c = b.append_file(&node, &file("c", b"c"), b"c").unwrap();
        assert_ne!(c.archive, a.archive);
        clock.advance(Duration::from_secs(3599));
        assert!(b.seal_due(&node).unwrap().is_empty());
        clock.advance(Duration::from_secs(1));
        assert_eq!(b.seal_due(&node).unwrap(), vec![(c.archive, SealReason::Age)]);
    }

    #[test]
    fn test_sealed_state_survives_reload() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let node = NodeId::new("n1").unwrap();
        let r = {
            let b = builder(dir.path(), ArchiveConfig::default(), clock.clone());
            let r = b.append_file(&node, &file("keep", b"keep"), b"keep").unwrap();
            assert_eq!(b.seal_current(&node, SealReason::Shutdown).unwrap(), Some(r.archive.clone()));
            r
        };

        let b = builder(dir.path(), ArchiveConfig::default(), clock);
        let ws = b.catalog().node(&node).unwrap();
        let loc = ws.locate(&r.member).unwrap();
        assert_eq!(loc.state, ArchiveState::Sealed);
        assert!(loc.bundle_checksum.unwrap().sha256.is_some());
        assert_eq!(
            bundle::read_trailer(&ws.bundle_path(&r.archive), &r.archive).unwrap().len(),
            1
        );
        // Appends go to a new archive
        let next = b.append_file(&node, &file("next", b"next"), b"next").unwrap();
        assert_ne!(next.archive, r.archive);
    }

    #[test]
    fn test_writers_in_two_processes_share_a_workspace() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(MemoryLeaseTable::new());
        let node = NodeId::new("n1").unwrap();
        let cli = builder_sharing(dir.path(), table.clone(), "cli", ArchiveConfig::default(), clock.clone());
        let daemon = builder_sharing(dir.path(), table, "daemon", ArchiveConfig::default(), clock);

        let one = cli.append_file(&node, &file("one", b"one"), b"one").unwrap();
        // The daemon loads the workspace, then the other process appends again
        daemon.catalog().node(&node).unwrap();
        let two = cli.append_file(&node, &file("two", b"two"), b"two").unwrap();
        assert_eq!(one.archive, two.archive);

        let sealed = daemon.seal_current(&node, SealReason::Shutdown).unwrap();
        assert_eq!(sealed, Some(one.archive.clone()));
        let ws = daemon.catalog().node(&node).unwrap();
        let trailer = bundle::read_trailer(&ws.bundle_path(&one.archive), &one.archive).unwrap();
        assert_eq!(trailer.len(), 2);
        let loc = ws.locate(&two.member).unwrap();
        let bytes =
            bundle::read_member(&ws.bundle_path(&loc.archive), &loc.archive, &loc.member, &loc.entry)
                .unwrap();
        assert_eq!(bytes, b"two");

        // The next append from the other process opens a fresh archive
        let three = cli.append_file(&node, &file("three", b"3"), b"3").unwrap();
        assert_ne!(three.archive, one.archive);
    }

    #[test]
    fn test_busy_build_lease_is_reported() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let table = Arc::new(MemoryLeaseTable::new());
        let node = NodeId::new("n1").unwrap();
        let b = builder_sharing(dir.path(), table.clone(), "w1", ArchiveConfig::default(), clock.clone());
        let other = LeaseCoordinator::new(table, "w2", Duration::from_secs(60), clock);
        let held = other.acquire(&build_lease_name(&node)).unwrap().into_handle().unwrap();

        let err = b.append_file(&node, &file("a", b"a"), b"a").unwrap_err();
        assert!(matches!(err, Error::LeaseBusy(_)));
        assert!(err.is_temporarily_unavailable());
        assert!(matches!(b.seal_due(&node), Err(Error::LeaseBusy(_))));

        other.release(held).unwrap();
        b.append_file(&node, &file("a", b"a"), b"a").unwrap();
    }

    #[test]
    fn test_rewrite_without_member() {
        let dir = tempdir().unwrap();
        let b = builder(dir.path(), ArchiveConfig::default(), Arc::new(ManualClock::starting_now()));
        let node = NodeId::new("n1").unwrap();
        let a = b.append_file(&node, &file("a", b"alpha"), b"alpha").unwrap();
        let gone = b.append_file(&node, &file("b", b"secret"), b"secret").unwrap();
        b.append_file(&node, &file("c", b"gamma"), b"gamma").unwrap();

        let ws = b.catalog().node(&node).unwrap();
        let source = ws.bundle_path(&a.archive);
        let rewrite = b.rewrite_without(&node, &a.archive, &gone.member, &source).unwrap();
        assert_eq!(rewrite.retired, a.archive);
        assert_eq!(rewrite.moved, 2);
        let replacement = rewrite.replacement.unwrap();

        {
            let index = ws.lock();
            assert!(index.get(&a.archive).unwrap().is_retired());
            let current = index.current().unwrap();
            assert_eq!(current.id, replacement);
            assert_eq!(current.state, ArchiveState::Building);
            assert!(index.member(&gone.member).is_none());
        }
        let loc = ws.locate(&MemberPath::new("c").unwrap()).unwrap();
        assert_eq!(loc.archive, replacement);
        let bytes = bundle::read_member(&ws.bundle_path(&replacement), &loc.archive, &loc.member, &loc.entry)
            .unwrap();
        assert_eq!(bytes, b"gamma");
        let raw = std::fs::read(ws.bundle_path(&replacement)).unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));

        // Appends keep going to the replacement
        let d = b.append_file(&node, &file("d", b"d"), b"d").unwrap();
        assert_eq!(d.archive, replacement);
    }
}
