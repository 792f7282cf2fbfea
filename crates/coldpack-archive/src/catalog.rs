//! Per-node archive index.
//!
//! Each node's manifests are loaded from its workspace directory and kept
//! in memory behind a per-node mutex. The manifests on disk stay the source
//! of truth: other processes append, seal and submit in the same workspace,
//! so writers re-read them with [`NodeWorkspace::sync`] before changing
//! anything.

use crate::bundle::{
    self, ArchiveManifest, HEADER_LEN, INDEX_SUFFIX, MemberEntry, bundle_path, index_path,
};
use coldpack_backend::NamingStrategy;
use coldpack_common::{ArchiveId, ArchiveState, Checksum, Clock, Error, MemberPath, NodeId, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Where a member lives, copied out of the index
#[derive(Clone, Debug)]
pub struct ArchiveLocation {
    pub node: NodeId,
    pub archive: ArchiveId,
    pub state: ArchiveState,
    pub member: MemberPath,
    pub entry: MemberEntry,
    pub remote_key: Option<String>,
    pub bundle_size: Option<u64>,
    pub bundle_checksum: Option<Checksum>,
    pub corrupt: bool,
}

/// In-memory view of one node's manifests
#[derive(Debug, Default)]
pub struct NodeIndex {
    archives: BTreeMap<ArchiveId, ArchiveManifest>,
    members: HashMap<MemberPath, ArchiveId>,
    current: Option<ArchiveId>,
}

impl NodeIndex {
    pub fn archives(&self) -> impl Iterator<Item = &ArchiveManifest> {
        self.archives.values()
    }

    #[must_use]
    pub fn get(&self, id: &ArchiveId) -> Option<&ArchiveManifest> {
        self.archives.get(id)
    }

    /// The archive accepting appends, if any
    #[must_use]
    pub fn current(&self) -> Option<&ArchiveManifest> {
        self.current.as_ref().and_then(|id| self.archives.get(id))
    }

    pub(crate) fn current_mut(&mut self) -> Option<&mut ArchiveManifest> {
        self.current.as_ref().and_then(|id| self.archives.get_mut(id))
    }

    pub(crate) fn record_member(&mut self, path: MemberPath, archive: ArchiveId) {
        self.members.insert(path, archive);
    }

    #[must_use]
    pub fn member(&self, path: &MemberPath) -> Option<(&ArchiveManifest, &MemberEntry)> {
        let archive = self.archives.get(self.members.get(path)?)?;
        Some((archive, archive.members.get(path)?))
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Add or replace a manifest, keeping the member map and the current
    /// pointer in step with it
    pub(crate) fn upsert(&mut self, manifest: ArchiveManifest) {
        self.members
            .retain(|path, archive| *archive != manifest.id || manifest.members.contains_key(path));
        for path in manifest.members.keys() {
            self.members.insert(path.clone(), manifest.id.clone());
        }
        if manifest.state == ArchiveState::Building && !manifest.corrupt {
            self.current = Some(manifest.id.clone());
        } else if self.current.as_ref() == Some(&manifest.id) {
            self.current = None;
        }
        self.archives.insert(manifest.id.clone(), manifest);
    }

    pub(crate) fn remove(&mut self, id: &ArchiveId) -> Option<ArchiveManifest> {
        let manifest = self.archives.remove(id)?;
        self.members.retain(|_, archive| archive != id);
        if self.current.as_ref() == Some(id) {
            self.current = None;
        }
        Some(manifest)
    }

    /// Rebuild the member map and the current pointer from the manifests.
    /// Newer archives win a member name; the newest building archive
    /// accepts appends.
    fn reindex(&mut self) {
        self.members.clear();
        self.current = None;
        for manifest in self.archives.values() {
            for path in manifest.members.keys() {
                self.members.insert(path.clone(), manifest.id.clone());
            }
            if manifest.state == ArchiveState::Building && !manifest.corrupt {
                self.current = Some(manifest.id.clone());
            }
        }
    }
}

/// One node's workspace directory and index
#[derive(Debug)]
pub struct NodeWorkspace {
    node: NodeId,
    dir: PathBuf,
    index: Mutex<NodeIndex>,
}

impl NodeWorkspace {
    #[must_use]
    pub const fn node(&self) -> &NodeId {
        &self.node
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the per-node mutex
    pub fn lock(&self) -> MutexGuard<'_, NodeIndex> {
        self.index.lock()
    }

    #[must_use]
    pub fn bundle_path(&self, id: &ArchiveId) -> PathBuf {
        bundle_path(&self.dir, id)
    }

    #[must_use]
    pub fn index_path(&self, id: &ArchiveId) -> PathBuf {
        index_path(&self.dir, id)
    }

    /// Write `manifest` to disk, then publish it in `index`
    pub fn commit(&self, index: &mut NodeIndex, manifest: ArchiveManifest) -> Result<()> {
        bundle::write_manifest(&self.index_path(&manifest.id), &manifest)?;
        index.upsert(manifest);
        Ok(())
    }

    /// Re-read one manifest from disk (another process may have changed it)
    pub fn refresh(&self, index: &mut NodeIndex, id: &ArchiveId) -> Result<ArchiveManifest> {
        let manifest = bundle::read_manifest(&self.index_path(id))?;
        index.upsert(manifest.clone());
        Ok(manifest)
    }

    /// Flag an archive as corrupt so it is never silently dropped
    pub fn mark_corrupt(&self, id: &ArchiveId, reason: &str) -> Result<()> {
        let mut index = self.lock();
        let on_disk = bundle::read_manifest(&self.index_path(id)).ok();
        let Some(mut manifest) = on_disk.or_else(|| index.get(id).cloned()) else {
            return Err(Error::not_found(format!("{}/{id}", self.node)));
        };
        if manifest.corrupt {
            return Ok(());
        }
        error!("Archive {}/{} is corrupt: {}", self.node, id, reason);
        manifest.corrupt = true;
        manifest.last_error = Some(reason.to_string());
        self.commit(&mut index, manifest)
    }

    /// Re-read every manifest in the workspace directory, picking up
    /// archives other processes created, sealed, submitted or discarded
    pub fn sync(&self, index: &mut NodeIndex) -> Result<()> {
        let mut fresh = NodeIndex::default();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(INDEX_SUFFIX))
            else {
                continue;
            };
            let id = ArchiveId::new_unchecked(id);
            match bundle::read_manifest(&path) {
                Ok(manifest) if manifest.id == id && manifest.node == self.node => {
                    fresh.archives.insert(id, manifest);
                }
                Ok(_) => {}
                // Discarded while we were listing
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!("Unreadable manifest {}: {}", path.display(), e);
                    if let Some(known) = index.archives.remove(&id) {
                        fresh.archives.insert(id, known);
                    }
                }
            }
        }
        fresh.reindex();
        *index = fresh;
        Ok(())
    }

    /// Drop an archive's manifest and local bundle
    pub fn forget(&self, index: &mut NodeIndex, id: &ArchiveId) -> Result<()> {
        for path in [self.bundle_path(id), self.index_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        index.remove(id);
        Ok(())
    }

    /// Copy out the location of `path`
    pub fn locate(&self, path: &MemberPath) -> Option<ArchiveLocation> {
        let index = self.lock();
        let (manifest, entry) = index.member(path)?;
        Some(ArchiveLocation {
            node: self.node.clone(),
            archive: manifest.id.clone(),
            state: manifest.state,
            member: path.clone(),
            entry: entry.clone(),
            remote_key: manifest.remote_key.clone(),
            bundle_size: manifest.bundle_size,
            bundle_checksum: manifest.bundle_checksum.clone(),
            corrupt: manifest.corrupt,
        })
    }

    fn load(node: NodeId, dir: PathBuf, clock: &dyn Clock) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut index = NodeIndex::default();
        let mut indexed = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".json.tmp") {
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(id) = name.strip_suffix(INDEX_SUFFIX) else {
                continue;
            };
            let id = ArchiveId::new_unchecked(id);
            match bundle::read_manifest(&path) {
                Ok(manifest) if manifest.id == id && manifest.node == node => {
                    let manifest = recover(&dir, manifest)?;
                    indexed.push(manifest.id.clone());
                    index.upsert(manifest);
                }
                Ok(_) => warn!("Ignoring manifest {} that belongs elsewhere", path.display()),
                Err(e) => error!("Unreadable manifest {}: {}", path.display(), e),
            }
        }

        // Bundles whose sidecar was lost
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".cpk"))
            else {
                continue;
            };
            let id = ArchiveId::new_unchecked(id);
            if indexed.contains(&id) {
                continue;
            }
            if let Some(manifest) = adopt_orphan(&dir, &node, &id, &path, clock)? {
                index.upsert(manifest);
            }
        }

        // Only one archive accepts appends; keep the newest
        index.reindex();
        let building: Vec<ArchiveId> = index
            .archives()
            .filter(|m| m.state == ArchiveState::Building && !m.corrupt)
            .map(|m| m.id.clone())
            .collect();
        if building.len() > 1 {
            warn!(
                "Node {} has {} building archives; appending to {}",
                node,
                building.len(),
                building.last().map_or("", ArchiveId::as_str)
            );
        }

        info!(
            "Loaded node {}: {} archives, {} members",
            node,
            index.archives.len(),
            index.members.len()
        );
        Ok(Self {
            node,
            dir,
            index: Mutex::new(index),
        })
    }
}

/// Bring a bundle back in line with its manifest
fn recover(dir: &Path, mut manifest: ArchiveManifest) -> Result<ArchiveManifest> {
    if manifest.is_retired() {
        // Discarded by the next submission scan
        return Ok(manifest);
    }
    let path = bundle_path(dir, &manifest.id);
    let on_disk = match fs::metadata(&path) {
        Ok(meta) => Some(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let problem = match (manifest.state, on_disk) {
        (ArchiveState::Submitted, Some(_)) => {
            // Uploaded; the local copy was not cleaned up before a crash
            fs::remove_file(&path)?;
            None
        }
        (ArchiveState::Submitted, None) => None,
        (ArchiveState::Building, None) if manifest.is_empty() => {
            bundle::create_bundle(&path)?;
            None
        }
        (_, None) => Some("bundle file is missing".to_string()),
        (ArchiveState::Building, Some(len)) if len > manifest.data_len => {
            warn!(
                "Truncating {} unindexed bytes from {}",
                len - manifest.data_len,
                path.display()
            );
            fs::OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(manifest.data_len)?;
            None
        }
        (ArchiveState::Building, Some(len)) if len < manifest.data_len => Some(format!(
            "bundle is {len} bytes but the index covers {}",
            manifest.data_len
        )),
        (ArchiveState::Building, Some(_)) => None,
        (_, Some(len)) if Some(len) != manifest.bundle_size => Some(format!(
            "sealed bundle is {len} bytes, expected {}",
            manifest.bundle_size.unwrap_or_default()
        )),
        (_, Some(_)) => None,
    };
    let problem = problem.or_else(|| {
        (manifest.state.is_local() && on_disk.is_some())
            .then(|| bundle::verify_header(&path, &manifest.id).err())
            .flatten()
            .map(|e| e.to_string())
    });

    if let Some(reason) = problem
        && !manifest.corrupt
    {
        error!("Archive {}/{} is corrupt: {}", manifest.node, manifest.id, reason);
        manifest.corrupt = true;
        manifest.last_error = Some(reason);
        bundle::write_manifest(&index_path(dir, &manifest.id), &manifest)?;
    }
    Ok(manifest)
}

/// Rebuild the manifest of a sealed bundle from its trailer
fn adopt_orphan(
    dir: &Path,
    node: &NodeId,
    id: &ArchiveId,
    path: &Path,
    clock: &dyn Clock,
) -> Result<Option<ArchiveManifest>> {
    let len = fs::metadata(path)?.len();
    if len <= HEADER_LEN {
        // Created but never indexed
        fs::remove_file(path)?;
        return Ok(None);
    }
    match bundle::read_trailer(path, id) {
        Ok(members) => {
            let (size, checksum) = bundle::checksum_file(path)?;
            let now = clock.now();
            let mut manifest = ArchiveManifest::new(id.clone(), node.clone(), now);
            manifest.data_len = members
                .values()
                .map(|m| m.offset + m.length)
                .max()
                .unwrap_or(HEADER_LEN);
            manifest.members = members;
            manifest.state = ArchiveState::Sealed;
            manifest.sealed_at = Some(now);
            manifest.bundle_size = Some(size);
            manifest.bundle_checksum = Some(checksum);
            bundle::write_manifest(&index_path(dir, id), &manifest)?;
            warn!(
                "Rebuilt lost manifest of {}/{} from its trailer ({} members)",
                node,
                id,
                manifest.members.len()
            );
            Ok(Some(manifest))
        }
        Err(e) => {
            error!("Bundle {} has no manifest and cannot be adopted: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Node workspaces under one root
pub struct ArchiveCatalog {
    workspace_root: PathBuf,
    naming: Arc<dyn NamingStrategy>,
    clock: Arc<dyn Clock>,
    nodes: RwLock<HashMap<NodeId, Arc<NodeWorkspace>>>,
}

impl ArchiveCatalog {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        naming: Arc<dyn NamingStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            naming,
            clock,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn naming(&self) -> &Arc<dyn NamingStrategy> {
        &self.naming
    }

    /// (Re)load a node's manifests from disk, recovering interrupted writes
    pub fn load_node(&self, node: &NodeId) -> Result<Arc<NodeWorkspace>> {
        let dir = self.naming.workspace_dir(&self.workspace_root, node);
        let workspace = Arc::new(NodeWorkspace::load(node.clone(), dir, self.clock.as_ref())?);
        self.nodes.write().insert(node.clone(), workspace.clone());
        Ok(workspace)
    }

    /// The node's workspace, loading it on first use
    pub fn node(&self, node: &NodeId) -> Result<Arc<NodeWorkspace>> {
        if let Some(ws) = self.nodes.read().get(node) {
            return Ok(ws.clone());
        }
        let mut nodes = self.nodes.write();
        if let Some(ws) = nodes.get(node) {
            return Ok(ws.clone());
        }
        let dir = self.naming.workspace_dir(&self.workspace_root, node);
        let workspace = Arc::new(NodeWorkspace::load(node.clone(), dir, self.clock.as_ref())?);
        nodes.insert(node.clone(), workspace.clone());
        Ok(workspace)
    }

    #[must_use]
    pub fn loaded_nodes(&self) -> Vec<NodeId> {
        let mut nodes: Vec<_> = self.nodes.read().keys().cloned().collect();
        nodes.sort();
        nodes
    }
}
