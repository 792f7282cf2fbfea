//! Bundle file format and sidecar manifest.
//!
//! A bundle is an 8-byte header followed by member bytes back to back.
//! Sealing appends a trailer: the JSON member index, its length as a
//! little-endian u64, and an 8-byte magic. A restored bundle can therefore
//! be read without the local manifest.
//!
//! The sidecar `<id>.index.json` is the authoritative index while the
//! archive lives in the workspace. Member bytes are fsynced before the
//! sidecar is replaced, so the sidecar never references bytes that are not
//! on disk. Trailing bytes the sidecar does not reference are garbage from
//! an interrupted append and are truncated on load.

use chrono::{DateTime, Utc};
use coldpack_common::{
    ArchiveId, ArchiveState, Checksum, ChecksumCalculator, Error, MemberPath, NodeId, Result,
    SealReason,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const BUNDLE_MAGIC: &[u8; 8] = b"CPKBNDL1";
pub const TRAILER_MAGIC: &[u8; 8] = b"CPKIDX01";
pub const HEADER_LEN: u64 = BUNDLE_MAGIC.len() as u64;
const FOOTER_LEN: u64 = 16;

pub const MANIFEST_VERSION: u32 = 1;
pub const INDEX_SUFFIX: &str = ".index.json";
pub const PART_SUFFIX: &str = ".part";

/// Location of one member inside a bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub offset: u64,
    pub length: u64,
    pub checksum: Checksum,
    pub added_at: DateTime<Utc>,
}

/// Sidecar manifest of one archive
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub id: ArchiveId,
    pub node: NodeId,
    pub state: ArchiveState,
    pub created_at: DateTime<Utc>,
    /// Committed bundle length before any trailer (header + members)
    pub data_len: u64,
    pub members: BTreeMap<MemberPath, MemberEntry>,
    #[serde(default)]
    pub seal_reason: Option<SealReason>,
    #[serde(default)]
    pub sealed_at: Option<DateTime<Utc>>,
    /// Bundle size including the trailer, set at seal time
    #[serde(default)]
    pub bundle_size: Option<u64>,
    #[serde(default)]
    pub bundle_checksum: Option<Checksum>,
    #[serde(default)]
    pub remote_key: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub upload_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set when the bytes disagree with the index; needs an operator
    #[serde(default)]
    pub corrupt: bool,
}

impl ArchiveManifest {
    #[must_use]
    pub fn new(id: ArchiveId, node: NodeId, created_at: DateTime<Utc>) -> Self {
        Self {
            format_version: MANIFEST_VERSION,
            id,
            node,
            state: ArchiveState::Building,
            created_at,
            data_len: HEADER_LEN,
            members: BTreeMap::new(),
            seal_reason: None,
            sealed_at: None,
            bundle_size: None,
            bundle_checksum: None,
            remote_key: None,
            submitted_at: None,
            upload_attempts: 0,
            last_error: None,
            corrupt: false,
        }
    }

    /// Sum of member sizes
    #[must_use]
    pub fn accumulated_size(&self) -> u64 {
        self.members.values().map(|m| m.length).sum()
    }

    #[must_use]
    pub fn file_count(&self) -> u64 {
        self.members.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Emptied after its members moved to another archive; waiting to be
    /// discarded locally and remotely. Archives are never sealed empty.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.state != ArchiveState::Building && self.members.is_empty()
    }
}

#[must_use]
pub fn bundle_path(dir: &Path, id: &ArchiveId) -> PathBuf {
    dir.join(format!("{id}.{}", coldpack_backend::naming::BUNDLE_EXTENSION))
}

#[must_use]
pub fn index_path(dir: &Path, id: &ArchiveId) -> PathBuf {
    dir.join(format!("{id}{INDEX_SUFFIX}"))
}

/// `<path>.part`, where downloads land before being renamed into place
#[must_use]
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(PART_SUFFIX);
    path.with_file_name(name)
}

/// Create an empty bundle (header only)
pub fn create_bundle(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(BUNDLE_MAGIC)?;
    file.sync_all()?;
    Ok(())
}

/// Append `data` at `committed_len`, dropping any uncommitted tail first.
/// Returns the member's offset once the bytes are durable.
pub fn append_member(path: &Path, committed_len: u64, data: &[u8]) -> Result<u64> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    if file.metadata()?.len() != committed_len {
        file.set_len(committed_len)?;
    }
    file.seek(SeekFrom::Start(committed_len))?;
    file.write_all(data)?;
    file.sync_data()?;
    Ok(committed_len)
}

/// Read one member and verify it against its checksum
pub fn read_member(
    path: &Path,
    archive: &ArchiveId,
    member: &MemberPath,
    entry: &MemberEntry,
) -> Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    if entry.offset < HEADER_LEN || entry.offset.saturating_add(entry.length) > file_len {
        return Err(Error::corrupt(
            archive,
            format!(
                "member {member} at {}+{} lies outside the {file_len}-byte bundle",
                entry.offset, entry.length
            ),
        ));
    }
    let len = usize::try_from(entry.length)
        .map_err(|_| Error::corrupt(archive, format!("member {member} too large")))?;
    let mut data = vec![0u8; len];
    file.seek(SeekFrom::Start(entry.offset))?;
    file.read_exact(&mut data)?;
    if !entry.checksum.verify(&data) {
        return Err(Error::corrupt(
            archive,
            format!(
                "member {member} checksum mismatch: expected {}, got {}",
                entry.checksum,
                Checksum::of(&data)
            ),
        ));
    }
    Ok(data)
}

/// Check the header magic
pub fn verify_header(path: &Path, archive: &ArchiveId) -> Result<()> {
    let mut header = [0u8; 8];
    File::open(path)?.read_exact(&mut header).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::corrupt(archive, "bundle shorter than its header")
        } else {
            Error::Io(e)
        }
    })?;
    if &header != BUNDLE_MAGIC {
        return Err(Error::corrupt(archive, "bad bundle magic"));
    }
    Ok(())
}

/// Append the trailer after `committed_len`; returns the final size and
/// the checksum (with SHA-256) of the whole bundle.
pub fn write_trailer(
    path: &Path,
    committed_len: u64,
    members: &BTreeMap<MemberPath, MemberEntry>,
) -> Result<(u64, Checksum)> {
    let index = serde_json::to_vec(members)?;
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.set_len(committed_len)?;
    file.seek(SeekFrom::Start(committed_len))?;
    file.write_all(&index)?;
    file.write_all(&(index.len() as u64).to_le_bytes())?;
    file.write_all(TRAILER_MAGIC)?;
    file.sync_all()?;

    file.seek(SeekFrom::Start(0))?;
    let mut calc = ChecksumCalculator::with_sha256();
    let size = calc.update_from_reader(&mut file)?;
    Ok((size, calc.finalize()))
}

/// Read the member index from a sealed bundle's trailer
pub fn read_trailer(path: &Path, archive: &ArchiveId) -> Result<BTreeMap<MemberPath, MemberEntry>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < HEADER_LEN + FOOTER_LEN {
        return Err(Error::corrupt(archive, "bundle has no trailer"));
    }
    let mut footer = [0u8; 16];
    file.seek(SeekFrom::Start(len - FOOTER_LEN))?;
    file.read_exact(&mut footer)?;
    if &footer[8..] != TRAILER_MAGIC {
        return Err(Error::corrupt(archive, "bundle has no trailer"));
    }
    let mut index_len = [0u8; 8];
    index_len.copy_from_slice(&footer[..8]);
    let index_len = u64::from_le_bytes(index_len);
    let index_start = (len - FOOTER_LEN)
        .checked_sub(index_len)
        .filter(|start| *start >= HEADER_LEN)
        .ok_or_else(|| Error::corrupt(archive, "trailer length out of range"))?;
    let mut index = vec![0u8; usize::try_from(index_len).unwrap_or(0)];
    file.seek(SeekFrom::Start(index_start))?;
    file.read_exact(&mut index)?;
    serde_json::from_slice(&index)
        .map_err(|e| Error::corrupt(archive, format!("unreadable trailer: {e}")))
}

/// Copy `members` out of the bundle at `source` into the fresh bundle at
/// `dest`, verifying each one on the way. Returns the new entries and the
/// committed length of `dest`.
pub fn copy_members(
    source: &Path,
    archive: &ArchiveId,
    dest: &Path,
    members: &BTreeMap<MemberPath, MemberEntry>,
) -> Result<(BTreeMap<MemberPath, MemberEntry>, u64)> {
    let mut copied = BTreeMap::new();
    let mut len = HEADER_LEN;
    for (path, entry) in members {
        let data = read_member(source, archive, path, entry)?;
        let offset = append_member(dest, len, &data)?;
        len = offset + entry.length;
        copied.insert(
            path.clone(),
            MemberEntry {
                offset,
                ..entry.clone()
            },
        );
    }
    Ok((copied, len))
}

/// Checksum (with SHA-256) of a whole file
pub fn checksum_file(path: &Path) -> Result<(u64, Checksum)> {
    let mut calc = ChecksumCalculator::with_sha256();
    let size = calc.update_from_reader(File::open(path)?)?;
    Ok((size, calc.finalize()))
}

/// Replace the sidecar atomically (temp file, fsync, rename)
pub fn write_manifest(path: &Path, manifest: &ArchiveManifest) -> Result<()> {
    let json = serde_json::to_vec_pretty(manifest)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_manifest(path: &Path) -> Result<ArchiveManifest> {
    let raw = fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}
