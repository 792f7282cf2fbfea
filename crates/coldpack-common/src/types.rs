//! Core type definitions for coldpack
//!
//! Identifiers for storage nodes and archives, the archive lifecycle
//! states, and the small-file descriptor that flows through the write path.

use crate::checksum::Checksum;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Storage node (location root) that owns a workspace and a cache directory
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id. Node ids become directory names, so only
    /// `[A-Za-z0-9._-]` is accepted and `.`/`..` are refused.
    pub fn new(name: impl Into<String>) -> Result<Self, NodeIdError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    #[must_use]
    pub fn new_unchecked(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), NodeIdError> {
        if name.is_empty() {
            return Err(NodeIdError::Empty);
        }
        if name.len() > 128 {
            return Err(NodeIdError::TooLong);
        }
        if name == "." || name == ".." {
            return Err(NodeIdError::Reserved);
        }
        if let Some(c) = name
            .chars()
            .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '-'))
        {
            return Err(NodeIdError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl std::str::FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Node id validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeIdError {
    #[error("node id must not be empty")]
    Empty,
    #[error("node id must be at most 128 characters")]
    TooLong,
    #[error("node id must not be '.' or '..'")]
    Reserved,
    #[error("invalid character in node id: '{0}'")]
    InvalidChar(char),
}

/// Archive identifier: creation timestamp plus a random suffix,
/// e.g. `20240611093012345-1f3a9c0e`. Sorts by creation time.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ArchiveId(String);

impl ArchiveId {
    /// Generate an id for an archive created at `created_at`
    #[must_use]
    pub fn generate(created_at: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!(
            "{}-{}",
            created_at.format("%Y%m%d%H%M%S%3f"),
            &suffix[..8]
        ))
    }

    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveId({})", self.0)
    }
}

/// Archive lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveState {
    /// Accepting new members
    #[display("BUILDING")]
    Building,
    /// Closed, queued for upload
    #[display("SEALED")]
    Sealed,
    /// Uploaded; the remote key is authoritative
    #[display("SUBMITTED")]
    Submitted,
    /// Last upload attempt failed; retried on the next scan
    #[display("FAILED")]
    Failed,
}

impl ArchiveState {
    /// Bundle bytes are still in the local workspace
    #[must_use]
    pub const fn is_local(self) -> bool {
        !matches!(self, Self::Submitted)
    }

    /// Waiting for the submitter
    #[must_use]
    pub const fn is_pending_upload(self) -> bool {
        matches!(self, Self::Sealed | Self::Failed)
    }
}

/// Why an archive left `BUILDING`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum SealReason {
    /// Older than the configured maximum age
    Age,
    /// Accumulated size reached the seal threshold
    Size,
    /// Member count reached the seal threshold
    Count,
    /// An append would have crossed the hard ceiling
    Capacity,
    /// Sealed while the worker was shutting down
    Shutdown,
    /// Rebuilt from another archive after a member was deleted
    Rewrite,
}

/// Relative path of a small file inside its node, e.g. `2024/06/obs-001.dat`
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct MemberPath(String);

impl MemberPath {
    /// Validate a relative, normalized path. Backslashes are converted to `/`.
    pub fn new(path: impl Into<String>) -> Result<Self, crate::Error> {
        let path = path.into().replace('\\', "/");
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(crate::Error::invalid_argument("empty member path"));
        }
        if path.starts_with('/') {
            return Err(crate::Error::invalid_argument(format!(
                "member path must be relative: {path}"
            )));
        }
        if trimmed
            .split('/')
            .any(|part| part.is_empty() || part == "." || part == "..")
        {
            return Err(crate::Error::invalid_argument(format!(
                "member path must be normalized: {path}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path component
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Same path with `_<n>` inserted before the extension of the file name:
    /// `dir/obs.dat` -> `dir/obs_2.dat`.
    #[must_use]
    pub fn with_counter(&self, n: u32) -> Self {
        let (dir, name) = match self.0.rsplit_once('/') {
            Some((dir, name)) => (Some(dir), name),
            None => (None, self.0.as_str()),
        };
        let renamed = match name.rfind('.') {
            Some(idx) if idx > 0 => format!("{}_{n}{}", &name[..idx], &name[idx..]),
            _ => format!("{name}_{n}"),
        };
        match dir {
            Some(dir) => Self(format!("{dir}/{renamed}")),
            None => Self(renamed),
        }
    }
}

impl fmt::Debug for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberPath({})", self.0)
    }
}

/// A small file handed to the write path
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmallFile {
    /// Relative path within the node
    pub path: MemberPath,
    /// Size in bytes
    pub size: u64,
    /// Expected checksum, if the caller knows it
    pub checksum: Option<Checksum>,
}

impl SmallFile {
    #[must_use]
    pub const fn new(path: MemberPath, size: u64) -> Self {
        Self {
            path,
            size,
            checksum: None,
        }
    }

    #[must_use]
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }
}

/// Where a stored small file lives
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub node: NodeId,
    pub archive: ArchiveId,
    /// Member name inside the archive (may differ from the requested path
    /// when a same-named file with different content already existed)
    pub member: MemberPath,
    pub size: u64,
    pub checksum: Checksum,
}

impl fmt::Display for ArchiveRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}?member={}", self.node, self.archive, self.member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_node_id_validation() {
        assert!(NodeId::new("node-01.eu_west").is_ok());
        assert_eq!(NodeId::new(""), Err(NodeIdError::Empty));
        assert_eq!(NodeId::new(".."), Err(NodeIdError::Reserved));
        assert_eq!(NodeId::new("a/b"), Err(NodeIdError::InvalidChar('/')));
        assert_eq!(NodeId::new("x".repeat(129)), Err(NodeIdError::TooLong));
    }

    #[test]
    fn test_archive_id_sorts_by_creation() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let a = ArchiveId::generate(early);
        let b = ArchiveId::generate(late);
        assert!(a < b);
        assert!(a.as_str().starts_with("20240101000000000-"));
        assert_eq!(a.as_str().len(), "20240101000000000-".len() + 8);
    }

    #[test]
    fn test_member_path_normalization() {
        assert_eq!(MemberPath::new("a/b/c.txt").unwrap().as_str(), "a/b/c.txt");
        assert_eq!(MemberPath::new("a\\b.txt").unwrap().as_str(), "a/b.txt");
        assert_eq!(MemberPath::new("dir/").unwrap().as_str(), "dir");
        assert!(MemberPath::new("/etc/passwd").is_err());
        assert!(MemberPath::new("a/../b").is_err());
        assert!(MemberPath::new("a//b").is_err());
        assert!(MemberPath::new("").is_err());
    }

    #[test]
    fn test_member_path_counter() {
        let p = MemberPath::new("dir/obs.dat").unwrap();
        assert_eq!(p.with_counter(2).as_str(), "dir/obs_2.dat");
        assert_eq!(p.file_name(), "obs.dat");

        let no_ext = MemberPath::new("README").unwrap();
        assert_eq!(no_ext.with_counter(3).as_str(), "README_3");

        let dotfile = MemberPath::new(".hidden").unwrap();
        assert_eq!(dotfile.with_counter(2).as_str(), ".hidden_2");
    }

    #[test]
    fn test_state_helpers() {
        assert!(ArchiveState::Building.is_local());
        assert!(!ArchiveState::Submitted.is_local());
        assert!(ArchiveState::Failed.is_pending_upload());
        assert!(!ArchiveState::Building.is_pending_upload());
        assert_eq!(ArchiveState::Sealed.to_string(), "SEALED");
    }
}
