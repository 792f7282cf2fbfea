//! Where archives live, locally and remotely.

use coldpack_common::{ArchiveId, NodeId};
use std::path::{Path, PathBuf};

/// File extension of bundle files
pub const BUNDLE_EXTENSION: &str = "cpk";

/// Pure mapping from identities to keys and directories
pub trait NamingStrategy: Send + Sync {
    /// Remote object key of an archive
    fn remote_key(&self, node: &NodeId, archive: &ArchiveId) -> String;

    /// Directory holding a node's building and pending archives
    fn workspace_dir(&self, workspace_root: &Path, node: &NodeId) -> PathBuf;

    /// Directory holding a node's restored archives
    fn cache_dir(&self, cache_root: &Path, node: &NodeId) -> PathBuf;

    /// Restored bundle of `archive` inside the node's cache directory
    fn cache_path(&self, cache_root: &Path, node: &NodeId, archive: &ArchiveId) -> PathBuf {
        self.cache_dir(cache_root, node)
            .join(format!("{archive}.{BUNDLE_EXTENSION}"))
    }
}

/// `<prefix>/<node>/<archive-id>.cpk` remotely,
/// `<workspace>/<node>/archives` and `<cache>/<node>` locally
#[derive(Clone, Debug)]
pub struct DefaultNaming {
    prefix: String,
}

impl DefaultNaming {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }
}

impl Default for DefaultNaming {
    fn default() -> Self {
        Self::new("coldpack")
    }
}

impl NamingStrategy for DefaultNaming {
    fn remote_key(&self, node: &NodeId, archive: &ArchiveId) -> String {
        if self.prefix.is_empty() {
            format!("{node}/{archive}.{BUNDLE_EXTENSION}")
        } else {
            format!("{}/{node}/{archive}.{BUNDLE_EXTENSION}", self.prefix)
        }
    }

    fn workspace_dir(&self, workspace_root: &Path, node: &NodeId) -> PathBuf {
        workspace_root.join(node.as_str()).join("archives")
    }

    fn cache_dir(&self, cache_root: &Path, node: &NodeId) -> PathBuf {
        cache_root.join(node.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let naming = DefaultNaming::new("/bucket-prefix/");
        let node = NodeId::new("node-a").unwrap();
        let archive = ArchiveId::new_unchecked("20240611093012345-1f3a9c0e");

        assert_eq!(
            naming.remote_key(&node, &archive),
            "bucket-prefix/node-a/20240611093012345-1f3a9c0e.cpk"
        );
        assert_eq!(
            naming.workspace_dir(Path::new("/ws"), &node),
            PathBuf::from("/ws/node-a/archives")
        );
        assert_eq!(
            naming.cache_path(Path::new("/cache"), &node, &archive),
            PathBuf::from("/cache/node-a/20240611093012345-1f3a9c0e.cpk")
        );
        assert_eq!(
            DefaultNaming::new("").remote_key(&node, &archive),
            "node-a/20240611093012345-1f3a9c0e.cpk"
        );
    }
}
