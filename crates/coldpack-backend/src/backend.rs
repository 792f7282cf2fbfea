//! Archive backends.
//!
//! [`ArchiveBackend`] is what the submitter and the restore cache talk to:
//! put a sealed bundle, request and poll a restore, fetch a restored bundle.

use crate::CHECKSUM_METADATA_KEY;
use crate::client::{ColdStoreClient, ObjectMetadata, RestoreStatus};
use crate::fs::{check_key, write_atomic};
use crate::uploader::{MultipartUploader, PartPlan};
use async_trait::async_trait;
use bytes::Bytes;
use coldpack_common::{Checksum, Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Outcome of a successful put
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub size: u64,
    /// 1 for a single-part upload
    pub parts: u32,
}

/// Capability to store and restore archive bundles
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    /// Short name for logs
    fn kind(&self) -> &'static str;

    /// Upload the bundle at `source` under `key`
    async fn put(&self, key: &str, source: &Path, checksum: &Checksum) -> Result<PutReceipt>;

    /// Ask for the object to become readable. Idempotent.
    async fn request_restore(&self, key: &str) -> Result<()>;

    async fn restore_status(&self, key: &str) -> Result<RestoreStatus>;

    /// Write the restored object to `dest`, returning its size
    async fn get(&self, key: &str, dest: &Path) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;
}

fn map_not_found(key: &str) -> impl FnOnce(std::io::Error) -> Error + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(key.to_string())
        } else {
            Error::Io(e)
        }
    }
}

/// Archives copied to a plain directory; always readable
pub struct LocalDiskBackend {
    root: PathBuf,
}

impl LocalDiskBackend {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArchiveBackend for LocalDiskBackend {
    fn kind(&self) -> &'static str {
        "local-disk"
    }

    async fn put(&self, key: &str, source: &Path, _checksum: &Checksum) -> Result<PutReceipt> {
        let dest = self.key_path(key)?;
        let data = fs::read(source).await?;
        write_atomic(&dest, &data).await?;
        Ok(PutReceipt {
            key: key.to_string(),
            size: data.len() as u64,
            parts: 1,
        })
    }

    async fn request_restore(&self, key: &str) -> Result<()> {
        self.restore_status(key).await.map(|_| ())
    }

    async fn restore_status(&self, key: &str) -> Result<RestoreStatus> {
        fs::metadata(self.key_path(key)?)
            .await
            .map_err(map_not_found(key))?;
        Ok(RestoreStatus::Available)
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<u64> {
        let data = fs::read(self.key_path(key)?)
            .await
            .map_err(map_not_found(key))?;
        write_atomic(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        fs::remove_file(self.key_path(key)?)
            .await
            .map_err(map_not_found(key))
    }
}

/// Archives stored in a cold object store
pub struct ColdStoreBackend {
    client: Arc<dyn ColdStoreClient>,
    uploader: MultipartUploader,
    multipart_threshold: u64,
}

impl ColdStoreBackend {
    /// Bundles of `multipart_threshold` bytes or more are uploaded in parts of
    /// that size, `parallelism` at a time.
    pub fn new(client: Arc<dyn ColdStoreClient>, multipart_threshold: u64, parallelism: usize) -> Self {
        Self {
            uploader: MultipartUploader::new(client.clone(), multipart_threshold, parallelism),
            client,
            multipart_threshold,
        }
    }

    #[must_use]
    pub fn client(&self) -> &Arc<dyn ColdStoreClient> {
        &self.client
    }
}

#[async_trait]
impl ArchiveBackend for ColdStoreBackend {
    fn kind(&self) -> &'static str {
        "cold-store"
    }

    async fn put(&self, key: &str, source: &Path, checksum: &Checksum) -> Result<PutReceipt> {
        let data = Bytes::from(fs::read(source).await?);
        let size = data.len() as u64;
        let mut metadata = ObjectMetadata::new();
        metadata.insert(CHECKSUM_METADATA_KEY.to_string(), checksum.hex());

        let (info, parts) = if size < self.multipart_threshold {
            (self.client.put_object(key, data, metadata).await?, 1)
        } else {
            let plan = PartPlan::new(size, self.multipart_threshold);
            (
                self.uploader.upload(key, data, metadata).await?,
                plan.part_count,
            )
        };
        if info.size != size {
            return Err(Error::storage(format!(
                "{key}: store reported {} bytes, uploaded {size}",
                info.size
            )));
        }
        debug!("Stored {} ({} bytes, {} parts)", key, size, parts);
        Ok(PutReceipt {
            key: key.to_string(),
            size,
            parts,
        })
    }

    async fn request_restore(&self, key: &str) -> Result<()> {
        self.client.restore_object(key).await
    }

    async fn restore_status(&self, key: &str) -> Result<RestoreStatus> {
        Ok(self.client.head_object(key).await?.restore)
    }

    async fn get(&self, key: &str, dest: &Path) -> Result<u64> {
        let data = self.client.get_object(key).await?;
        write_atomic(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client.delete_object(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryColdStore;
    use tempfile::tempdir;

    const MIB: usize = 1024 * 1024;

    #[tokio::test]
    async fn test_local_disk_round_trip() {
        let dir = tempdir().unwrap();
        let backend = LocalDiskBackend::new(dir.path().join("remote")).await.unwrap();
        let source = dir.path().join("bundle.cpk");
        std::fs::write(&source, b"bundle bytes").unwrap();

        let receipt = backend
            .put("p/n/a.cpk", &source, &Checksum::of(b"bundle bytes"))
            .await
            .unwrap();
        assert_eq!(receipt.size, 12);
        assert_eq!(
            backend.restore_status("p/n/a.cpk").await.unwrap(),
            RestoreStatus::Available
        );

        let dest = dir.path().join("cache/a.cpk");
        assert_eq!(backend.get("p/n/a.cpk", &dest).await.unwrap(), 12);
        assert_eq!(std::fs::read(&dest).unwrap(), b"bundle bytes");

        backend.delete("p/n/a.cpk").await.unwrap();
        assert!(backend.restore_status("p/n/a.cpk").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_cold_store_picks_upload_mode() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryColdStore::new());
        let backend = ColdStoreBackend::new(store.clone(), 5 * MIB as u64, 2);

        let small = dir.path().join("small.cpk");
        std::fs::write(&small, vec![1u8; 1024]).unwrap();
        let receipt = backend
            .put("k/small", &small, &Checksum::of(&[1u8; 1024]))
            .await
            .unwrap();
        assert_eq!(receipt.parts, 1);
        assert_eq!(
            store.object_metadata("k/small").unwrap()[CHECKSUM_METADATA_KEY],
            Checksum::of(&[1u8; 1024]).hex()
        );

        let large_data = vec![7u8; 11 * MIB];
        let large = dir.path().join("large.cpk");
        std::fs::write(&large, &large_data).unwrap();
        let receipt = backend
            .put("k/large", &large, &Checksum::of(&large_data))
            .await
            .unwrap();
        assert_eq!(receipt.parts, 3);
        assert_eq!(store.object_bytes("k/large").unwrap(), large_data);
    }
}
