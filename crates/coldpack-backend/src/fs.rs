//! Glacier-like bucket on a shared directory.
//!
//! Several workers can point at the same root. Objects are archived on
//! upload; a restore request makes them readable after `restore_delay` for
//! `restored_lifetime`, after which the restored copy lapses.
//!
//! Layout under the root:
//! - `objects/<key>` object bytes
//! - `meta/<key>.json` object attributes and restore state
//! - `uploads/<upload-id>/` in-progress multipart uploads

use crate::client::{
    ColdStoreClient, CompletedPart, ObjectHead, ObjectInfo, ObjectMetadata, RestoreStatus,
};
use async_trait::async_trait;
use bytes::Bytes;
use coldpack_common::{Checksum, Clock, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct FsObjectMeta {
    size: u64,
    etag: String,
    #[serde(default)]
    metadata: ObjectMetadata,
    stored_at_ms: u64,
    #[serde(default)]
    restore_requested_at_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FsUpload {
    key: String,
    #[serde(default)]
    metadata: ObjectMetadata,
}

/// Cold store on a directory
pub struct FsColdStore {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    restore_delay: Duration,
    restored_lifetime: Duration,
}

impl FsColdStore {
    pub async fn new(
        root: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        restore_delay: Duration,
        restored_lifetime: Duration,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for sub in ["objects", "meta", "uploads"] {
            fs::create_dir_all(root.join(sub)).await?;
        }
        Ok(Self {
            root,
            clock,
            restore_delay,
            restored_lifetime,
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join("objects").join(key))
    }

    fn meta_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join("meta").join(format!("{key}.json")))
    }

    fn upload_dir(&self, upload_id: &str) -> Result<PathBuf> {
        Uuid::parse_str(upload_id)
            .map_err(|_| Error::invalid_argument(format!("invalid upload id: {upload_id}")))?;
        Ok(self.root.join("uploads").join(upload_id))
    }

    fn status_at(&self, meta: &FsObjectMeta, now_ms: u64) -> RestoreStatus {
        let Some(requested) = meta.restore_requested_at_ms else {
            return RestoreStatus::NotRequested;
        };
        let delay = u64::try_from(self.restore_delay.as_millis()).unwrap_or(u64::MAX);
        let lifetime = u64::try_from(self.restored_lifetime.as_millis()).unwrap_or(u64::MAX);
        let ready_at = requested.saturating_add(delay);
        if now_ms < ready_at {
            RestoreStatus::Pending
        } else if now_ms < ready_at.saturating_add(lifetime) {
            RestoreStatus::Available
        } else {
            RestoreStatus::Expired
        }
    }

    async fn read_meta(&self, key: &str) -> Result<FsObjectMeta> {
        let path = self.meta_path(key)?;
        let raw = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(key.to_string())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    async fn write_meta(&self, key: &str, meta: &FsObjectMeta) -> Result<()> {
        let path = self.meta_path(key)?;
        write_atomic(&path, &serde_json::to_vec_pretty(meta)?).await
    }

    async fn commit_object(
        &self,
        key: &str,
        data: &[u8],
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo> {
        let etag = Checksum::of(data).hex();
        write_atomic(&self.object_path(key)?, data).await?;
        let meta = FsObjectMeta {
            size: data.len() as u64,
            etag: etag.clone(),
            metadata,
            stored_at_ms: self.clock.now_ms(),
            restore_requested_at_ms: None,
        };
        self.write_meta(key, &meta).await?;
        Ok(ObjectInfo {
            key: key.to_string(),
            size: meta.size,
            etag,
        })
    }
}

/// Reject keys that would escape the root
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.starts_with('\\') {
        return Err(Error::invalid_argument(format!("invalid object key: {key}")));
    }
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(Error::invalid_argument(format!(
            "object key contains unsafe path component: {key}"
        )));
    }
    Ok(())
}

/// Write to a uniquely named temp file, fsync, then rename into place
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_name = format!(".tmp.{}", Uuid::new_v4());
    let temp_path = path.with_file_name(
        path.file_name()
            .map_or_else(|| temp_name.clone(), |n| format!("{}{temp_name}", n.to_string_lossy())),
    );
    {
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
    }
    fs::rename(&temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl ColdStoreClient for FsColdStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo> {
        self.commit_object(key, &body, metadata).await
    }

    async fn create_multipart_upload(&self, key: &str, metadata: ObjectMetadata) -> Result<String> {
        check_key(key)?;
        let upload_id = Uuid::new_v4().to_string();
        let dir = self.upload_dir(&upload_id)?;
        fs::create_dir_all(&dir).await?;
        let upload = FsUpload {
            key: key.to_string(),
            metadata,
        };
        write_atomic(&dir.join("upload.json"), &serde_json::to_vec(&upload)?).await?;
        debug!("Created multipart upload {} for {}", upload_id, key);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart> {
        let dir = self.upload_dir(upload_id)?;
        if !fs::try_exists(&dir).await? {
            return Err(Error::not_found(format!("upload {upload_id}")));
        }
        write_atomic(&dir.join(format!("part-{part_number:05}")), &body).await?;
        Ok(CompletedPart {
            part_number,
            etag: Checksum::of(&body).hex(),
            size: body.len() as u64,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let dir = self.upload_dir(upload_id)?;
        let raw = fs::read(dir.join("upload.json")).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("upload {upload_id}"))
            } else {
                Error::Io(e)
            }
        })?;
        let upload: FsUpload = serde_json::from_slice(&raw)?;
        if upload.key != key {
            return Err(Error::invalid_argument(format!(
                "upload {upload_id} belongs to {}, not {key}",
                upload.key
            )));
        }

        let total: u64 = parts.iter().map(|p| p.size).sum();
        let mut data = Vec::with_capacity(usize::try_from(total).unwrap_or(0));
        for part in &parts {
            let body = fs::read(dir.join(format!("part-{:05}", part.part_number))).await?;
            if Checksum::of(&body).hex() != part.etag {
                return Err(Error::storage(format!(
                    "part {} of upload {upload_id} does not match its etag",
                    part.part_number
                )));
            }
            data.extend_from_slice(&body);
        }
        let info = self.commit_object(key, &data, upload.metadata).await?;
        fs::remove_dir_all(&dir).await?;
        Ok(info)
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let dir = self.upload_dir(upload_id)?;
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn restore_object(&self, key: &str) -> Result<()> {
        let mut meta = self.read_meta(key).await?;
        let now = self.clock.now_ms();
        match self.status_at(&meta, now) {
            RestoreStatus::NotRequested | RestoreStatus::Expired => {
                meta.restore_requested_at_ms = Some(now);
                self.write_meta(key, &meta).await?;
                debug!("Restore requested for {}", key);
            }
            RestoreStatus::Pending | RestoreStatus::Available => {}
        }
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectHead> {
        let meta = self.read_meta(key).await?;
        let restore = self.status_at(&meta, self.clock.now_ms());
        Ok(ObjectHead {
            size: meta.size,
            etag: meta.etag,
            metadata: meta.metadata,
            restore,
        })
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let meta = self.read_meta(key).await?;
        if self.status_at(&meta, self.clock.now_ms()) != RestoreStatus::Available {
            return Err(Error::storage(format!(
                "{key} is archived; restore it before reading"
            )));
        }
        Ok(Bytes::from(fs::read(self.object_path(key)?).await?))
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.meta_path(key)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldpack_common::ManualClock;
    use tempfile::tempdir;

    async fn store(root: &Path, clock: &Arc<ManualClock>) -> FsColdStore {
        FsColdStore::new(
            root,
            clock.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_restore_lifecycle() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = store(dir.path(), &clock).await;

        store
            .put_object("p/n/a.cpk", Bytes::from_static(b"bundle"), ObjectMetadata::new())
            .await
            .unwrap();
        assert_eq!(
            store.head_object("p/n/a.cpk").await.unwrap().restore,
            RestoreStatus::NotRequested
        );
        assert!(store.get_object("p/n/a.cpk").await.is_err());

        store.restore_object("p/n/a.cpk").await.unwrap();
        clock.advance(Duration::from_secs(30));
        assert_eq!(
            store.head_object("p/n/a.cpk").await.unwrap().restore,
            RestoreStatus::Pending
        );

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            store.get_object("p/n/a.cpk").await.unwrap(),
            Bytes::from_static(b"bundle")
        );

        clock.advance(Duration::from_secs(3600));
        assert_eq!(
            store.head_object("p/n/a.cpk").await.unwrap().restore,
            RestoreStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_multipart_and_abort() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = store(dir.path(), &clock).await;

        let id = store
            .create_multipart_upload("k", ObjectMetadata::new())
            .await
            .unwrap();
        let p2 = store
            .upload_part("k", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = store
            .upload_part("k", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let info = store
            .complete_multipart_upload("k", &id, vec![p1, p2])
            .await
            .unwrap();
        assert_eq!(info.size, 11);
        assert_eq!(
            fs::read(dir.path().join("objects/k")).await.unwrap(),
            b"hello world"
        );

        let id = store
            .create_multipart_upload("other", ObjectMetadata::new())
            .await
            .unwrap();
        store
            .upload_part("other", &id, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        store.abort_multipart_upload("other", &id).await.unwrap();
        assert!(store.head_object("other").await.unwrap_err().is_not_found());
        assert!(!dir.path().join("uploads").join(&id).exists());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let store = store(dir.path(), &clock).await;
        for key in ["../x", "/abs", "a/../../b"] {
            assert!(
                store
                    .put_object(key, Bytes::new(), ObjectMetadata::new())
                    .await
                    .is_err()
            );
        }
    }
}
