//! In-process cold store for tests.
//!
//! Objects start archived. A restore completes after a configurable number
//! of status polls, and part or status failures can be injected. Reads can
//! be slowed down to simulate large downloads.

use crate::client::{
    ColdStoreClient, CompletedPart, ObjectHead, ObjectInfo, ObjectMetadata, RestoreStatus,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use coldpack_common::{Checksum, Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
enum RestoreState {
    Archived,
    Pending { polls_left: u32 },
    Restored,
    Lapsed,
}

struct StoredObject {
    data: Bytes,
    etag: String,
    metadata: ObjectMetadata,
    restore: RestoreState,
}

struct PendingUpload {
    key: String,
    metadata: ObjectMetadata,
    parts: BTreeMap<u32, Bytes>,
}

/// Cold store held in memory
pub struct MemoryColdStore {
    objects: Mutex<HashMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, PendingUpload>>,
    polls_to_restore: u32,
    fail_part: Mutex<Option<u32>>,
    failing_puts: AtomicU32,
    failing_status_checks: AtomicU32,
    get_delay: Mutex<Duration>,
    restore_requests: AtomicU32,
    status_polls: AtomicU32,
    aborted: AtomicU32,
}

impl MemoryColdStore {
    /// Restores complete on the first status poll
    #[must_use]
    pub fn new() -> Self {
        Self::with_restore_after_polls(1)
    }

    /// Restores report `Available` on the `polls`-th status poll
    #[must_use]
    pub fn with_restore_after_polls(polls: u32) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            polls_to_restore: polls.max(1),
            fail_part: Mutex::new(None),
            failing_puts: AtomicU32::new(0),
            failing_status_checks: AtomicU32::new(0),
            get_delay: Mutex::new(Duration::ZERO),
            restore_requests: AtomicU32::new(0),
            status_polls: AtomicU32::new(0),
            aborted: AtomicU32::new(0),
        }
    }

    /// The next upload of `part_number` fails
    pub fn fail_part_once(&self, part_number: u32) {
        *self.fail_part.lock() = Some(part_number);
    }

    /// The next `count` single-part puts fail
    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// The next `count` status checks fail as if the store were unreachable
    pub fn fail_next_status_checks(&self, count: u32) {
        self.failing_status_checks.store(count, Ordering::SeqCst);
    }

    /// Every read of a restored object takes at least `delay`
    pub fn delay_gets(&self, delay: Duration) {
        *self.get_delay.lock() = delay;
    }

    /// Let the restored copy of `key` lapse
    pub fn expire_restored_copy(&self, key: &str) {
        if let Some(obj) = self.objects.lock().get_mut(key) {
            obj.restore = RestoreState::Lapsed;
        }
    }

    #[must_use]
    pub fn object_bytes(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().get(key).map(|o| o.data.clone())
    }

    #[must_use]
    pub fn object_metadata(&self, key: &str) -> Option<ObjectMetadata> {
        self.objects.lock().get(key).map(|o| o.metadata.clone())
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    #[must_use]
    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    #[must_use]
    pub fn aborted_uploads(&self) -> u32 {
        self.aborted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn restore_requests(&self) -> u32 {
        self.restore_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn status_polls(&self) -> u32 {
        self.status_polls.load(Ordering::SeqCst)
    }

    /// Decrement `counter` if positive; true when a failure should be injected
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn store_object(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> ObjectInfo {
        let etag = Checksum::of(&data).hex();
        let size = data.len() as u64;
        self.objects.lock().insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
                metadata,
                restore: RestoreState::Archived,
            },
        );
        ObjectInfo {
            key: key.to_string(),
            size,
            etag,
        }
    }
}

impl Default for MemoryColdStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ColdStoreClient for MemoryColdStore {
    async fn put_object(
        &self,
        key: &str,
        body: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo> {
        if Self::take_failure(&self.failing_puts) {
            return Err(Error::storage(format!("simulated put failure for {key}")));
        }
        Ok(self.store_object(key, body, metadata))
    }

    async fn create_multipart_upload(&self, key: &str, metadata: ObjectMetadata) -> Result<String> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        self.uploads.lock().insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata,
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart> {
        {
            let mut fail = self.fail_part.lock();
            if *fail == Some(part_number) {
                *fail = None;
                return Err(Error::storage(format!(
                    "simulated failure of part {part_number} for {key}"
                )));
            }
        }
        let mut uploads = self.uploads.lock();
        let upload = uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::not_found(format!("upload {upload_id}")))?;
        let part = CompletedPart {
            part_number,
            etag: Checksum::of(&body).hex(),
            size: body.len() as u64,
        };
        upload.parts.insert(part_number, body);
        Ok(part)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo> {
        let upload = self
            .uploads
            .lock()
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::not_found(format!("upload {upload_id}")))?;
        let mut data = BytesMut::new();
        for part in &parts {
            let body = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| Error::storage(format!("missing part {}", part.part_number)))?;
            data.extend_from_slice(body);
        }
        Ok(self.store_object(key, data.freeze(), upload.metadata))
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        if self.uploads.lock().remove(upload_id).is_some() {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn restore_object(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        self.restore_requests.fetch_add(1, Ordering::SeqCst);
        if matches!(obj.restore, RestoreState::Archived | RestoreState::Lapsed) {
            obj.restore = RestoreState::Pending {
                polls_left: self.polls_to_restore,
            };
        }
        Ok(())
    }

    async fn head_object(&self, key: &str) -> Result<ObjectHead> {
        if Self::take_failure(&self.failing_status_checks) {
            return Err(Error::storage(format!("simulated: store unreachable for {key}")));
        }
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.objects.lock();
        let obj = objects
            .get_mut(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        let status = match obj.restore {
            RestoreState::Archived => RestoreStatus::NotRequested,
            RestoreState::Pending { polls_left } if polls_left <= 1 => {
                obj.restore = RestoreState::Restored;
                RestoreStatus::Available
            }
            RestoreState::Pending { polls_left } => {
                obj.restore = RestoreState::Pending {
                    polls_left: polls_left - 1,
                };
                RestoreStatus::Pending
            }
            RestoreState::Restored => RestoreStatus::Available,
            RestoreState::Lapsed => RestoreStatus::Expired,
        };
        Ok(ObjectHead {
            size: obj.data.len() as u64,
            etag: obj.etag.clone(),
            metadata: obj.metadata.clone(),
            restore: status,
        })
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        let delay = *self.get_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let objects = self.objects.lock();
        let obj = objects
            .get(key)
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        match obj.restore {
            RestoreState::Restored => Ok(obj.data.clone()),
            _ => Err(Error::storage(format!(
                "{key} is archived; restore it before reading"
            ))),
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.objects
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(key.to_string()))
    }
}
