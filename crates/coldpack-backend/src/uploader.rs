//! Multipart upload with bounded parallelism.
//!
//! Parts are slices of one in-memory buffer, so the assembled object is the
//! exact concatenation of the local bytes.

use crate::client::{ColdStoreClient, CompletedPart, ObjectInfo, ObjectMetadata};
use bytes::Bytes;
use coldpack_common::{Error, Result};
use futures::{StreamExt, TryStreamExt, stream};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, warn};

/// Smallest part the store accepts, except for the last one (5 MiB)
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Most parts one upload may have
pub const MAX_PARTS: u64 = 10_000;

/// How an object of `total` bytes is cut into parts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartPlan {
    pub total: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    /// Use `requested_part_size`, raised to at least [`MIN_PART_SIZE`] and to
    /// whatever keeps the part count within [`MAX_PARTS`].
    #[must_use]
    pub fn new(total: u64, requested_part_size: u64) -> Self {
        let part_size = requested_part_size
            .max(MIN_PART_SIZE)
            .max(total.div_ceil(MAX_PARTS));
        let part_count = total.div_ceil(part_size).max(1);
        Self {
            total,
            part_size,
            part_count: u32::try_from(part_count).unwrap_or(u32::MAX),
        }
    }

    /// Byte range of a 1-based part number
    #[must_use]
    pub fn part_range(&self, part_number: u32) -> Range<u64> {
        let start = u64::from(part_number.saturating_sub(1)) * self.part_size;
        let end = (start + self.part_size).min(self.total);
        start.min(self.total)..end
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, Range<u64>)> + '_ {
        (1..=self.part_count).map(|n| (n, self.part_range(n)))
    }
}

/// Uploads large objects as parallel parts
pub struct MultipartUploader {
    client: Arc<dyn ColdStoreClient>,
    part_size: u64,
    parallelism: usize,
}

impl MultipartUploader {
    pub fn new(client: Arc<dyn ColdStoreClient>, part_size: u64, parallelism: usize) -> Self {
        Self {
            client,
            part_size,
            parallelism: parallelism.max(1),
        }
    }

    /// Upload `data` under `key`. Any failure aborts the multipart upload,
    /// so no partial object is left behind.
    pub async fn upload(
        &self,
        key: &str,
        data: Bytes,
        metadata: ObjectMetadata,
    ) -> Result<ObjectInfo> {
        let plan = PartPlan::new(data.len() as u64, self.part_size);
        let upload_id = self.client.create_multipart_upload(key, metadata).await?;
        debug!(
            "Multipart upload {} for {}: {} parts of {} bytes",
            upload_id, key, plan.part_count, plan.part_size
        );

        match self.upload_parts(key, &upload_id, &plan, &data).await {
            Ok(info) => Ok(info),
            Err(e) => {
                if let Err(abort_err) = self.client.abort_multipart_upload(key, &upload_id).await {
                    warn!(
                        "Failed to abort multipart upload {} for {}: {}",
                        upload_id, key, abort_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        plan: &PartPlan,
        data: &Bytes,
    ) -> Result<ObjectInfo> {
        let client = &self.client;
        let mut parts: Vec<CompletedPart> = stream::iter(plan.ranges())
            .map(|(part_number, range)| {
                #[allow(clippy::cast_possible_truncation)]
                let body = data.slice(range.start as usize..range.end as usize);
                async move { client.upload_part(key, upload_id, part_number, body).await }
            })
            .buffer_unordered(self.parallelism)
            .try_collect()
            .await?;
        parts.sort_by_key(|p| p.part_number);

        let info = self
            .client
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        if info.size != plan.total {
            // The object exists but is wrong; remove it before reporting
            if let Err(e) = self.client.delete_object(key).await {
                warn!("Failed to delete mis-sized object {}: {}", key, e);
            }
            return Err(Error::storage(format!(
                "{key}: store reported {} bytes, uploaded {}",
                info.size, plan.total
            )));
        }
        Ok(info)
    }
}
