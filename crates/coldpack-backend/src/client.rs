//! Cold object store client interface.
//!
//! Shaped after the S3 operations a glacier-class bucket needs: plain and
//! multipart uploads, restore requests, and reads of restored objects.

use async_trait::async_trait;
use bytes::Bytes;
use coldpack_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User metadata attached to an object
pub type ObjectMetadata = BTreeMap<String, String>;

/// Result of a completed upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// One uploaded part of a multipart upload
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Restoration state of an archived object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreStatus {
    /// Archived, no restore requested
    NotRequested,
    /// Restore in progress
    Pending,
    /// Readable now
    Available,
    /// A restored copy existed but lapsed
    Expired,
}

/// Object attributes without the body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: String,
    pub metadata: ObjectMetadata,
    pub restore: RestoreStatus,
}

/// Client of a cold-tier object store.
///
/// Missing objects are reported as `Error::NotFound`; transient faults as
/// `Error::Storage`.
#[async_trait]
pub trait ColdStoreClient: Send + Sync {
    async fn put_object(&self, key: &str, body: Bytes, metadata: ObjectMetadata)
    -> Result<ObjectInfo>;

    /// Start a multipart upload, returning its upload id
    async fn create_multipart_upload(&self, key: &str, metadata: ObjectMetadata) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> Result<CompletedPart>;

    /// Assemble the parts (in part-number order) into the final object
    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<ObjectInfo>;

    /// Drop an unfinished upload and every part uploaded so far
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Ask for a readable copy of an archived object
    async fn restore_object(&self, key: &str) -> Result<()>;

    async fn head_object(&self, key: &str) -> Result<ObjectHead>;

    /// Read a restored object
    async fn get_object(&self, key: &str) -> Result<Bytes>;

    async fn delete_object(&self, key: &str) -> Result<()>;
}
