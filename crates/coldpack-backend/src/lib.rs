//! coldpack backends
//!
//! The cold object store interface, a multipart uploader built on it, two
//! store implementations (shared directory and in-memory) and the
//! [`ArchiveBackend`] capability the archive crate talks to.

pub mod backend;
pub mod client;
pub mod fs;
pub mod memory;
pub mod naming;
pub mod uploader;

pub use backend::{ArchiveBackend, ColdStoreBackend, LocalDiskBackend, PutReceipt};
pub use client::{ColdStoreClient, CompletedPart, ObjectHead, ObjectInfo, ObjectMetadata, RestoreStatus};
pub use fs::FsColdStore;
pub use memory::MemoryColdStore;
pub use naming::{DefaultNaming, NamingStrategy};
pub use uploader::{MultipartUploader, PartPlan};

/// Object metadata key carrying the bundle checksum
pub const CHECKSUM_METADATA_KEY: &str = "coldpack-checksum";
