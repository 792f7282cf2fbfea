//! coldpack archive core
//!
//! Small files are appended to per-node bundles in a local workspace
//! ([`ArchiveBuilder`]), sealed bundles are uploaded to cold storage
//! ([`ArchiveSubmitter`]), and reads of submitted members go through a
//! shared restore cache ([`RestoreCache`]). [`ColdArchiveService`] ties the
//! three together behind `store` / `retrieve` / `delete` /
//! `periodic_maintenance`.

pub mod builder;
pub mod bundle;
pub mod catalog;
mod keeper;
pub mod restore;
pub mod service;
pub mod submitter;

pub use builder::{ArchiveBuilder, Rewrite};
pub use bundle::{ArchiveManifest, MemberEntry};
pub use catalog::{ArchiveCatalog, ArchiveLocation, NodeIndex, NodeWorkspace};
pub use restore::{CacheFetch, RestoreCache, RestoreTask, SweepReport};
pub use service::{
    ColdArchiveService, DeleteOutcome, MaintenanceReport, NodeStatus, RetrievedFile, RetrieveSource,
};
pub use submitter::{ArchiveSubmitter, SubmissionOutcome, SubmissionResult};
