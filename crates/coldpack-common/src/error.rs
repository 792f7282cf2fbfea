//! Error types for coldpack
//!
//! This module defines the error taxonomy shared by the builder, the
//! submitter, the restore cache and the lease coordinator.

use crate::types::{ArchiveId, NodeIdError};
use thiserror::Error;

/// Common result type for coldpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for coldpack
#[derive(Debug, Error)]
pub enum Error {
    // Archive building
    #[error(
        "archive {archive} is full: {current} + {incoming} bytes exceeds ceiling of {ceiling} bytes"
    )]
    CapacityExceeded {
        archive: ArchiveId,
        current: u64,
        incoming: u64,
        ceiling: u64,
    },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("corrupt archive {archive}: {reason}")]
    CorruptArchive { archive: ArchiveId, reason: String },

    // Coordination
    #[error("lease busy: {0}")]
    LeaseBusy(String),

    #[error("lease expired: {0}")]
    LeaseExpired(String),

    // Remote transfers
    #[error("upload of archive {archive} failed: {reason}")]
    UploadFailed { archive: ArchiveId, reason: String },

    #[error("restore of {target} timed out after {waited_ms} ms")]
    RestoreTimeout { target: String, waited_ms: u64 },

    // Lookup
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid node id: {0}")]
    InvalidNodeId(#[from] NodeIdError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // Infrastructure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create a corrupt archive error
    pub fn corrupt(archive: &ArchiveId, reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            archive: archive.clone(),
            reason: reason.into(),
        }
    }

    /// Check if the same call may succeed later without operator action
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RestoreTimeout { .. }
                | Self::UploadFailed { .. }
                | Self::LeaseBusy(_)
                | Self::CapacityExceeded { .. }
                | Self::Storage(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// "Temporarily unavailable, retry later" as opposed to "not found"
    #[must_use]
    pub const fn is_temporarily_unavailable(&self) -> bool {
        matches!(
            self,
            Self::RestoreTimeout { .. } | Self::LeaseBusy(_) | Self::Storage(_)
        )
    }

    /// Errors that need an operator, never silently retried
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptArchive { .. } | Self::Configuration(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryable() {
        assert!(
            Error::RestoreTimeout {
                target: "n1/a".into(),
                waited_ms: 10
            }
            .is_retryable()
        );
        assert!(Error::LeaseBusy("store:n1/a".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::corrupt(&ArchiveId::new_unchecked("a"), "bad").is_retryable());
    }

    #[test]
    fn test_not_found_vs_unavailable() {
        let missing = Error::not_found("n1/a.txt");
        assert!(missing.is_not_found());
        assert!(!missing.is_temporarily_unavailable());

        let timeout = Error::RestoreTimeout {
            target: "n1/a".into(),
            waited_ms: 5_000,
        };
        assert!(!timeout.is_not_found());
        assert!(timeout.is_temporarily_unavailable());
    }

    #[test]
    fn test_corrupt_archive_is_fatal() {
        let err = Error::corrupt(&ArchiveId::new_unchecked("20240101000000000-abcd1234"), "offset");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("20240101000000000-abcd1234"));
    }
}
