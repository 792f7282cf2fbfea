//! Configuration types for coldpack
//!
//! Every section has `#[serde(default)]`, so a TOML file only needs to name
//! the values it changes. Durations are plain integers whose unit is part of
//! the field name; use the accessor methods to get a [`Duration`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Root configuration for coldpack
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker identity and local directories
    pub worker: WorkerConfig,
    /// Archive building and seal thresholds
    pub archive: ArchiveConfig,
    /// Submission to the cold store
    pub upload: UploadConfig,
    /// Restore, lease renewal and cache eviction
    pub restore: RestoreConfig,
    /// Which cold store to talk to
    pub cold_store: ColdStoreConfig,
}

impl Config {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.archive.validate()?;
        self.upload.validate()?;
        self.restore.validate()?;
        Ok(())
    }
}

/// Worker identity and local directories
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Lease holder identity (default: `<hostname>-<pid>`)
    pub worker_id: Option<String>,
    /// Nodes this worker maintains
    pub nodes: Vec<String>,
    /// Root of the per-node archive workspaces
    pub workspace_dir: PathBuf,
    /// Root of the per-node restore caches
    pub cache_dir: PathBuf,
    /// Shared lease database (every worker on the host opens the same file)
    pub lease_db: PathBuf,
    /// Interval between maintenance passes
    pub maintenance_interval_s: u64,
}

impl WorkerConfig {
    /// Resolved lease holder identity
    #[must_use]
    pub fn holder_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let host = std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string());
            format!("{host}-{}", std::process::id())
        })
    }

    #[must_use]
    pub const fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_s)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            nodes: Vec::new(),
            workspace_dir: PathBuf::from("/var/lib/coldpack/workspace"),
            cache_dir: PathBuf::from("/var/lib/coldpack/cache"),
            lease_db: PathBuf::from("/var/lib/coldpack/leases.redb"),
            maintenance_interval_s: 300,
        }
    }
}

/// Archive building and seal thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Files above this size are not small files (default: 1 MiB)
    pub small_file_max_size: u64,
    /// Soft seal threshold on accumulated size (default: 10 MiB)
    pub archive_max_size: u64,
    /// Hard ceiling no archive may cross (default: 12 MiB)
    pub archive_hard_ceiling: u64,
    /// Seal threshold on member count
    pub archive_max_files: u64,
    /// Seal threshold on archive age (default: 24 hours)
    pub archive_max_age_hours: u64,
    /// Seal non-empty building archives when the worker stops
    pub seal_on_shutdown: bool,
}

impl ArchiveConfig {
    #[must_use]
    pub const fn archive_max_age(&self) -> Duration {
        Duration::from_secs(self.archive_max_age_hours * 3600)
    }

    fn validate(&self) -> Result<()> {
        if self.small_file_max_size == 0 {
            return Err(Error::Configuration(
                "archive.small_file_max_size must be positive".into(),
            ));
        }
        if self.archive_hard_ceiling < self.archive_max_size {
            return Err(Error::Configuration(format!(
                "archive.archive_hard_ceiling ({}) must be >= archive.archive_max_size ({})",
                self.archive_hard_ceiling, self.archive_max_size
            )));
        }
        if self.archive_max_files == 0 {
            return Err(Error::Configuration(
                "archive.archive_max_files must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            small_file_max_size: MIB,
            archive_max_size: 10 * MIB,
            archive_hard_ceiling: 12 * MIB,
            archive_max_files: 10_000,
            archive_max_age_hours: 24,
            seal_on_shutdown: false,
        }
    }
}

/// Submission to the cold store
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bundles at or above this size go multipart; also the part size (MiB)
    pub multipart_threshold_mb: u64,
    /// Parts in flight per multipart upload
    pub nb_parallel_parts_upload: usize,
    /// Failed attempts after which each retry is logged at error level
    pub max_upload_attempts: u32,
}

impl UploadConfig {
    #[must_use]
    pub const fn multipart_threshold(&self) -> u64 {
        self.multipart_threshold_mb * MIB
    }

    fn validate(&self) -> Result<()> {
        if self.multipart_threshold_mb == 0 {
            return Err(Error::Configuration(
                "upload.multipart_threshold_mb must be positive".into(),
            ));
        }
        if self.nb_parallel_parts_upload == 0 {
            return Err(Error::Configuration(
                "upload.nb_parallel_parts_upload must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_mb: 5,
            nb_parallel_parts_upload: 5,
            max_upload_attempts: 5,
        }
    }
}

/// Restore, lease renewal and cache eviction
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Lease lifetime, also the deferred-deletion check interval
    pub renew_duration_ms: u64,
    /// Renew a lease once less than this much validity is left
    pub renew_call_margin_ms: u64,
    /// First restore status poll delay; doubles after each poll
    pub poll_initial_delay_ms: u64,
    /// Cap on the poll delay, and the wait between cache polls when
    /// another worker holds the restore lease
    pub renew_max_iteration_waiting_period_ms: u64,
    /// Cache polls before giving up on another worker's restore
    pub restore_wait_max_iterations: u32,
    /// Total budget for one restore (default: 1 hour)
    pub s3_access_timeout_s: u64,
    /// Consecutive status-check failures tolerated during a restore
    pub max_unreachable_attempts: u32,
    /// A cache entry untouched for this long is deleted
    pub cache_idle_timeout_ms: u64,
    /// Orphaned cache entries older than this are swept (default: 24 hours)
    pub cache_lifetime_hours: u64,
}

impl RestoreConfig {
    #[must_use]
    pub const fn renew_duration(&self) -> Duration {
        Duration::from_millis(self.renew_duration_ms)
    }

    #[must_use]
    pub const fn renew_call_margin(&self) -> Duration {
        Duration::from_millis(self.renew_call_margin_ms)
    }

    #[must_use]
    pub const fn poll_initial_delay(&self) -> Duration {
        Duration::from_millis(self.poll_initial_delay_ms)
    }

    #[must_use]
    pub const fn max_iteration_waiting_period(&self) -> Duration {
        Duration::from_millis(self.renew_max_iteration_waiting_period_ms)
    }

    #[must_use]
    pub const fn s3_access_timeout(&self) -> Duration {
        Duration::from_secs(self.s3_access_timeout_s)
    }

    #[must_use]
    pub const fn cache_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_idle_timeout_ms)
    }

    #[must_use]
    pub const fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache_lifetime_hours * 3600)
    }

    fn validate(&self) -> Result<()> {
        if self.renew_duration_ms == 0 {
            return Err(Error::Configuration(
                "restore.renew_duration_ms must be positive".into(),
            ));
        }
        if self.renew_call_margin_ms >= self.renew_duration_ms {
            return Err(Error::Configuration(format!(
                "restore.renew_call_margin_ms ({}) must be below restore.renew_duration_ms ({})",
                self.renew_call_margin_ms, self.renew_duration_ms
            )));
        }
        if self.poll_initial_delay_ms == 0 || self.renew_max_iteration_waiting_period_ms == 0 {
            return Err(Error::Configuration(
                "restore poll delays must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            renew_duration_ms: 60_000,
            renew_call_margin_ms: 1_000,
            poll_initial_delay_ms: 1_000,
            renew_max_iteration_waiting_period_ms: 120_000,
            restore_wait_max_iterations: 30,
            s3_access_timeout_s: 3600,
            max_unreachable_attempts: 5,
            cache_idle_timeout_ms: 600_000,
            cache_lifetime_hours: 24,
        }
    }
}

/// Cold store implementation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ColdStoreKind {
    /// Plain directory; archives are always readable
    LocalDisk,
    /// Glacier-like bucket on a shared directory with a restore delay
    #[default]
    FsGlacier,
}

/// Which cold store to talk to
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdStoreConfig {
    pub kind: ColdStoreKind,
    /// Bucket root directory
    pub root: PathBuf,
    /// Prefix of every remote key
    pub key_prefix: String,
    /// Time a restore request takes to complete (`fs-glacier` only)
    pub restore_delay_s: u64,
    /// How long a restored copy stays readable (`fs-glacier` only)
    pub restored_copy_lifetime_hours: u64,
}

impl ColdStoreConfig {
    #[must_use]
    pub const fn restore_delay(&self) -> Duration {
        Duration::from_secs(self.restore_delay_s)
    }

    #[must_use]
    pub const fn restored_copy_lifetime(&self) -> Duration {
        Duration::from_secs(self.restored_copy_lifetime_hours * 3600)
    }
}

impl Default for ColdStoreConfig {
    fn default() -> Self {
        Self {
            kind: ColdStoreKind::default(),
            root: PathBuf::from("/var/lib/coldpack/bucket"),
            key_prefix: "coldpack".to_string(),
            restore_delay_s: 5,
            restored_copy_lifetime_hours: 24,
        }
    }
}
