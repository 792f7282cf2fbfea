//! Config file loading and command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use coldpack_common::Config;
use tracing::info;

/// Values given on the command line take precedence over the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub worker_id: Option<String>,
    pub workspace_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub lease_db: Option<PathBuf>,
    pub cold_store_root: Option<PathBuf>,
    pub nodes: Vec<String>,
    pub maintenance_interval_s: Option<u64>,
}

/// Read `path` if it exists, otherwise start from the defaults
pub fn load(path: &Path, overrides: Overrides) -> Result<Config> {
    let mut config: Config = if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
    } else {
        info!("No config at {}; using defaults", path.display());
        Config::default()
    };

    if let Some(id) = overrides.worker_id {
        config.worker.worker_id = Some(id);
    }
    if let Some(dir) = overrides.workspace_dir {
        config.worker.workspace_dir = dir;
    }
    if let Some(dir) = overrides.cache_dir {
        config.worker.cache_dir = dir;
    }
    if let Some(db) = overrides.lease_db {
        config.worker.lease_db = db;
    }
    if let Some(root) = overrides.cold_store_root {
        config.cold_store.root = root;
    }
    if !overrides.nodes.is_empty() {
        config.worker.nodes = overrides.nodes;
    }
    if let Some(interval) = overrides.maintenance_interval_s {
        config.worker.maintenance_interval_s = interval;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}
