//! coldpack worker
//!
//! Packs small files into archives in a local workspace, uploads sealed
//! archives to the cold store and restores them on demand. Several workers
//! on one host share the lease database and the restore cache.

mod maintenance;
mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coldpack_archive::ColdArchiveService;
use coldpack_backend::{ArchiveBackend, ColdStoreBackend, DefaultNaming, FsColdStore, LocalDiskBackend};
use coldpack_common::config::ColdStoreKind;
use coldpack_common::{Clock, Config, MemberPath, NodeId, SmallFile, SystemClock};
use coldpack_lease::RedbLeaseTable;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::Overrides;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "coldpack-worker", about = "coldpack archive worker", version)]
struct Args {
    /// Config file (TOML); defaults apply when it does not exist
    #[arg(short, long, default_value = "coldpack.toml")]
    config: PathBuf,

    /// Lease holder identity (default: <hostname>-<pid>)
    #[arg(long, env = "COLDPACK_WORKER_ID")]
    worker_id: Option<String>,

    /// Root of the per-node archive workspaces
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Root of the per-node restore caches
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Shared lease database
    #[arg(long)]
    lease_db: Option<PathBuf>,

    /// Cold store directory
    #[arg(long)]
    cold_store_root: Option<PathBuf>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run maintenance for the configured nodes until interrupted
    Run {
        /// Node to maintain (repeatable; overrides the config file)
        #[arg(long = "node")]
        nodes: Vec<String>,

        /// Seconds between maintenance passes
        #[arg(long)]
        maintenance_interval_s: Option<u64>,
    },
    /// Archive one small file
    Store {
        node: String,
        /// File to read
        file: PathBuf,
        /// Member path inside the node (default: the file name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Read one archived file back
    Retrieve {
        node: String,
        path: String,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete one archived file
    Delete { node: String, path: String },
    /// Run one maintenance pass
    Maintain { nodes: Vec<String> },
    /// Print archive counts as JSON
    Status { nodes: Vec<String> },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (nodes, interval) = match &args.command {
        Commands::Run {
            nodes,
            maintenance_interval_s,
        } => (nodes.clone(), *maintenance_interval_s),
        _ => (Vec::new(), None),
    };
    let config = settings::load(
        &args.config,
        Overrides {
            worker_id: args.worker_id,
            workspace_dir: args.workspace_dir,
            cache_dir: args.cache_dir,
            lease_db: args.lease_db,
            cold_store_root: args.cold_store_root,
            nodes,
            maintenance_interval_s: interval,
        },
    )?;
    let service = Arc::new(build_service(config).await?);

    match args.command {
        Commands::Run { .. } => run(service).await,
        Commands::Store { node, file, name } => {
            let node = parse_node(&node)?;
            let data = std::fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let name = match name {
                Some(name) => name,
                None => file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(ToString::to_string)
                    .context("file has no usable name; pass --name")?,
            };
            let small = SmallFile::new(MemberPath::new(name)?, data.len() as u64);
            let archived = service.store(&node, &small, &data).await?;
            println!("{archived}");
            Ok(())
        }
        Commands::Retrieve { node, path, output } => {
            let node = parse_node(&node)?;
            let file = service.retrieve(&node, &MemberPath::new(path)?).await;
            // Cache entries restored by a one-shot command do not outlive it
            service.shutdown().await?;
            let file = file?;
            info!("{} read from {:?} ({})", file.path, file.source, file.archive);
            match output {
                Some(out) => std::fs::write(&out, &file.data)
                    .with_context(|| format!("write {}", out.display()))?,
                None => {
                    use std::io::Write;
                    std::io::stdout().write_all(&file.data)?;
                }
            }
            Ok(())
        }
        Commands::Delete { node, path } => {
            let node = parse_node(&node)?;
            let outcome = service.delete(&node, &MemberPath::new(path)?).await;
            service.shutdown().await?;
            println!("{}", serde_json::to_string(&outcome?)?);
            Ok(())
        }
        Commands::Maintain { nodes } => {
            for node in resolve_nodes(&service, nodes)? {
                let report = service.periodic_maintenance(&node).await?;
                println!(
                    "{node}: {} sealed, {} submissions, {} cache entries removed",
                    report.sealed.len(),
                    report.submissions.len(),
                    report.sweep.removed
                );
            }
            service.shutdown().await?;
            Ok(())
        }
        Commands::Status { nodes } => {
            let mut statuses = Vec::new();
            for node in resolve_nodes(&service, nodes)? {
                statuses.push(service.status(&node)?);
            }
            println!("{}", serde_json::to_string_pretty(&statuses)?);
            Ok(())
        }
    }
}

async fn build_service(config: Config) -> Result<ColdArchiveService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let backend: Arc<dyn ArchiveBackend> = match config.cold_store.kind {
        ColdStoreKind::LocalDisk => Arc::new(
            LocalDiskBackend::new(&config.cold_store.root)
                .await
                .context("open local-disk cold store")?,
        ),
        ColdStoreKind::FsGlacier => {
            let store = FsColdStore::new(
                &config.cold_store.root,
                clock.clone(),
                config.cold_store.restore_delay(),
                config.cold_store.restored_copy_lifetime(),
            )
            .await
            .context("open cold store")?;
            Arc::new(ColdStoreBackend::new(
                Arc::new(store),
                config.upload.multipart_threshold(),
                config.upload.nb_parallel_parts_upload,
            ))
        }
    };
    info!(
        "Cold store: {} at {}",
        backend.kind(),
        config.cold_store.root.display()
    );

    let leases = RedbLeaseTable::open_shared(&config.worker.lease_db)
        .with_context(|| format!("open lease db {}", config.worker.lease_db.display()))?;
    let naming = Arc::new(DefaultNaming::new(config.cold_store.key_prefix.clone()));

    Ok(ColdArchiveService::open(
        config,
        backend,
        Arc::new(leases),
        naming,
        clock,
    )?)
}

fn parse_node(name: &str) -> Result<NodeId> {
    NodeId::new(name).with_context(|| format!("invalid node id {name:?}"))
}

fn resolve_nodes(service: &ColdArchiveService, explicit: Vec<String>) -> Result<Vec<NodeId>> {
    let names = if explicit.is_empty() {
        service.config().worker.nodes.clone()
    } else {
        explicit
    };
    names.iter().map(|n| parse_node(n)).collect()
}

async fn run(service: Arc<ColdArchiveService>) -> Result<()> {
    let nodes = resolve_nodes(&service, Vec::new())?;
    if nodes.is_empty() {
        anyhow::bail!("no nodes configured; use --node or [worker] nodes");
    }
    for node in &nodes {
        service.open_node(node)?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let interval = service.config().worker.maintenance_interval();
    let mut loops = Vec::with_capacity(nodes.len());
    for node in nodes {
        info!("Maintaining {} every {:?}", node, interval);
        loops.push(tokio::spawn(maintenance::maintenance_loop(
            Arc::clone(&service),
            node,
            interval,
            shutdown_rx.clone(),
        )));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    shutdown_tx.send_replace(true);
    for handle in loops {
        handle.await.ok();
    }
    service.shutdown().await?;
    info!("Worker shut down gracefully");
    Ok(())
}
