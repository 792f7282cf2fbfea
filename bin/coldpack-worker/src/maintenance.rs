//! Background maintenance loop: seals, submits and sweeps one node every
//! `interval` until shutdown.

use std::sync::Arc;
use std::time::Duration;

use coldpack_archive::{ColdArchiveService, SubmissionOutcome};
use coldpack_common::NodeId;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Run one pass and log what happened
pub async fn run_once(service: &ColdArchiveService, node: &NodeId) {
    match service.periodic_maintenance(node).await {
        Ok(report) => {
            for result in &report.submissions {
                if let SubmissionOutcome::Failed { error, attempts } = &result.outcome {
                    warn!(
                        "Archive {}/{} not submitted (attempt {}): {}",
                        node, result.archive, attempts, error
                    );
                }
            }
            if report.sweep.busy > 0 {
                info!(
                    "{} cache entries of {} are still leased elsewhere",
                    report.sweep.busy, node
                );
            }
        }
        Err(e) => error!("Maintenance of {} failed: {}", node, e),
    }
}

/// Long-running background task for one node
pub async fn maintenance_loop(
    service: Arc<ColdArchiveService>,
    node: NodeId,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        run_once(&service, &node).await;
    }
    info!("Maintenance of {} stopped", node);
}
