//! Archive submitter: seals due archives, uploads sealed ones and discards
//! retired ones.

use crate::builder::ArchiveBuilder;
use crate::catalog::NodeWorkspace;
use crate::keeper::{OnLapse, keep_lease_while};
use coldpack_backend::ArchiveBackend;
use coldpack_common::config::UploadConfig;
use coldpack_common::{ArchiveId, ArchiveState, Clock, Error, NodeId, Result};
use coldpack_lease::{AcquireOutcome, LeaseCoordinator, LeaseHandle};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to one archive during a scan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Submitted {
        remote_key: String,
        size: u64,
        parts: u32,
    },
    /// Not attempted this cycle (lease busy, already submitted elsewhere, flagged corrupt)
    Skipped { reason: String },
    Failed { error: String, attempts: u32 },
    /// A retired archive was removed locally and remotely
    Discarded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmissionResult {
    pub node: NodeId,
    pub archive: ArchiveId,
    pub outcome: SubmissionOutcome,
}

impl SubmissionResult {
    #[must_use]
    pub const fn is_submitted(&self) -> bool {
        matches!(self.outcome, SubmissionOutcome::Submitted { .. })
    }
}

/// Lease name guarding the upload of one archive
#[must_use]
pub fn store_lease_name(node: &NodeId, archive: &ArchiveId) -> String {
    format!("store:{node}/{archive}")
}

pub struct ArchiveSubmitter {
    builder: Arc<ArchiveBuilder>,
    backend: Arc<dyn ArchiveBackend>,
    leases: Arc<LeaseCoordinator>,
    config: UploadConfig,
    clock: Arc<dyn Clock>,
}

impl ArchiveSubmitter {
    pub fn new(
        builder: Arc<ArchiveBuilder>,
        backend: Arc<dyn ArchiveBackend>,
        leases: Arc<LeaseCoordinator>,
        config: UploadConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            builder,
            backend,
            leases,
            config,
            clock,
        }
    }

    /// Seal what is due, then try to upload every `SEALED` or `FAILED`
    /// archive of `node` and discard the retired ones
    pub async fn scan_and_submit(&self, node: &NodeId) -> Result<Vec<SubmissionResult>> {
        match self.builder.seal_due(node) {
            Ok(sealed) => {
                for (id, reason) in sealed {
                    debug!("Scan sealed {}/{} ({})", node, id, reason);
                }
            }
            Err(Error::LeaseBusy(holder)) => debug!("Not sealing {} this scan: {}", node, holder),
            Err(e) => return Err(e),
        }

        let ws = self.builder.catalog().node(node)?;
        let (pending, retired): (Vec<ArchiveId>, Vec<ArchiveId>) = {
            let mut index = ws.lock();
            ws.sync(&mut index)?;
            let pending = index
                .archives()
                .filter(|m| m.state.is_pending_upload() && !m.is_retired())
                .map(|m| m.id.clone())
                .collect();
            let retired = index
                .archives()
                .filter(|m| m.is_retired())
                .map(|m| m.id.clone())
                .collect();
            (pending, retired)
        };

        let mut results = Vec::with_capacity(pending.len() + retired.len());
        for id in pending {
            let outcome = match self.submit(&ws, &id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Submission of {}/{} not attempted: {}", node, id, e);
                    SubmissionOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
            };
            results.push(SubmissionResult {
                node: node.clone(),
                archive: id,
                outcome,
            });
        }
        for id in retired {
            let outcome = match self.discard_leased(&ws, &id).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Retired archive {}/{} not discarded: {}", node, id, e);
                    SubmissionOutcome::Skipped {
                        reason: e.to_string(),
                    }
                }
            };
            results.push(SubmissionResult {
                node: node.clone(),
                archive: id,
                outcome,
            });
        }
        Ok(results)
    }

    async fn submit(&self, ws: &NodeWorkspace, id: &ArchiveId) -> Result<SubmissionOutcome> {
        let name = store_lease_name(ws.node(), id);
        let mut handle = match self.leases.acquire(&name)? {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::Busy { holder, .. } => {
                debug!("Skipping {}/{}: being submitted by {}", ws.node(), id, holder);
                return Ok(SubmissionOutcome::Skipped {
                    reason: format!("lease held by {holder}"),
                });
            }
        };
        let outcome = self.submit_locked(ws, id, &mut handle).await;
        if let Err(e) = self.leases.release(handle) {
            warn!("Failed to release {}: {}", name, e);
        }
        outcome
    }

    async fn discard_leased(&self, ws: &NodeWorkspace, id: &ArchiveId) -> Result<SubmissionOutcome> {
        let name = store_lease_name(ws.node(), id);
        let handle = match self.leases.acquire(&name)? {
            AcquireOutcome::Acquired(handle) => handle,
            AcquireOutcome::Busy { holder, .. } => {
                return Ok(SubmissionOutcome::Skipped {
                    reason: format!("lease held by {holder}"),
                });
            }
        };
        let outcome = self.discard(ws, id).await;
        if let Err(e) = self.leases.release(handle) {
            warn!("Failed to release {}: {}", name, e);
        }
        outcome.map(|()| SubmissionOutcome::Discarded)
    }

    /// Remove a retired archive: its remote object (if it was ever
    /// uploaded), its local bundle and finally its manifest. The caller
    /// holds the archive's `store:` lease.
    pub(crate) async fn discard(&self, ws: &NodeWorkspace, id: &ArchiveId) -> Result<()> {
        let manifest = {
            let mut index = ws.lock();
            match ws.refresh(&mut index, id) {
                Ok(manifest) => manifest,
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Discarded by another worker
                    index.remove(id);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        };
        if !manifest.is_retired() {
            return Err(Error::internal(format!(
                "{}/{id} still has {} members",
                ws.node(),
                manifest.members.len()
            )));
        }
        if matches!(manifest.state, ArchiveState::Submitted | ArchiveState::Failed) {
            let key = manifest
                .remote_key
                .clone()
                .unwrap_or_else(|| self.builder.catalog().naming().remote_key(ws.node(), id));
            match self.backend.delete(&key).await {
                Ok(()) => info!("Deleted {} from {}", key, self.backend.kind()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        ws.forget(&mut ws.lock(), id)?;
        info!("Discarded retired archive {}/{}", ws.node(), id);
        Ok(())
    }

    async fn submit_locked(
        &self,
        ws: &NodeWorkspace,
        id: &ArchiveId,
        handle: &mut LeaseHandle,
    ) -> Result<SubmissionOutcome> {
        let node = ws.node();
        // Another worker may have finished it since the scan
        let mut manifest = {
            let mut index = ws.lock();
            ws.refresh(&mut index, id)?
        };
        if !manifest.state.is_pending_upload() {
            return Ok(SubmissionOutcome::Skipped {
                reason: format!("already {}", manifest.state),
            });
        }
        if manifest.is_retired() {
            return Ok(SubmissionOutcome::Skipped {
                reason: "retired".to_string(),
            });
        }
        if manifest.corrupt {
            error!(
                "Archive {}/{} is flagged corrupt and will not be uploaded",
                node, id
            );
            return Ok(SubmissionOutcome::Skipped {
                reason: "flagged corrupt".to_string(),
            });
        }
        let (Some(checksum), Some(size)) = (manifest.bundle_checksum.clone(), manifest.bundle_size)
        else {
            ws.mark_corrupt(id, "sealed archive has no bundle checksum")?;
            return Ok(SubmissionOutcome::Skipped {
                reason: "flagged corrupt".to_string(),
            });
        };
        if manifest.upload_attempts >= self.config.max_upload_attempts {
            error!(
                "Archive {}/{} has failed {} uploads (last: {}); retrying",
                node,
                id,
                manifest.upload_attempts,
                manifest.last_error.as_deref().unwrap_or("unknown")
            );
        }

        let key = self.builder.catalog().naming().remote_key(node, id);
        let path = ws.bundle_path(id);
        let put = self.backend.put(&key, &path, &checksum);
        // The upload is idempotent; a lost lease only means another worker
        // may upload the same bytes again
        let uploaded = keep_lease_while(&self.leases, handle, OnLapse::Finish, put)
            .await
            .and_then(|receipt| {
                if receipt.size == size {
                    Ok(receipt)
                } else {
                    Err(Error::storage(format!(
                        "uploaded {} bytes, bundle is {size}",
                        receipt.size
                    )))
                }
            });

        manifest.upload_attempts += 1;
        match uploaded {
            Ok(receipt) => {
                manifest.state = ArchiveState::Submitted;
                manifest.remote_key = Some(receipt.key.clone());
                manifest.submitted_at = Some(self.clock.now());
                manifest.last_error = None;
                {
                    let mut index = ws.lock();
                    ws.commit(&mut index, manifest)?;
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Could not delete uploaded bundle {}: {}", path.display(), e),
                }
                info!(
                    "Submitted {}/{} to {} as {} ({} bytes, {} parts)",
                    node,
                    id,
                    self.backend.kind(),
                    receipt.key,
                    receipt.size,
                    receipt.parts
                );
                Ok(SubmissionOutcome::Submitted {
                    remote_key: receipt.key,
                    size: receipt.size,
                    parts: receipt.parts,
                })
            }
            Err(e) => {
                let failure = Error::UploadFailed {
                    archive: id.clone(),
                    reason: e.to_string(),
                };
                let attempts = manifest.upload_attempts;
                manifest.state = ArchiveState::Failed;
                manifest.last_error = Some(failure.to_string());
                {
                    let mut index = ws.lock();
                    ws.commit(&mut index, manifest)?;
                }
                if attempts >= self.config.max_upload_attempts {
                    error!("{} (attempt {})", failure, attempts);
                } else {
                    warn!("{} (attempt {})", failure, attempts);
                }
                Ok(SubmissionOutcome::Failed {
                    error: failure.to_string(),
                    attempts,
                })
            }
        }
    }
}
