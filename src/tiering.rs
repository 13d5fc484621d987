//! Tier manager: decides where new blobs go and moves bytes between tiers.
//!
//! Every location change goes through [`Database::update_location`], a
//! compare-and-swap on the stored location, so a stale worker can never
//! overwrite a newer state. No in-process lock is held across I/O.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{TieringConfig, TransferMode};
use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::object_store::Backends;
use crate::queue::{RetryOutcome, TransferQueue};
use crate::stage::LocalStage;
use crate::storage::models::{
    BackendKind, BlobLocation, BlobRecord, Delivery, LocationRollback, LocationUpdate, Placement,
    TransferTask,
};
use crate::storage::Database;

/// What a worker did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Bytes copied and the record now points at the destination.
    Transferred,
    /// The record was already remote; nothing to do.
    AlreadyRemote,
    /// The record moved on independently (lost a compare-and-swap).
    Superseded,
    /// The record no longer exists.
    Abandoned,
    /// The copy failed; the task was handed back with a backoff.
    Retrying { delay: Duration },
}

pub struct TierManager {
    config: TieringConfig,
    db: Database,
    stage: Arc<LocalStage>,
    backends: Backends,
    queue: TransferQueue,
}

impl TierManager {
    pub fn new(
        config: TieringConfig,
        db: Database,
        stage: Arc<LocalStage>,
        backends: Backends,
        queue: TransferQueue,
    ) -> Self {
        Self {
            config,
            db,
            stage,
            backends,
            queue,
        }
    }

    pub fn config(&self) -> &TieringConfig {
        &self.config
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    /// Object key a blob is stored under on any remote backend.
    pub fn destination_key(fingerprint: &Fingerprint) -> String {
        fingerprint.to_hex()
    }

    fn task_for(
        &self,
        fingerprint: &Fingerprint,
        source: Placement,
        target: BackendKind,
    ) -> TransferTask {
        TransferTask {
            fingerprint: *fingerprint,
            source,
            dest_backend: target,
            dest_key: Self::destination_key(fingerprint),
            enqueued_at: Utc::now(),
        }
    }

    // ========================================================================
    // Upload-time placement
    // ========================================================================

    /// Apply the tiering policy to a record this node just created.
    ///
    /// Synchronous mode copies inline and fails if the copy fails. Async mode
    /// enqueues a transfer and returns the record unchanged; an enqueue
    /// failure is logged and left to reconciliation since the bytes are
    /// already durable locally.
    pub async fn place_new_blob(&self, record: BlobRecord) -> Result<BlobRecord, StoreError> {
        let Some(target) = self.config.target else {
            return Ok(record);
        };
        if !matches!(record.location, BlobLocation::Local { .. }) {
            return Ok(record);
        }

        match self.config.mode {
            TransferMode::Sync => self.transfer_inline(record, target).await,
            TransferMode::Async => {
                let task = self.task_for(
                    &record.fingerprint,
                    record.location.readable_placement(),
                    target,
                );
                if let Err(e) = self.queue.enqueue(&task) {
                    tracing::warn!(
                        fingerprint = %record.fingerprint,
                        error = %e,
                        "Failed to enqueue transfer; reconciliation will retry"
                    );
                }
                Ok(record)
            }
        }
    }

    async fn transfer_inline(
        &self,
        record: BlobRecord,
        target: BackendKind,
    ) -> Result<BlobRecord, StoreError> {
        let fingerprint = record.fingerprint;
        let source = record.location.readable_placement();
        let key = Self::destination_key(&fingerprint);

        if let Err(e) = self.copy(&source, target, &key).await {
            // Keep the blob eligible for tiering once the backend recovers.
            let task = self.task_for(&fingerprint, source, target);
            if let Err(qe) = self.queue.enqueue(&task) {
                tracing::warn!(fingerprint = %fingerprint, error = %qe, "Failed to enqueue fallback transfer");
            }
            return Err(e);
        }

        let remote = BlobLocation::Remote {
            backend: target,
            key,
        };
        match self.db.update_location(&fingerprint, &record.location, remote)? {
            LocationUpdate::Applied(updated) => {
                tracing::debug!(fingerprint = %fingerprint, backend = %target, "Tiered blob inline");
                Ok(updated)
            }
            LocationUpdate::Conflict { .. } | LocationUpdate::Rejected { .. } => {
                tracing::debug!(fingerprint = %fingerprint, "Location changed during inline transfer");
                self.db
                    .lookup(&fingerprint)?
                    .ok_or_else(|| StoreError::unknown_blob(&fingerprint))
            }
        }
    }

    // ========================================================================
    // Transfer processing
    // ========================================================================

    /// Process one queue delivery.
    ///
    /// Replaying a delivery is safe: the current location is re-read first,
    /// a record already at its destination is acknowledged without copying,
    /// and a record left `PendingTransfer` by a crashed worker is resumed.
    pub async fn process(&self, delivery: &Delivery) -> Result<TransferOutcome, StoreError> {
        let task = &delivery.task;
        let fingerprint = task.fingerprint;

        let Some(record) = self.db.lookup(&fingerprint)? else {
            tracing::warn!(fingerprint = %fingerprint, "Dropping transfer for unknown blob");
            self.queue.ack(delivery)?;
            return Ok(TransferOutcome::Abandoned);
        };

        let source_location = BlobLocation::from(task.source.clone());
        let pending = BlobLocation::PendingTransfer {
            from: task.source.clone(),
            to_backend: task.dest_backend,
            to_key: task.dest_key.clone(),
        };

        if record.location == source_location {
            if !matches!(
                self.db
                    .update_location(&fingerprint, &source_location, pending.clone())?,
                LocationUpdate::Applied(_)
            ) {
                tracing::debug!(fingerprint = %fingerprint, "Location changed before transfer started");
                self.queue.ack(delivery)?;
                return Ok(TransferOutcome::Superseded);
            }
        } else if record.location == pending {
            tracing::info!(
                fingerprint = %fingerprint,
                attempt = delivery.attempt,
                "Resuming interrupted transfer"
            );
        } else if record.location.is_remote() {
            self.queue.ack(delivery)?;
            return Ok(TransferOutcome::AlreadyRemote);
        } else {
            tracing::debug!(fingerprint = %fingerprint, "Blob is pending a different transfer");
            self.queue.ack(delivery)?;
            return Ok(TransferOutcome::Superseded);
        }

        match self.copy(&task.source, task.dest_backend, &task.dest_key).await {
            Ok(()) => {
                let remote = BlobLocation::Remote {
                    backend: task.dest_backend,
                    key: task.dest_key.clone(),
                };
                let outcome = match self.db.update_location(&fingerprint, &pending, remote)? {
                    LocationUpdate::Applied(_) => {
                        tracing::info!(
                            fingerprint = %fingerprint,
                            backend = %task.dest_backend,
                            attempt = delivery.attempt,
                            "Transferred blob"
                        );
                        TransferOutcome::Transferred
                    }
                    _ => TransferOutcome::Superseded,
                };
                self.queue.ack(delivery)?;
                Ok(outcome)
            }
            Err(e) => {
                // Settle back on the source so reads keep a stable location.
                let rollback = LocationRollback {
                    expected: pending,
                    restore: source_location,
                };
                match self.queue.retry(delivery, &e.to_string(), Some(&rollback))? {
                    RetryOutcome::Requeued { delay, .. } => Ok(TransferOutcome::Retrying { delay }),
                    RetryOutcome::Superseded => Ok(TransferOutcome::Superseded),
                    RetryOutcome::Exhausted(_) => Err(StoreError::Exhausted(fingerprint)),
                }
            }
        }
    }

    /// Copy the bytes at `source` to `target`, bounded by the in-flight limit.
    async fn copy(
        &self,
        source: &Placement,
        target: BackendKind,
        key: &str,
    ) -> Result<(), StoreError> {
        let transfer = async {
            let store = self.backends.get(target)?;
            let data = self.read_placement(source).await?;
            store.put(key, data).await?;
            Ok::<(), StoreError>(())
        };

        match tokio::time::timeout(self.config.transfer_timeout, transfer).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::BackendUnavailable(format!(
                "transfer to {target} exceeded {}s",
                self.config.transfer_timeout.as_secs()
            ))),
        }
    }

    pub async fn read_placement(&self, placement: &Placement) -> Result<Bytes, StoreError> {
        match placement {
            Placement::Local { path } => Ok(self.stage.read(path).await?),
            Placement::Remote { backend, key } => Ok(self.backends.get(*backend)?.get(key).await?),
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Enqueue transfers for records that need one but have no queued or
    /// stuck task: `PendingTransfer` records whose worker died, and `Local`
    /// records while a tier target is configured.
    pub fn reconcile(&self) -> Result<usize, StoreError> {
        let mut enqueued = 0;

        for record in self.db.all_blobs()? {
            let fingerprint = record.fingerprint;
            let task = match record.location {
                BlobLocation::PendingTransfer {
                    from,
                    to_backend,
                    to_key,
                } => TransferTask {
                    fingerprint,
                    source: from,
                    dest_backend: to_backend,
                    dest_key: to_key,
                    enqueued_at: Utc::now(),
                },
                BlobLocation::Local { path } => match self.config.target {
                    Some(target) => self.task_for(&fingerprint, Placement::Local { path }, target),
                    None => continue,
                },
                BlobLocation::Remote { .. } => continue,
            };

            if self.queue.is_queued(&fingerprint)? || self.queue.is_stuck(&fingerprint)? {
                continue;
            }
            if self.queue.enqueue(&task)? {
                enqueued += 1;
            }
        }

        if enqueued > 0 {
            tracing::info!(enqueued, "Reconciliation re-enqueued untracked transfers");
        }
        Ok(enqueued)
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    /// Spawn the configured number of transfer workers.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker_id| {
                let manager = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { manager.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    pub async fn run_worker(&self, worker_id: usize, shutdown: CancellationToken) {
        tracing::debug!(worker_id, "Transfer worker started");

        loop {
            let delivery = match self.queue.claim(&shutdown, self.config.poll_interval).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(worker_id, error = %e, "Failed to claim transfer");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => continue,
                    }
                }
            };

            match self.process(&delivery).await {
                Ok(outcome) => {
                    tracing::debug!(
                        worker_id,
                        fingerprint = %delivery.task.fingerprint,
                        ?outcome,
                        "Processed transfer"
                    );
                }
                // Already reported by the queue
                Err(StoreError::Exhausted(_)) => {}
                Err(e) => {
                    // Left unacknowledged: redelivered once the lease expires.
                    tracing::error!(
                        worker_id,
                        fingerprint = %delivery.task.fingerprint,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Transfer processing failed"
                    );
                }
            }
        }

        tracing::debug!(worker_id, "Transfer worker stopped");
    }

    /// Periodically run [`TierManager::reconcile`] until `shutdown`.
    pub fn spawn_reconciler(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = manager.reconcile() {
                            tracing::error!(error = %e, "Reconciliation failed");
                        }
                    }
                }
            }
        })
    }
}
