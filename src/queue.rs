//! Durable, at-least-once transfer queue backed by the metadata database.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::TieringConfig;
use crate::fingerprint::Fingerprint;
use crate::storage::models::{Delivery, LocationRollback, Release, StuckTransfer, TransferTask};
use crate::storage::{Database, DatabaseError};

/// Bounded exponential backoff for failed transfers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` failed attempts.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

impl From<&TieringConfig> for RetryPolicy {
    fn from(config: &TieringConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }
}

/// What happened to a delivery handed back after a failure.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Requeued { failures: u32, delay: Duration },
    Exhausted(StuckTransfer),
    /// Another delivery of the same task superseded this one.
    Superseded,
}

#[derive(Clone)]
pub struct TransferQueue {
    db: Database,
    policy: RetryPolicy,
    lease: Duration,
    notify: Arc<Notify>,
}

impl TransferQueue {
    /// `lease` bounds how long a delivery may stay unacknowledged before it
    /// is treated as failed and redelivered.
    pub fn new(db: Database, policy: RetryPolicy, lease: Duration) -> Self {
        Self {
            db,
            policy,
            lease,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Queue a task. Idempotent per fingerprint: returns `false` if a task for
    /// the same fingerprint is already queued.
    pub fn enqueue(&self, task: &TransferTask) -> Result<bool, DatabaseError> {
        let (id, created) = self.db.enqueue_transfer(task, Utc::now())?;
        if created {
            tracing::debug!(
                queue_id = id,
                fingerprint = %task.fingerprint,
                backend = %task.dest_backend,
                "Enqueued transfer"
            );
            self.notify.notify_one();
        }
        Ok(created)
    }

    /// Lease the next available task, if any, without waiting.
    pub fn try_claim(&self) -> Result<Option<Delivery>, DatabaseError> {
        let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::days(1));
        let claim = self
            .db
            .claim_transfer(Utc::now(), lease, self.policy.max_attempts)?;

        for stuck in &claim.exhausted {
            report_stuck(stuck);
        }
        Ok(claim.delivery)
    }

    /// Wait for the next task. Returns `None` once `shutdown` is cancelled.
    pub async fn claim(
        &self,
        shutdown: &CancellationToken,
        poll_interval: Duration,
    ) -> Result<Option<Delivery>, DatabaseError> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(delivery) = self.try_claim()? {
                return Ok(Some(delivery));
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Acknowledge a fully processed delivery.
    pub fn ack(&self, delivery: &Delivery) -> Result<(), DatabaseError> {
        if !self.db.ack_transfer(delivery)? {
            tracing::debug!(
                queue_id = delivery.id,
                fingerprint = %delivery.task.fingerprint,
                "Ack ignored for superseded delivery"
            );
        }
        Ok(())
    }

    /// Hand a failed delivery back for a later attempt, applying `rollback`
    /// to the blob record if this delivery still owns the task.
    pub fn retry(
        &self,
        delivery: &Delivery,
        error: &str,
        rollback: Option<&LocationRollback>,
    ) -> Result<RetryOutcome, DatabaseError> {
        let delay = self.policy.backoff(delivery.attempt);
        let available_at =
            Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        let outcome = match self.db.release_transfer(
            delivery,
            error,
            available_at,
            self.policy.max_attempts,
            rollback,
        )? {
            Release::Requeued { failures, .. } => {
                tracing::warn!(
                    fingerprint = %delivery.task.fingerprint,
                    attempt = delivery.attempt,
                    max_attempts = self.policy.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transfer failed, will retry"
                );
                RetryOutcome::Requeued { failures, delay }
            }
            Release::Exhausted(stuck) => {
                report_stuck(&stuck);
                RetryOutcome::Exhausted(stuck)
            }
            Release::Stale => RetryOutcome::Superseded,
        };
        Ok(outcome)
    }

    pub fn depth(&self) -> Result<u64, DatabaseError> {
        self.db.queued_transfer_count()
    }

    pub fn is_queued(&self, fingerprint: &Fingerprint) -> Result<bool, DatabaseError> {
        self.db.is_transfer_queued(fingerprint)
    }

    pub fn stuck(&self) -> Result<Vec<StuckTransfer>, DatabaseError> {
        self.db.list_stuck_transfers()
    }

    pub fn is_stuck(&self, fingerprint: &Fingerprint) -> Result<bool, DatabaseError> {
        Ok(self.db.get_stuck_transfer(fingerprint)?.is_some())
    }

    /// Put a stuck transfer back on the queue. Returns `false` if the
    /// fingerprint was not stuck.
    pub fn requeue_stuck(&self, fingerprint: &Fingerprint) -> Result<bool, DatabaseError> {
        match self.db.requeue_stuck_transfer(fingerprint, Utc::now())? {
            Some(id) => {
                tracing::info!(queue_id = id, fingerprint = %fingerprint, "Requeued stuck transfer");
                self.notify.notify_one();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn report_stuck(stuck: &StuckTransfer) {
    tracing::error!(
        fingerprint = %stuck.task.fingerprint,
        backend = %stuck.task.dest_backend,
        failures = stuck.failures,
        last_error = stuck.last_error.as_deref().unwrap_or(""),
        "Transfer retries exhausted; blob is stuck and needs operator attention"
    );
}
