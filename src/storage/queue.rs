use chrono::{DateTime, Duration, Utc};
use redb::{ReadableTable, ReadableTableMetadata, WriteTransaction};

use super::blobs::swap_location;
use super::db::{Database, DatabaseError};
use super::models::{
    Delivery, LocationRollback, QueuedTransfer, Release, StuckTransfer, TransferTask,
};
use super::tables::*;
use crate::fingerprint::Fingerprint;

const NEXT_ID: &str = "next_id";

/// Result of a claim pass over the queue.
#[derive(Debug, Default)]
pub struct Claim {
    pub delivery: Option<Delivery>,
    /// Entries whose lease expired one time too many during this pass.
    pub exhausted: Vec<StuckTransfer>,
}

impl Database {
    // ========================================================================
    // Transfer queue
    // ========================================================================

    /// Persist a transfer task. At most one task per fingerprint is queued;
    /// enqueueing again returns the existing id with `false`.
    pub fn enqueue_transfer(
        &self,
        task: &TransferTask,
        now: DateTime<Utc>,
    ) -> Result<(u64, bool), DatabaseError> {
        let fp = task.fingerprint.to_hex();
        let write_txn = self.begin_write()?;

        let outcome = {
            let mut index = write_txn.open_table(QUEUED_FINGERPRINTS)?;
            let existing = index.get(fp.as_str())?.map(|v| v.value());

            match existing {
                Some(id) => (id, false),
                None => {
                    let id = next_queue_id(&write_txn)?;
                    let entry = QueuedTransfer {
                        task: task.clone(),
                        failures: 0,
                        deliveries: 0,
                        available_at: now,
                        leased_until: None,
                        last_error: None,
                    };
                    store_entry(&write_txn, id, &entry, None)?;
                    index.insert(fp.as_str(), id)?;
                    (id, true)
                }
            }
        };

        write_txn.commit()?;
        Ok(outcome)
    }

    /// Lease the earliest due task until `now + lease`.
    ///
    /// Entries are visited in due order through the schedule index, so a
    /// backlog that is backing off costs one lookup. An entry whose previous
    /// lease expired is counted as a failed attempt before being redelivered;
    /// when that reaches `max_attempts` it is moved to the stuck table instead.
    pub fn claim_transfer(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        max_attempts: u32,
    ) -> Result<Claim, DatabaseError> {
        let write_txn = self.begin_write()?;
        let mut claim = Claim::default();

        loop {
            let head = {
                let schedule = write_txn.open_table(TRANSFER_SCHEDULE)?;
                let head = schedule.first()?.map(|(key, _)| key.value());
                head
            };
            let Some((due, id)) = head else { break };
            if due > now.timestamp_millis() {
                break;
            }

            let Some(entry) = load_entry(&write_txn, id)? else {
                write_txn.open_table(TRANSFER_SCHEDULE)?.remove((due, id))?;
                continue;
            };
            if due_at(&entry) > now {
                break;
            }

            let mut next = entry.clone();
            if next.leased_until.is_some() {
                next.failures += 1;
                next.leased_until = None;
                next.last_error = Some("transfer exceeded its in-flight deadline".into());
                if next.failures >= max_attempts {
                    remove_entry(&write_txn, id, &entry)?;
                    claim.exhausted.push(mark_stuck(&write_txn, id, next, now)?);
                    continue;
                }
            }

            next.deliveries += 1;
            next.leased_until = Some(now + lease);
            store_entry(&write_txn, id, &next, Some(&entry))?;

            claim.delivery = Some(Delivery {
                id,
                sequence: next.deliveries,
                attempt: next.failures + 1,
                task: next.task,
            });
            break;
        }

        write_txn.commit()?;
        Ok(claim)
    }

    /// Remove a task after it was fully processed. Returns `false` if the
    /// delivery had been superseded by a redelivery.
    pub fn ack_transfer(&self, delivery: &Delivery) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let acked = match load_entry(&write_txn, delivery.id)? {
            Some(entry) if entry.deliveries == delivery.sequence => {
                remove_entry(&write_txn, delivery.id, &entry)?;
                write_txn
                    .open_table(QUEUED_FINGERPRINTS)?
                    .remove(entry.task.fingerprint.to_hex().as_str())?;
                true
            }
            _ => false,
        };

        write_txn.commit()?;
        Ok(acked)
    }

    /// Record a failed attempt and make the task available again at
    /// `available_at`, or move it to the stuck table once `max_attempts`
    /// failures accumulated.
    ///
    /// `rollback` is applied in the same transaction, and only while the
    /// delivery is current: a stale delivery must not move the record back
    /// under a worker that now owns the task.
    pub fn release_transfer(
        &self,
        delivery: &Delivery,
        error: &str,
        available_at: DateTime<Utc>,
        max_attempts: u32,
        rollback: Option<&LocationRollback>,
    ) -> Result<Release, DatabaseError> {
        let write_txn = self.begin_write()?;

        let release = match load_entry(&write_txn, delivery.id)? {
            Some(entry) if entry.deliveries == delivery.sequence => {
                if let Some(rollback) = rollback {
                    swap_location(
                        &write_txn,
                        &delivery.task.fingerprint,
                        &rollback.expected,
                        rollback.restore.clone(),
                    )?;
                }

                let mut next = entry.clone();
                next.failures += 1;
                next.leased_until = None;
                next.last_error = Some(error.to_string());

                if next.failures >= max_attempts {
                    remove_entry(&write_txn, delivery.id, &entry)?;
                    Release::Exhausted(mark_stuck(&write_txn, delivery.id, next, Utc::now())?)
                } else {
                    next.available_at = available_at;
                    let failures = next.failures;
                    store_entry(&write_txn, delivery.id, &next, Some(&entry))?;
                    Release::Requeued {
                        failures,
                        available_at,
                    }
                }
            }
            _ => Release::Stale,
        };

        write_txn.commit()?;
        Ok(release)
    }

    pub fn is_transfer_queued(&self, fingerprint: &Fingerprint) -> Result<bool, DatabaseError> {
        let read_txn = self.begin_read()?;
        let index = read_txn.open_table(QUEUED_FINGERPRINTS)?;
        Ok(index.get(fingerprint.to_hex().as_str())?.is_some())
    }

    pub fn queued_transfer_count(&self) -> Result<u64, DatabaseError> {
        let read_txn = self.begin_read()?;
        let queue = read_txn.open_table(TRANSFER_QUEUE)?;
        Ok(queue.len()?)
    }

    pub fn get_stuck_transfer(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StuckTransfer>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(STUCK_TRANSFERS)?;

        match table.get(fingerprint.to_hex().as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_stuck_transfers(&self) -> Result<Vec<StuckTransfer>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(STUCK_TRANSFERS)?;

        let mut stuck = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            stuck.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(stuck)
    }

    /// Move a stuck transfer back onto the queue with a fresh attempt budget.
    pub fn requeue_stuck_transfer(
        &self,
        fingerprint: &Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Option<u64>, DatabaseError> {
        let fp = fingerprint.to_hex();
        let write_txn = self.begin_write()?;

        let requeued = {
            let mut stuck_table = write_txn.open_table(STUCK_TRANSFERS)?;
            let stuck: Option<StuckTransfer> = match stuck_table.remove(fp.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match stuck {
                Some(stuck) => {
                    let id = next_queue_id(&write_txn)?;
                    let entry = QueuedTransfer {
                        task: stuck.task,
                        failures: 0,
                        deliveries: 0,
                        available_at: now,
                        leased_until: None,
                        last_error: stuck.last_error,
                    };
                    store_entry(&write_txn, id, &entry, None)?;
                    write_txn
                        .open_table(QUEUED_FINGERPRINTS)?
                        .insert(fp.as_str(), id)?;
                    Some(id)
                }
                None => None,
            }
        };

        write_txn.commit()?;
        Ok(requeued)
    }
}

fn next_queue_id(write_txn: &WriteTransaction) -> Result<u64, DatabaseError> {
    let mut meta = write_txn.open_table(QUEUE_META)?;
    let id = meta.get(NEXT_ID)?.map(|v| v.value()).unwrap_or(1);
    meta.insert(NEXT_ID, id + 1)?;
    Ok(id)
}

fn due_at(entry: &QueuedTransfer) -> DateTime<Utc> {
    entry.leased_until.unwrap_or(entry.available_at)
}

fn schedule_key(id: u64, entry: &QueuedTransfer) -> (i64, u64) {
    (due_at(entry).timestamp_millis(), id)
}

fn load_entry(
    write_txn: &WriteTransaction,
    id: u64,
) -> Result<Option<QueuedTransfer>, DatabaseError> {
    let queue = write_txn.open_table(TRANSFER_QUEUE)?;
    let entry = match queue.get(id)? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };
    Ok(entry)
}

/// Write `entry` and move its schedule row from `previous`'s due time.
fn store_entry(
    write_txn: &WriteTransaction,
    id: u64,
    entry: &QueuedTransfer,
    previous: Option<&QueuedTransfer>,
) -> Result<(), DatabaseError> {
    let data = rmp_serde::to_vec_named(entry)?;
    write_txn
        .open_table(TRANSFER_QUEUE)?
        .insert(id, data.as_slice())?;

    let mut schedule = write_txn.open_table(TRANSFER_SCHEDULE)?;
    if let Some(previous) = previous {
        schedule.remove(schedule_key(id, previous))?;
    }
    schedule.insert(schedule_key(id, entry), ())?;
    Ok(())
}

fn remove_entry(
    write_txn: &WriteTransaction,
    id: u64,
    entry: &QueuedTransfer,
) -> Result<(), DatabaseError> {
    write_txn.open_table(TRANSFER_QUEUE)?.remove(id)?;
    write_txn
        .open_table(TRANSFER_SCHEDULE)?
        .remove(schedule_key(id, entry))?;
    Ok(())
}

/// Record `entry` as stuck and drop its fingerprint from the queued index.
/// The caller removes the queue row itself.
fn mark_stuck(
    write_txn: &WriteTransaction,
    id: u64,
    entry: QueuedTransfer,
    now: DateTime<Utc>,
) -> Result<StuckTransfer, DatabaseError> {
    let fp = entry.task.fingerprint.to_hex();
    let stuck = StuckTransfer {
        task: entry.task,
        failures: entry.failures,
        last_error: entry.last_error,
        stuck_at: now,
    };

    let data = rmp_serde::to_vec_named(&stuck)?;
    write_txn
        .open_table(STUCK_TRANSFERS)?
        .insert(fp.as_str(), data.as_slice())?;

    let mut index = write_txn.open_table(QUEUED_FINGERPRINTS)?;
    if index.get(fp.as_str())?.map(|v| v.value()) == Some(id) {
        index.remove(fp.as_str())?;
    }
    Ok(stuck)
}
