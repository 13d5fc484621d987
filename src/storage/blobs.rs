use chrono::Utc;
use redb::{ReadableTable, WriteTransaction};

use super::db::{Database, DatabaseError};
use super::models::{BlobLocation, BlobRecord, LocationUpdate};
use super::tables::*;
use crate::fingerprint::Fingerprint;

impl Database {
    // ========================================================================
    // Blob index
    // ========================================================================

    /// Look up the canonical record for a fingerprint.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<BlobRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(BLOBS)?;

        match table.get(fingerprint.to_hex().as_str())? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    /// Create the record for `fingerprint` unless one already exists.
    ///
    /// Returns the stored record and whether this call created it. Concurrent
    /// callers racing on the same fingerprint observe exactly one `true`.
    pub fn create_if_absent(
        &self,
        fingerprint: &Fingerprint,
        size: u64,
        initial_location: BlobLocation,
    ) -> Result<(BlobRecord, bool), DatabaseError> {
        let key = fingerprint.to_hex();
        let write_txn = self.begin_write()?;

        let outcome = {
            let mut table = write_txn.open_table(BLOBS)?;
            let existing: Option<BlobRecord> = match table.get(key.as_str())? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(record) => (record, false),
                None => {
                    let record = BlobRecord {
                        fingerprint: *fingerprint,
                        size,
                        location: initial_location,
                        created_at: Utc::now(),
                    };
                    let data = rmp_serde::to_vec_named(&record)?;
                    table.insert(key.as_str(), data.as_slice())?;
                    (record, true)
                }
            }
        };

        write_txn.commit()?;
        Ok(outcome)
    }

    /// Conditionally replace a record's location.
    ///
    /// Applies only when the stored location equals `expected` and the move
    /// is a legal transition; otherwise nothing is written.
    pub fn update_location(
        &self,
        fingerprint: &Fingerprint,
        expected: &BlobLocation,
        new_location: BlobLocation,
    ) -> Result<LocationUpdate, DatabaseError> {
        let write_txn = self.begin_write()?;
        let outcome = swap_location(&write_txn, fingerprint, expected, new_location)?;

        match outcome {
            LocationUpdate::Applied(_) => write_txn.commit()?,
            _ => write_txn.abort()?,
        }
        Ok(outcome)
    }

    /// All blob records, in fingerprint order.
    pub fn all_blobs(&self) -> Result<Vec<BlobRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(BLOBS)?;

        let mut blobs = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            blobs.push(rmp_serde::from_slice(value.value())?);
        }
        Ok(blobs)
    }
}

/// Compare-and-swap of a record's location inside `write_txn`. The caller
/// decides whether to commit.
pub(super) fn swap_location(
    write_txn: &WriteTransaction,
    fingerprint: &Fingerprint,
    expected: &BlobLocation,
    new_location: BlobLocation,
) -> Result<LocationUpdate, DatabaseError> {
    let key = fingerprint.to_hex();
    let mut table = write_txn.open_table(BLOBS)?;
    let existing: Option<BlobRecord> = match table.get(key.as_str())? {
        Some(data) => Some(rmp_serde::from_slice(data.value())?),
        None => None,
    };

    let outcome = match existing {
        None => LocationUpdate::Conflict { current: None },
        Some(record) if record.location != *expected => LocationUpdate::Conflict {
            current: Some(record.location),
        },
        Some(record) if !record.location.permits(&new_location) => LocationUpdate::Rejected {
            current: record.location,
        },
        Some(mut record) => {
            record.location = new_location;
            let data = rmp_serde::to_vec_named(&record)?;
            table.insert(key.as_str(), data.as_slice())?;
            LocationUpdate::Applied(record)
        }
    };
    Ok(outcome)
}
