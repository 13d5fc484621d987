//! Upload ingestion: stage, fingerprint, deduplicate, link.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::stage::{LocalStage, StagedUpload};
use crate::storage::models::{BlobLocation, BlobRecord, UserFileLink};
use crate::storage::Database;
use crate::tiering::TierManager;

#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub fingerprint: Fingerprint,
    pub size: u64,
    /// The content was already known; no bytes were committed for this upload.
    pub deduplicated: bool,
    pub location: BlobLocation,
    /// `false` when the owner already had this exact file name linked.
    pub link_created: bool,
}

pub struct Uploader {
    db: Database,
    stage: Arc<LocalStage>,
    tier: Arc<TierManager>,
}

impl Uploader {
    pub fn new(db: Database, stage: Arc<LocalStage>, tier: Arc<TierManager>) -> Self {
        Self { db, stage, tier }
    }

    /// Open a private staging file for a new upload.
    pub async fn begin(&self) -> Result<StagedUpload, StoreError> {
        Ok(self.stage.begin().await?)
    }

    /// Finish a fully streamed upload.
    ///
    /// Content is renamed into place before the index record is created, so a
    /// record never points at partial bytes. When the fingerprint is already
    /// known (before staging, or because a concurrent uploader won the
    /// create), the upload is linked to the existing record and nothing is
    /// tiered.
    pub async fn complete(
        &self,
        owner: &str,
        file_name: &str,
        upload: StagedUpload,
    ) -> Result<UploadReceipt, StoreError> {
        let sealed = upload.seal().await?;
        let fingerprint = sealed.fingerprint;
        let size = sealed.size;

        if let Some(existing) = self.db.lookup(&fingerprint)? {
            if let Err(e) = sealed.discard() {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to remove staged duplicate");
            }
            tracing::debug!(fingerprint = %fingerprint, owner, "Deduplicated upload");
            return self.link(owner, file_name, existing, true);
        }

        let path = self.stage.promote(sealed)?;
        let (record, created) =
            self.db
                .create_if_absent(&fingerprint, size, BlobLocation::Local { path })?;

        if !created {
            tracing::debug!(fingerprint = %fingerprint, owner, "Lost create race; linking existing blob");
            return self.link(owner, file_name, record, true);
        }

        tracing::info!(fingerprint = %fingerprint, size, owner, "Stored new blob");
        let record = self.tier.place_new_blob(record).await?;
        self.link(owner, file_name, record, false)
    }

    /// Upload an in-memory buffer.
    pub async fn upload_bytes(
        &self,
        owner: &str,
        file_name: &str,
        data: &[u8],
    ) -> Result<UploadReceipt, StoreError> {
        let mut upload = self.begin().await?;
        upload.write(data).await?;
        self.complete(owner, file_name, upload).await
    }

    /// Link already-known content without receiving any bytes.
    pub fn fast_upload(
        &self,
        owner: &str,
        fingerprint: &Fingerprint,
        file_name: &str,
    ) -> Result<UploadReceipt, StoreError> {
        let record = self
            .db
            .lookup(fingerprint)?
            .ok_or_else(|| StoreError::unknown_blob(fingerprint))?;
        self.link(owner, file_name, record, true)
    }

    fn link(
        &self,
        owner: &str,
        file_name: &str,
        record: BlobRecord,
        deduplicated: bool,
    ) -> Result<UploadReceipt, StoreError> {
        let link_created = self.db.link_user_file(&UserFileLink {
            owner: owner.to_string(),
            file_name: file_name.to_string(),
            fingerprint: record.fingerprint,
            size: record.size,
            linked_at: Utc::now(),
        })?;

        Ok(UploadReceipt {
            fingerprint: record.fingerprint,
            size: record.size,
            deduplicated,
            location: record.location,
            link_created,
        })
    }
}
