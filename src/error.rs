use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::object_store::ObjectStoreError;
use crate::storage::DatabaseError;

/// Failure kinds surfaced by the storage core.
///
/// Lost optimistic races are not errors: conditional updates report them as
/// [`crate::storage::models::LocationUpdate::Conflict`] and the component that
/// receives one re-reads state instead of propagating it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("Transfer retries exhausted for {0}")]
    Exhausted(Fingerprint),
    /// The metadata index could not be read or written. Never treated as
    /// "not found"; callers may retry.
    #[error("Metadata index unavailable: {0}")]
    Index(#[from] DatabaseError),
}

impl StoreError {
    pub fn unknown_blob(fingerprint: &Fingerprint) -> Self {
        StoreError::NotFound(format!("blob {fingerprint}"))
    }

    /// Whether the same request may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io(_) | StoreError::BackendUnavailable(_) | StoreError::Index(_)
        )
    }
}

impl From<ObjectStoreError> for StoreError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::Io(e) => StoreError::Io(e),
            ObjectStoreError::NotFound(key) => StoreError::NotFound(format!("object {key}")),
            ObjectStoreError::Backend(msg) => StoreError::BackendUnavailable(msg),
        }
    }
}
