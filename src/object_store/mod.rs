mod gcs;
mod local;
mod s3;

pub use gcs::GcsStore;
pub use local::LocalStore;
pub use s3::S3Store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::storage::models::BackendKind;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Capability set of a remote tier. Keys are content fingerprints, so a put
/// of an existing key rewrites identical bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;

    /// Whether [`ObjectStore::signed_url`] can produce URLs clients fetch
    /// directly.
    fn supports_signed_urls(&self) -> bool {
        false
    }

    /// Time-limited URL for reading `key` without going through this service.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<Option<String>, ObjectStoreError> {
        let _ = (key, ttl);
        Ok(None)
    }
}

/// Configured backends, looked up by the kind recorded in blob locations.
#[derive(Clone, Default)]
pub struct Backends {
    stores: HashMap<BackendKind, Arc<dyn ObjectStore>>,
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: BackendKind, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(kind, store);
        self
    }

    pub fn insert(&mut self, kind: BackendKind, store: Arc<dyn ObjectStore>) {
        self.stores.insert(kind, store);
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn ObjectStore>, ObjectStoreError> {
        self.stores
            .get(&kind)
            .cloned()
            .ok_or_else(|| ObjectStoreError::Backend(format!("backend '{kind}' is not configured")))
    }
}
