#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use file_store::config::{
    Config, NodeConfig, StageConfig, StorageConfig, TieringConfig, TransferMode,
};
use file_store::error::StoreError;
use file_store::object_store::{Backends, LocalStore, ObjectStore, ObjectStoreError};
use file_store::storage::models::BackendKind;
use file_store::storage::Database;
use file_store::tiering::TransferOutcome;
use file_store::AppState;

/// In-memory backend that fails the next `n` puts on demand and counts
/// every put it receives.
#[derive(Default)]
pub struct FlakyStore {
    objects: Mutex<HashMap<String, Bytes>>,
    puts: AtomicUsize,
    failing_puts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_puts(&self, n: usize) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ObjectStoreError::Backend("injected put failure".to_string()));
        }
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.object(key)
            .ok_or_else(|| ObjectStoreError::NotFound(key.to_string()))
    }
}

/// Backend whose puts never complete, for exercising the in-flight deadline.
#[derive(Default)]
pub struct HangingStore;

#[async_trait]
impl ObjectStore for HangingStore {
    async fn put(&self, _key: &str, _data: Bytes) -> Result<(), ObjectStoreError> {
        std::future::pending().await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        Err(ObjectStoreError::NotFound(key.to_string()))
    }
}

/// Backend that hands out signed URLs for objects held by an inner store.
pub struct SigningStore {
    pub inner: FlakyStore,
    pub fail_signing: bool,
}

impl SigningStore {
    pub fn new() -> Self {
        Self {
            inner: FlakyStore::new(),
            fail_signing: false,
        }
    }
}

#[async_trait]
impl ObjectStore for SigningStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(key).await
    }

    fn supports_signed_urls(&self) -> bool {
        true
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<Option<String>, ObjectStoreError> {
        if self.fail_signing {
            return Err(ObjectStoreError::Backend("signing key unavailable".to_string()));
        }
        Ok(Some(format!(
            "https://signed.test/{key}?expires_in={}",
            ttl.as_secs()
        )))
    }
}

/// Tiering towards the in-memory remote, with immediate retries.
pub fn tiering(mode: TransferMode) -> TieringConfig {
    TieringConfig {
        target: Some(BackendKind::Gcs),
        mode,
        workers: 2,
        max_attempts: 3,
        retry_base_delay: Duration::ZERO,
        retry_max_delay: Duration::ZERO,
        transfer_timeout: Duration::from_secs(30),
        poll_interval: Duration::from_millis(20),
        signed_url_ttl: Duration::from_secs(600),
    }
}

/// A complete service core over temporary directories. The remote tier
/// (registered as `gcs`) is a [`FlakyStore`].
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub state: Arc<AppState>,
    pub remote: Arc<FlakyStore>,
}

impl Harness {
    pub fn new(tiering: TieringConfig) -> Self {
        let remote = Arc::new(FlakyStore::new());
        let (dir, state) = build_state(tiering, remote.clone());
        Self { dir, state, remote }
    }

    /// Claim and process one queued transfer, if any is available.
    pub async fn run_one(&self) -> Option<Result<TransferOutcome, StoreError>> {
        let delivery = self.state.queue.try_claim().unwrap()?;
        Some(self.state.tier.process(&delivery).await)
    }

    /// Committed blobs in the stage.
    pub fn committed_blobs(&self) -> usize {
        count_entries(&self.dir.path().join("stage").join("blobs"))
    }

    /// Uploads still being written to the stage.
    pub fn pending_uploads(&self) -> usize {
        count_entries(&self.dir.path().join("stage").join("tmp"))
    }

    /// Process available transfers until the queue yields nothing, bounded by
    /// `limit` deliveries.
    pub async fn drain(&self, limit: usize) -> Vec<Result<TransferOutcome, StoreError>> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            match self.run_one().await {
                Some(outcome) => outcomes.push(outcome),
                None => break,
            }
        }
        outcomes
    }
}

fn count_entries(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir).unwrap().count()
}

pub fn build_state(
    tiering: TieringConfig,
    remote: Arc<dyn ObjectStore>,
) -> (tempfile::TempDir, Arc<AppState>) {
    let dir = tempfile::tempdir().unwrap();
    let data_dir = dir.path().join("data");
    let remote_dir = dir.path().join("remote");

    let config = Config {
        node: NodeConfig {
            id: "test-node".to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        stage: StageConfig {
            path: dir.path().join("stage").to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            disk_path: remote_dir.to_string_lossy().to_string(),
            ..StorageConfig::default()
        },
        tiering,
        max_upload_size: 1024 * 1024,
        reconcile_interval: Duration::from_secs(60),
    };

    let db = Database::open(&data_dir).unwrap();
    let backends = Backends::new()
        .with(BackendKind::Disk, Arc::new(LocalStore::new(&remote_dir).unwrap()))
        .with(BackendKind::Gcs, remote);

    let state = Arc::new(AppState::new(config, db, backends).unwrap());
    (dir, state)
}
