//! file-store - Content-addressed file storage with tiering to remote backends
//!
//! This crate provides deduplicated uploads and location-aware downloads with:
//! - SHA-256 content fingerprints as blob identity
//! - A local staging tier and swappable remote backends (disk, GCS, S3)
//! - redb embedded database for metadata and the durable transfer queue
//! - Background transfer workers with bounded retry and reconciliation
//! - REST API with streaming multipart upload

pub mod api;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod object_store;
pub mod queue;
pub mod resolve;
pub mod stage;
pub mod storage;
pub mod tiering;
pub mod upload;
#[cfg(test)]
pub mod testutil;

use std::sync::Arc;

use config::Config;
use object_store::Backends;
use queue::{RetryPolicy, TransferQueue};
use resolve::LocationResolver;
use stage::LocalStage;
use storage::Database;
use tiering::TierManager;
use upload::Uploader;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub stage: Arc<LocalStage>,
    pub backends: Backends,
    pub queue: TransferQueue,
    pub tier: Arc<TierManager>,
    pub uploader: Uploader,
    pub resolver: LocationResolver,
}

impl AppState {
    /// Wire the core components over an opened database and backend registry.
    pub fn new(config: Config, db: Database, backends: Backends) -> Result<Self, std::io::Error> {
        let stage = Arc::new(LocalStage::open(&config.stage.path)?);
        let queue = TransferQueue::new(
            db.clone(),
            RetryPolicy::from(&config.tiering),
            config.tiering.transfer_timeout,
        );
        let tier = Arc::new(TierManager::new(
            config.tiering.clone(),
            db.clone(),
            Arc::clone(&stage),
            backends.clone(),
            queue.clone(),
        ));
        let uploader = Uploader::new(db.clone(), Arc::clone(&stage), Arc::clone(&tier));
        let resolver = LocationResolver::new(backends.clone(), config.tiering.signed_url_ttl);

        Ok(Self {
            config,
            db,
            stage,
            backends,
            queue,
            tier,
            uploader,
            resolver,
        })
    }
}
