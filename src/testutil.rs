//! Shared test helpers for handler unit tests.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, NodeConfig, StageConfig, StorageConfig, TieringConfig};
use crate::object_store::{Backends, LocalStore};
use crate::storage::models::BackendKind;
use crate::storage::Database;
use crate::AppState;

/// Create a test AppState with a temporary database, stage and disk backend.
/// Nothing is tiered.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    test_state_with(temp_dir, TieringConfig::default())
}

pub fn test_state_with(temp_dir: &tempfile::TempDir, tiering: TieringConfig) -> Arc<AppState> {
    let data_dir = temp_dir.path().join("data");
    let stage_dir = temp_dir.path().join("stage");
    let remote_dir = temp_dir.path().join("remote");

    let config = Config {
        node: NodeConfig {
            id: uuid::Uuid::new_v4().to_string(),
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        stage: StageConfig {
            path: stage_dir.to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            disk_path: remote_dir.to_string_lossy().to_string(),
            ..StorageConfig::default()
        },
        tiering,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
        reconcile_interval: Duration::from_secs(60),
    };

    let db = Database::open(&data_dir).expect("Failed to open test database");
    let disk = LocalStore::new(&remote_dir).expect("Failed to create test disk backend");
    let backends = Backends::new().with(BackendKind::Disk, Arc::new(disk));

    Arc::new(AppState::new(config, db, backends).expect("Failed to build test state"))
}
