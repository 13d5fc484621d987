use std::time::Duration;

use thiserror::Error;

use crate::storage::models::BackendKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub stage: StageConfig,
    pub storage: StorageConfig,
    pub tiering: TieringConfig,
    /// Maximum upload size in bytes
    pub max_upload_size: u64,
    /// How often the tier manager re-scans the index for untracked transfers
    pub reconcile_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Root of the local staging area (temporary uploads and committed blobs)
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory backing the `disk` backend
    pub disk_path: String,
    /// GCS bucket name (required when the tier target is gcs)
    pub gcs_bucket: Option<String>,
    /// Path to GCS service account JSON (optional, defaults to ADC; needed for signed URLs)
    pub gcs_credentials_file: Option<String>,
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Copy to the remote tier before acknowledging the upload.
    Sync,
    /// Acknowledge once staged locally and hand the copy to transfer workers.
    Async,
}

/// Tiering policy handed to a [`crate::tiering::TierManager`] at construction.
#[derive(Debug, Clone)]
pub struct TieringConfig {
    /// Backend new blobs are moved to; `None` keeps everything local.
    pub target: Option<BackendKind>,
    pub mode: TransferMode,
    pub workers: usize,
    /// Total delivery attempts before a transfer is reported stuck
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Maximum in-flight duration of a single transfer attempt
    pub transfer_timeout: Duration,
    /// Idle workers re-check the queue at least this often
    pub poll_interval: Duration,
    pub signed_url_ttl: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            path: "./stage".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            disk_path: "./remote".to_string(),
            gcs_bucket: None,
            gcs_credentials_file: None,
            s3: None,
        }
    }
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            target: None,
            mode: TransferMode::Async,
            workers: 4,
            max_attempts: 5,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(300),
            transfer_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(1),
            signed_url_ttl: Duration::from_secs(3600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let node_id = std::env::var("NODE_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let stage_path = std::env::var("STAGE_DIR").unwrap_or_else(|_| "./stage".to_string());

        let max_upload_size = env_parse("MAX_UPLOAD_SIZE").unwrap_or(50 * 1024 * 1024); // 50MB

        let target = match std::env::var("TIER_TARGET")
            .unwrap_or_else(|_| "none".to_string())
            .to_lowercase()
            .as_str()
        {
            "" | "none" | "local" => None,
            other => Some(BackendKind::parse(other).ok_or_else(|| {
                ConfigError::ValidationError(format!(
                    "TIER_TARGET must be one of none, disk, gcs, s3 (got '{other}')"
                ))
            })?),
        };

        let mode = if env_flag("ASYNC_TRANSFER").unwrap_or(true) {
            TransferMode::Async
        } else {
            TransferMode::Sync
        };

        let defaults = TieringConfig::default();
        let tiering = TieringConfig {
            target,
            mode,
            workers: env_parse("TRANSFER_WORKERS").unwrap_or(defaults.workers),
            max_attempts: env_parse("TRANSFER_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            retry_base_delay: env_parse("TRANSFER_RETRY_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_parse("TRANSFER_RETRY_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            transfer_timeout: env_parse("TRANSFER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.transfer_timeout),
            poll_interval: env_parse("TRANSFER_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            signed_url_ttl: env_parse("SIGNED_URL_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.signed_url_ttl),
        };

        let s3 = std::env::var("S3_BUCKET").ok().map(|bucket| S3Config {
            bucket,
            region: std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
        });

        let config = Config {
            node: NodeConfig {
                id: node_id,
                bind_address,
                data_dir,
            },
            stage: StageConfig { path: stage_path },
            storage: StorageConfig {
                disk_path: std::env::var("DISK_BACKEND_PATH")
                    .unwrap_or_else(|_| "./remote".to_string()),
                gcs_bucket: std::env::var("GCS_BUCKET").ok(),
                gcs_credentials_file: std::env::var("GCS_CREDENTIALS_FILE").ok(),
                s3,
            },
            tiering,
            max_upload_size,
            reconcile_interval: env_parse("RECONCILE_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(300)),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.id.is_empty() {
            return Err(ConfigError::ValidationError(
                "NODE_ID cannot be empty".to_string(),
            ));
        }

        match self.tiering.target {
            Some(BackendKind::Gcs) if self.storage.gcs_bucket.is_none() => {
                return Err(ConfigError::ValidationError(
                    "GCS_BUCKET is required when TIER_TARGET=gcs".to_string(),
                ));
            }
            Some(BackendKind::S3) if self.storage.s3.is_none() => {
                return Err(ConfigError::ValidationError(
                    "S3_BUCKET is required when TIER_TARGET=s3".to_string(),
                ));
            }
            _ => {}
        }

        if self.tiering.workers == 0 {
            return Err(ConfigError::ValidationError(
                "TRANSFER_WORKERS must be at least 1".to_string(),
            ));
        }

        if self.tiering.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "TRANSFER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.tiering.target.is_some() && self.tiering.mode == TransferMode::Sync {
            tracing::info!("Synchronous tiering enabled: uploads wait for the remote copy");
        }

        Ok(())
    }

    /// Backends that must be constructed: the tier target plus any backend
    /// with configuration present, so records tiered under an earlier
    /// target stay readable.
    pub fn enabled_backends(&self) -> Vec<BackendKind> {
        let mut kinds = vec![BackendKind::Disk];
        if self.storage.gcs_bucket.is_some() {
            kinds.push(BackendKind::Gcs);
        }
        if self.storage.s3.is_some() {
            kinds.push(BackendKind::S3);
        }
        kinds
    }
}
