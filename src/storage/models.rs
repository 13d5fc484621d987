use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;

/// Remote backend families a blob can be tiered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Directory on a local or mounted disk standing in for an object store.
    Disk,
    Gcs,
    S3,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Disk => "disk",
            BackendKind::Gcs => "gcs",
            BackendKind::S3 => "s3",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disk" => Some(BackendKind::Disk),
            "gcs" => Some(BackendKind::Gcs),
            "s3" => Some(BackendKind::S3),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A place where a complete copy of a blob's bytes physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Placement {
    Local { path: PathBuf },
    Remote { backend: BackendKind, key: String },
}

/// Where a blob currently lives, as tracked by the metadata index.
///
/// Allowed transitions:
/// - `Local -> PendingTransfer -> Remote` (asynchronous tiering)
/// - `Local -> Remote` (synchronous tiering)
/// - `PendingTransfer -> <its source>` (transfer failed, eligible for retry)
/// - `Remote -> PendingTransfer` (move between remote backends)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobLocation {
    Local {
        path: PathBuf,
    },
    Remote {
        backend: BackendKind,
        key: String,
    },
    PendingTransfer {
        from: Placement,
        to_backend: BackendKind,
        to_key: String,
    },
}

impl BlobLocation {
    /// The placement reads should be served from. During a transfer the
    /// source stays authoritative.
    pub fn readable_placement(&self) -> Placement {
        match self {
            BlobLocation::Local { path } => Placement::Local { path: path.clone() },
            BlobLocation::Remote { backend, key } => Placement::Remote {
                backend: *backend,
                key: key.clone(),
            },
            BlobLocation::PendingTransfer { from, .. } => from.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, BlobLocation::Remote { .. })
    }

    /// Whether the location state machine permits moving from `self` to `next`.
    pub fn permits(&self, next: &BlobLocation) -> bool {
        match (self, next) {
            (BlobLocation::Local { .. }, BlobLocation::Local { .. }) => false,
            (BlobLocation::Local { .. }, _) => true,
            (BlobLocation::PendingTransfer { from, .. }, next) => match next {
                BlobLocation::Remote { .. } => true,
                BlobLocation::PendingTransfer { .. } => false,
                other => BlobLocation::from(from.clone()) == *other,
            },
            (BlobLocation::Remote { .. }, BlobLocation::PendingTransfer { from, .. }) => {
                matches!(from, Placement::Remote { .. })
            }
            (BlobLocation::Remote { .. }, _) => false,
        }
    }
}

impl From<Placement> for BlobLocation {
    fn from(placement: Placement) -> Self {
        match placement {
            Placement::Local { path } => BlobLocation::Local { path },
            Placement::Remote { backend, key } => BlobLocation::Remote { backend, key },
        }
    }
}

/// Canonical record for one distinct piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub location: BlobLocation,
    pub created_at: DateTime<Utc>,
}

/// A user-visible name for a blob, owned by one identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserFileLink {
    pub owner: String,
    pub file_name: String,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub linked_at: DateTime<Utc>,
}

/// Request to move a blob's bytes from `source` to a remote backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub fingerprint: Fingerprint,
    pub source: Placement,
    pub dest_backend: BackendKind,
    pub dest_key: String,
    pub enqueued_at: DateTime<Utc>,
}

/// Queue entry wrapping a transfer task with its delivery bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub task: TransferTask,
    /// Failed attempts so far
    pub failures: u32,
    /// Incremented on every delivery; acks from older deliveries are ignored
    pub deliveries: u64,
    pub available_at: DateTime<Utc>,
    #[serde(default)]
    pub leased_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// A transfer that exhausted its retries and needs operator attention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckTransfer {
    pub task: TransferTask,
    pub failures: u32,
    pub last_error: Option<String>,
    pub stuck_at: DateTime<Utc>,
}

/// A leased queue entry handed to a transfer worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub sequence: u64,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
    pub task: TransferTask,
}

/// Result of a conditional location update.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationUpdate {
    Applied(BlobRecord),
    /// The stored location no longer matched the expected prior value.
    Conflict { current: Option<BlobLocation> },
    /// The expected prior value matched but the state machine forbids the move.
    Rejected { current: BlobLocation },
}

/// Outcome of handing a failed delivery back to the queue.
#[derive(Debug, Clone)]
pub enum Release {
    Requeued { failures: u32, available_at: DateTime<Utc> },
    Exhausted(StuckTransfer),
    /// The delivery had already been superseded by a redelivery.
    Stale,
}

/// Location change applied atomically with a release, and only when the
/// released delivery is still the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRollback {
    pub expected: BlobLocation,
    pub restore: BlobLocation,
}
