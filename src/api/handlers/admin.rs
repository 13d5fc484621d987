use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, JSend};
use crate::fingerprint::Fingerprint;
use crate::storage::models::{BackendKind, StuckTransfer};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub node_id: String,
    pub status: String,
    pub tier_target: Option<BackendKind>,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct TransferStatusResponse {
    pub queue_depth: u64,
    pub stuck: Vec<StuckTransferResponse>,
}

#[derive(Debug, Serialize)]
pub struct StuckTransferResponse {
    pub dest_backend: BackendKind,
    pub failures: u32,
    pub fingerprint: String,
    pub last_error: Option<String>,
    pub stuck_at: String,
}

#[derive(Debug, Serialize)]
pub struct RequeueResponse {
    pub fingerprint: String,
    pub requeued: bool,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn health(State(state): State<Arc<AppState>>) -> Json<JSend<HealthResponse>> {
    JSend::success(HealthResponse {
        node_id: state.config.node.id.clone(),
        status: "ok".to_string(),
        tier_target: state.config.tiering.target,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Route: GET /_internal/transfers
pub async fn transfer_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<TransferStatusResponse>>, ApiError> {
    let queue_depth = state
        .queue
        .depth()
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    let stuck = state
        .queue
        .stuck()
        .map_err(|e| ApiError::unavailable(e.to_string()))?
        .iter()
        .map(stuck_response)
        .collect();

    Ok(JSend::success(TransferStatusResponse { queue_depth, stuck }))
}

/// Route: POST /_internal/transfers/:fingerprint/requeue
pub async fn requeue_transfer(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<JSend<RequeueResponse>>, ApiError> {
    let fingerprint =
        Fingerprint::from_hex(&fingerprint).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let requeued = state
        .queue
        .requeue_stuck(&fingerprint)
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    if !requeued {
        return Err(ApiError::not_found("No stuck transfer for this fingerprint"));
    }

    Ok(JSend::success(RequeueResponse {
        fingerprint: fingerprint.to_hex(),
        requeued,
    }))
}

fn stuck_response(stuck: &StuckTransfer) -> StuckTransferResponse {
    StuckTransferResponse {
        dest_backend: stuck.task.dest_backend,
        failures: stuck.failures,
        fingerprint: stuck.task.fingerprint.to_hex(),
        last_error: stuck.last_error.clone(),
        stuck_at: stuck.stuck_at.to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use crate::testutil::test_state;

    #[tokio::test]
    async fn test_transfer_status_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let Json(response) = transfer_status(State(state)).await.unwrap();
        assert_eq!(response.data.queue_depth, 0);
        assert!(response.data.stuck.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_unknown_fingerprint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let result = requeue_transfer(State(state), Path(Fingerprint::of(b"x").to_hex())).await;
        assert!(matches!(result, Err(ref e) if e.status == StatusCode::NOT_FOUND));
    }
}
