use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

/// Headroom for multipart boundaries and the non-file fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn create_router(state: Arc<AppState>) -> Router {
    // The handler enforces the exact file size while streaming
    let body_limit = (state.config.max_upload_size as usize).saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        // Files
        .route(
            "/files",
            post(handlers::upload_file).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/files/fast", post(handlers::fast_upload))
        .route("/files/:fingerprint/download", get(handlers::download_file))
        .route("/files/:fingerprint/url", get(handlers::download_url))
        // Blobs
        .route("/blobs/:fingerprint", get(handlers::get_blob))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .route("/_internal/transfers", get(handlers::transfer_status))
        .route(
            "/_internal/transfers/:fingerprint/requeue",
            post(handlers::requeue_transfer),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
