use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::io::ReaderStream;

use crate::api::response::{ApiError, AppJson, AppQuery, JSend};
use crate::fingerprint::Fingerprint;
use crate::resolve::DeliveryPlan;
use crate::storage::models::{BackendKind, BlobLocation, BlobRecord, UserFileLink};
use crate::upload::UploadReceipt;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

/// Location as exposed to clients; local paths stay internal.
#[derive(Debug, Serialize)]
pub struct LocationResponse {
    pub state: &'static str,
    pub backend: Option<BackendKind>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub deduplicated: bool,
    pub fingerprint: String,
    pub link_created: bool,
    pub location: LocationResponse,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct BlobResponse {
    pub created_at: String,
    pub fingerprint: String,
    pub link_count: usize,
    pub location: LocationResponse,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct DownloadUrlResponse {
    pub file_name: String,
    pub signed: bool,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct FastUploadRequest {
    pub owner: String,
    pub fingerprint: String,
    pub file_name: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DownloadParams {
    pub owner: String,
    /// One of the owner's names for the content; defaults to the latest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Route: POST /files (multipart: `owner`, `file`)
pub async fn upload_file(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let max_size = state.config.max_upload_size;
    let mut owner: Option<String> = None;
    let mut staged = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "owner" => {
                owner = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid owner: {e}")))?,
                );
            }
            "file" => {
                let file_name = field
                    .file_name()
                    .map(|s| s.to_string())
                    .ok_or_else(|| ApiError::bad_request("file field must carry a filename"))?;

                // Dropping the upload on any early return removes the partial file.
                let mut upload = state.uploader.begin().await?;
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?
                {
                    if upload.len() + chunk.len() as u64 > max_size {
                        return Err(ApiError::payload_too_large(format!(
                            "File exceeds maximum upload size of {max_size} bytes"
                        )));
                    }
                    upload.write(&chunk).await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to stage upload");
                        ApiError::internal(format!("Failed to stage upload: {e}"))
                    })?;
                }
                staged = Some((file_name, upload));
            }
            _ => {}
        }
    }

    let owner = validate_owner(owner.as_deref().unwrap_or(""))?;
    let (file_name, upload) = staged.ok_or_else(|| ApiError::bad_request("file is required"))?;

    let receipt = state.uploader.complete(owner, &file_name, upload).await?;
    Ok(JSend::success(upload_response(receipt)))
}

/// Route: POST /files/fast
pub async fn fast_upload(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<FastUploadRequest>,
) -> Result<Json<JSend<UploadResponse>>, ApiError> {
    let owner = validate_owner(&req.owner)?;
    if req.file_name.trim().is_empty() {
        return Err(ApiError::bad_request("file_name must not be empty"));
    }
    let fingerprint = parse_fingerprint(&req.fingerprint)?;

    let receipt = state
        .uploader
        .fast_upload(owner, &fingerprint, &req.file_name)?;
    Ok(JSend::success(upload_response(receipt)))
}

/// Route: GET /blobs/:fingerprint
pub async fn get_blob(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
) -> Result<Json<JSend<BlobResponse>>, ApiError> {
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let record = state
        .db
        .lookup(&fingerprint)
        .map_err(|e| ApiError::unavailable(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("Blob not found"))?;
    let link_count = state
        .db
        .links_to(&fingerprint)
        .map_err(|e| ApiError::unavailable(e.to_string()))?
        .len();

    Ok(JSend::success(blob_response(&record, link_count)))
}

/// Route: GET /files/:fingerprint/download?owner=&name=
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
    AppQuery(params): AppQuery<DownloadParams>,
) -> Result<Response, ApiError> {
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let (link, plan) = state
        .resolver
        .plan_download(&state.db, &params.owner, &fingerprint, params.name.as_deref())
        .await?;

    let response = match plan {
        DeliveryPlan::RedirectSignedUrl { url } => Redirect::temporary(&url).into_response(),
        DeliveryPlan::StreamLocalFile { path, display_name } => {
            let file = tokio::fs::File::open(&path).await.map_err(|e| {
                tracing::error!(fingerprint = %fingerprint, path = %path.display(), error = %e, "Staged blob unreadable");
                ApiError::internal("Failed to open file content")
            })?;
            let body = Body::from_stream(ReaderStream::new(file));
            content_response(body, &display_name, &link)
        }
        DeliveryPlan::ProxyRemoteFetch {
            backend,
            key,
            display_name,
        } => {
            let data: Bytes = state.resolver.fetch_remote(backend, &key).await?;
            content_response(Body::from(data), &display_name, &link)
        }
    };

    Ok(response)
}

/// Route: GET /files/:fingerprint/url?owner=&name=
pub async fn download_url(
    State(state): State<Arc<AppState>>,
    Path(fingerprint): Path<String>,
    AppQuery(params): AppQuery<DownloadParams>,
) -> Result<Json<JSend<DownloadUrlResponse>>, ApiError> {
    let fingerprint = parse_fingerprint(&fingerprint)?;
    let (link, plan) = state
        .resolver
        .plan_download(&state.db, &params.owner, &fingerprint, params.name.as_deref())
        .await?;

    let response = match plan {
        DeliveryPlan::RedirectSignedUrl { url } => DownloadUrlResponse {
            file_name: link.file_name,
            signed: true,
            url,
        },
        _ => {
            let params = DownloadParams {
                owner: params.owner,
                name: Some(link.file_name.clone()),
            };
            let query = serde_qs::to_string(&params)
                .map_err(|e| ApiError::internal(format!("Failed to encode query: {e}")))?;
            DownloadUrlResponse {
                file_name: link.file_name,
                signed: false,
                url: format!("/files/{fingerprint}/download?{query}"),
            }
        }
    };

    Ok(JSend::success(response))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_fingerprint(raw: &str) -> Result<Fingerprint, ApiError> {
    Fingerprint::from_hex(raw).map_err(|e| ApiError::bad_request(e.to_string()))
}

fn validate_owner(owner: &str) -> Result<&str, ApiError> {
    if owner.trim().is_empty() {
        return Err(ApiError::bad_request("owner is required"));
    }
    if owner.contains('\0') {
        return Err(ApiError::bad_request("owner must not contain NUL"));
    }
    Ok(owner)
}

fn content_response(body: Body, display_name: &str, link: &UserFileLink) -> Response {
    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();

    let mime = mime_guess::from_path(display_name).first_or_octet_stream();
    headers.insert(
        header::CONTENT_TYPE,
        mime.as_ref()
            .parse()
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(link.size));

    let safe_name = display_name.replace('"', "");
    if let Ok(value) = format!("attachment; filename=\"{safe_name}\"").parse() {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    // Content is immutable per fingerprint
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, max-age=3600"),
    );

    response
}

fn location_response(location: &BlobLocation) -> LocationResponse {
    match location {
        BlobLocation::Local { .. } => LocationResponse {
            state: "local",
            backend: None,
        },
        BlobLocation::Remote { backend, .. } => LocationResponse {
            state: "remote",
            backend: Some(*backend),
        },
        BlobLocation::PendingTransfer { to_backend, .. } => LocationResponse {
            state: "pending_transfer",
            backend: Some(*to_backend),
        },
    }
}

fn upload_response(receipt: UploadReceipt) -> UploadResponse {
    UploadResponse {
        deduplicated: receipt.deduplicated,
        fingerprint: receipt.fingerprint.to_hex(),
        link_created: receipt.link_created,
        location: location_response(&receipt.location),
        size: receipt.size,
    }
}

fn blob_response(record: &BlobRecord, link_count: usize) -> BlobResponse {
    BlobResponse {
        created_at: record.created_at.to_rfc3339(),
        fingerprint: record.fingerprint.to_hex(),
        link_count,
        location: location_response(&record.location),
        size: record.size,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_fast_upload_requires_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let result = fast_upload(
            State(Arc::clone(&state)),
            AppJson(FastUploadRequest {
                owner: "alice".to_string(),
                fingerprint: Fingerprint::of(b"never uploaded").to_hex(),
                file_name: "a.txt".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.status == StatusCode::NOT_FOUND));

        let receipt = state
            .uploader
            .upload_bytes("alice", "a.txt", b"known")
            .await
            .unwrap();
        let Json(response) = fast_upload(
            State(Arc::clone(&state)),
            AppJson(FastUploadRequest {
                owner: "bob".to_string(),
                fingerprint: receipt.fingerprint.to_hex(),
                file_name: "b.txt".to_string(),
            }),
        )
        .await
        .unwrap();
        assert!(response.data.deduplicated);
        assert!(response.data.link_created);
        assert_eq!(response.data.size, 5);
    }

    #[tokio::test]
    async fn test_fast_upload_rejects_malformed_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let result = fast_upload(
            State(state),
            AppJson(FastUploadRequest {
                owner: "alice".to_string(),
                fingerprint: "not-hex".to_string(),
                file_name: "a.txt".to_string(),
            }),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.status == StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_get_blob_reports_location_and_links() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let receipt = state
            .uploader
            .upload_bytes("alice", "a.txt", b"shared")
            .await
            .unwrap();
        state
            .uploader
            .upload_bytes("bob", "b.txt", b"shared")
            .await
            .unwrap();

        let Json(response) = get_blob(State(state), Path(receipt.fingerprint.to_hex()))
            .await
            .unwrap();
        assert_eq!(response.data.link_count, 2);
        assert_eq!(response.data.location.state, "local");
        assert_eq!(response.data.size, 6);
    }

    #[tokio::test]
    async fn test_download_streams_local_content() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let receipt = state
            .uploader
            .upload_bytes("alice", "notes.txt", b"abc")
            .await
            .unwrap();

        let response = download_file(
            State(Arc::clone(&state)),
            Path(receipt.fingerprint.to_hex()),
            AppQuery(DownloadParams {
                owner: "alice".to_string(),
                name: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(
            response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"notes.txt\""
        );
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"abc"));
    }

    #[tokio::test]
    async fn test_download_requires_link_for_owner() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let receipt = state
            .uploader
            .upload_bytes("alice", "notes.txt", b"abc")
            .await
            .unwrap();

        let result = download_file(
            State(state),
            Path(receipt.fingerprint.to_hex()),
            AppQuery(DownloadParams {
                owner: "mallory".to_string(),
                name: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn test_download_url_falls_back_to_service_path() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let receipt = state
            .uploader
            .upload_bytes("alice smith", "a.bin", b"\x00\x01")
            .await
            .unwrap();

        let Json(response) = download_url(
            State(state),
            Path(receipt.fingerprint.to_hex()),
            AppQuery(DownloadParams {
                owner: "alice smith".to_string(),
                name: None,
            }),
        )
        .await
        .unwrap();

        assert!(!response.data.signed);
        assert_eq!(response.data.file_name, "a.bin");
        assert!(response.data.url.starts_with(&format!(
            "/files/{}/download?owner=",
            receipt.fingerprint
        )));
        assert!(!response.data.url.contains(' '));
        assert!(response.data.url.ends_with("&name=a.bin"));
    }

    #[tokio::test]
    async fn test_download_by_name_keeps_every_name_reachable() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let first = state
            .uploader
            .upload_bytes("alice", "hello.txt", b"abc")
            .await
            .unwrap();
        state
            .uploader
            .upload_bytes("alice", "copy.json", b"abc")
            .await
            .unwrap();

        for (name, mime) in [("hello.txt", "text/plain"), ("copy.json", "application/json")] {
            let response = download_file(
                State(Arc::clone(&state)),
                Path(first.fingerprint.to_hex()),
                AppQuery(DownloadParams {
                    owner: "alice".to_string(),
                    name: Some(name.to_string()),
                }),
            )
            .await
            .unwrap();
            assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), mime);
            assert_eq!(
                response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
                format!("attachment; filename=\"{name}\"").as_str()
            );
        }

        let result = download_file(
            State(state),
            Path(first.fingerprint.to_hex()),
            AppQuery(DownloadParams {
                owner: "alice".to_string(),
                name: Some("other.txt".to_string()),
            }),
        )
        .await;
        assert!(matches!(result, Err(ref e) if e.status == StatusCode::NOT_FOUND));
    }
}
