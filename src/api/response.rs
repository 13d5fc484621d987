//! JSend envelopes and the handler error type.
//!
//! Success bodies are `{"status":"success","data":...}`. Client errors are
//! `fail` with the message under `data`, server errors are `error` with the
//! message at the top level. Failures raised by the storage core also carry
//! a machine-readable `reason`.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, FromRequestParts, Request};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreError;

#[derive(Debug, Serialize)]
pub struct JSend<T: Serialize> {
    pub data: T,
    pub status: &'static str,
}

impl<T: Serialize> JSend<T> {
    pub fn success(data: T) -> Json<JSend<T>> {
        Json(JSend {
            data,
            status: "success",
        })
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub reason: Option<&'static str>,
}

#[derive(Serialize)]
struct FailDetail<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum ErrorBody<'a> {
    Fail {
        data: FailDetail<'a>,
    },
    Error {
        message: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.status.is_server_error() {
            ErrorBody::Error {
                message: &self.message,
                reason: self.reason,
            }
        } else {
            ErrorBody::Fail {
                data: FailDetail {
                    message: &self.message,
                    reason: self.reason,
                },
            }
        };
        (self.status, Json(body)).into_response()
    }
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            reason: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let (status, reason) = match e {
            StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            StoreError::BackendUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable")
            }
            StoreError::Index(_) => (StatusCode::SERVICE_UNAVAILABLE, "index_unavailable"),
            StoreError::Exhausted(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transfer_exhausted"),
            StoreError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io"),
        };
        if status.is_server_error() {
            tracing::error!(error = %e, reason, "Request failed in storage core");
        }
        Self {
            status,
            message: e.to_string(),
            reason: Some(reason),
        }
    }
}

/// `axum::Json` that rejects with a JSend fail.
pub struct AppJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| match rejection {
                JsonRejection::JsonDataError(err) => {
                    ApiError::bad_request(format!("Invalid request body: {}", err.body_text()))
                }
                JsonRejection::MissingJsonContentType(_) => {
                    ApiError::bad_request("Missing Content-Type: application/json header")
                }
                _ => ApiError::bad_request("Malformed JSON in request body"),
            })?;
        Ok(AppJson(value))
    }
}

/// Query extractor backed by serde_qs that rejects with a JSend fail.
pub struct AppQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for AppQuery<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        serde_qs::from_str(parts.uri.query().unwrap_or_default())
            .map(AppQuery)
            .map_err(|e| ApiError::bad_request(format!("Invalid query parameter: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;

    async fn body_json(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_store_errors_map_to_status_and_reason() {
        let cases = [
            (
                StoreError::unknown_blob(&Fingerprint::of(b"x")),
                StatusCode::NOT_FOUND,
                "not_found",
            ),
            (
                StoreError::BackendUnavailable("down".into()),
                StatusCode::SERVICE_UNAVAILABLE,
                "backend_unavailable",
            ),
            (
                StoreError::Exhausted(Fingerprint::of(b"x")),
                StatusCode::INTERNAL_SERVER_ERROR,
                "transfer_exhausted",
            ),
        ];
        for (error, status, reason) in cases {
            let api = ApiError::from(error);
            assert_eq!(api.status, status);
            assert_eq!(api.reason, Some(reason));
        }
    }

    #[tokio::test]
    async fn test_client_error_is_jsend_fail() {
        let (status, body) = body_json(ApiError::not_found("Blob not found")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body,
            serde_json::json!({"status": "fail", "data": {"message": "Blob not found"}})
        );
    }

    #[tokio::test]
    async fn test_server_error_is_jsend_error_with_reason() {
        let (status, body) =
            body_json(ApiError::from(StoreError::Exhausted(Fingerprint::of(b"x")))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert_eq!(body["reason"], "transfer_exhausted");
        assert!(body["message"].as_str().unwrap().contains(&Fingerprint::of(b"x").to_hex()));
        assert!(body.get("data").is_none());
    }
}
