use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::StalledStreamProtectionConfig;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use super::{ObjectStore, ObjectStoreError};

/// S3-compatible object store (AWS S3, R2, MinIO). Credentials come from the
/// standard AWS environment/profile chain.
pub struct S3Store {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl S3Store {
    pub async fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(endpoint.is_some())
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Self {
            bucket: bucket.to_string(),
            client: aws_sdk_s3::Client::from_conf(config),
        }
    }

    fn backend_error(&self, op: &str, key: &str, e: impl std::fmt::Display) -> ObjectStoreError {
        ObjectStoreError::Backend(format!("S3 {op} s3://{}/{key} failed: {e}", self.bucket))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| self.backend_error("put", key, aws_sdk_s3::error::DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(ObjectStoreError::NotFound(key.to_string()));
            }
            Err(e) => {
                return Err(self.backend_error("get", key, aws_sdk_s3::error::DisplayErrorContext(e)))
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| self.backend_error("get", key, e))?;
        Ok(data.into_bytes())
    }

    fn supports_signed_urls(&self) -> bool {
        true
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<Option<String>, ObjectStoreError> {
        let presigning =
            PresigningConfig::expires_in(ttl).map_err(|e| self.backend_error("presign", key, e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| self.backend_error("presign", key, aws_sdk_s3::error::DisplayErrorContext(e)))?;
        Ok(Some(request.uri().to_string()))
    }
}
