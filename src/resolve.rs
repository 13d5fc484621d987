//! Download planning: turns a blob's tracked location into a way to serve it.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;
use crate::object_store::Backends;
use crate::storage::models::{BackendKind, BlobRecord, Placement, UserFileLink};
use crate::storage::Database;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryPlan {
    StreamLocalFile {
        path: PathBuf,
        display_name: String,
    },
    ProxyRemoteFetch {
        backend: BackendKind,
        key: String,
        display_name: String,
    },
    RedirectSignedUrl {
        url: String,
    },
}

pub struct LocationResolver {
    backends: Backends,
    signed_url_ttl: Duration,
}

impl LocationResolver {
    pub fn new(backends: Backends, signed_url_ttl: Duration) -> Self {
        Self {
            backends,
            signed_url_ttl,
        }
    }

    /// Choose how to deliver `record`.
    ///
    /// A `PendingTransfer` record is served from its source, which still holds
    /// the complete content. Remote content is redirected to a signed URL when
    /// the backend can produce one, and proxied otherwise.
    pub async fn resolve(&self, record: &BlobRecord, display_name: &str) -> DeliveryPlan {
        match record.location.readable_placement() {
            Placement::Local { path } => DeliveryPlan::StreamLocalFile {
                path,
                display_name: display_name.to_string(),
            },
            Placement::Remote { backend, key } => {
                if let Some(url) = self.sign(backend, &key).await {
                    return DeliveryPlan::RedirectSignedUrl { url };
                }
                DeliveryPlan::ProxyRemoteFetch {
                    backend,
                    key,
                    display_name: display_name.to_string(),
                }
            }
        }
    }

    async fn sign(&self, backend: BackendKind, key: &str) -> Option<String> {
        let store = self.backends.get(backend).ok()?;
        if !store.supports_signed_urls() {
            return None;
        }
        match store.signed_url(key, self.signed_url_ttl).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(backend = %backend, key, error = %e, "Signing failed, proxying download");
                None
            }
        }
    }

    /// Resolve the download of `fingerprint` as linked by `owner`.
    ///
    /// `file_name` picks one of the owner's names for the content; without
    /// it the most recently linked name is served.
    pub async fn plan_download(
        &self,
        db: &Database,
        owner: &str,
        fingerprint: &Fingerprint,
        file_name: Option<&str>,
    ) -> Result<(UserFileLink, DeliveryPlan), StoreError> {
        let link = match file_name {
            Some(name) => db.get_user_file(owner, fingerprint, name)?,
            None => db
                .user_files(owner, fingerprint)?
                .into_iter()
                .max_by_key(|link| link.linked_at),
        };
        let link = link.ok_or_else(|| {
            StoreError::NotFound(format!("file {fingerprint} for owner '{owner}'"))
        })?;
        let record = db
            .lookup(fingerprint)?
            .ok_or_else(|| StoreError::unknown_blob(fingerprint))?;

        let plan = self.resolve(&record, &link.file_name).await;
        Ok((link, plan))
    }

    pub async fn fetch_remote(&self, backend: BackendKind, key: &str) -> Result<Bytes, StoreError> {
        Ok(self.backends.get(backend)?.get(key).await?)
    }

    /// Read the content a plan points at. Redirects carry no bytes and
    /// return `None`.
    pub async fn fetch(&self, plan: &DeliveryPlan) -> Result<Option<Bytes>, StoreError> {
        match plan {
            DeliveryPlan::StreamLocalFile { path, .. } => {
                Ok(Some(Bytes::from(tokio::fs::read(path).await?)))
            }
            DeliveryPlan::ProxyRemoteFetch { backend, key, .. } => {
                self.fetch_remote(*backend, key).await.map(Some)
            }
            DeliveryPlan::RedirectSignedUrl { .. } => Ok(None),
        }
    }
}
