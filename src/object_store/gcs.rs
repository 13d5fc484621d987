use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::Client;
use serde::Deserialize;

use super::{ObjectStore, ObjectStoreError};

const STORAGE_HOST: &str = "storage.googleapis.com";

/// Longest lifetime GCS accepts for a V4 signed URL (7 days).
const MAX_SIGNED_URL_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Google Cloud Storage object store backend.
pub struct GcsStore {
    bucket: String,
    client: Client,
    access_token: tokio::sync::RwLock<String>,
    /// Present when a service-account key file is configured; required for
    /// signing URLs.
    signer: Option<ServiceAccountKey>,
}

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl GcsStore {
    pub async fn new(bucket: &str, credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let client = Client::builder().build()?;

        let signer = match credentials_file {
            Some(path) => {
                let key_json = tokio::fs::read_to_string(path).await?;
                Some(serde_json::from_str::<ServiceAccountKey>(&key_json)?)
            }
            None => None,
        };

        let store = Self {
            bucket: bucket.to_string(),
            client,
            access_token: tokio::sync::RwLock::new(String::new()),
            signer,
        };

        store.refresh_token().await?;
        Ok(store)
    }

    async fn refresh_token(&self) -> Result<(), anyhow::Error> {
        let token = match self.signer {
            Some(ref key) => self.token_from_service_account(key).await?,
            None => self.token_from_metadata_server().await?,
        };

        let mut lock = self.access_token.write().await;
        *lock = token;
        Ok(())
    }

    async fn token_from_service_account(
        &self,
        key: &ServiceAccountKey,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");

        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp: TokenResponse = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    async fn token_from_metadata_server(&self) -> Result<String, anyhow::Error> {
        let resp: TokenResponse = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .json()
            .await?;

        Ok(resp.access_token)
    }

    /// Send a request, refreshing the access token once if GCS rejects it.
    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response, ObjectStoreError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let token = self.access_token.read().await.clone();
        let resp = build(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))?;

        if resp.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        self.refresh_token()
            .await
            .map_err(|e| ObjectStoreError::Backend(format!("GCS token refresh failed: {e}")))?;
        let token = self.access_token.read().await.clone();
        build(&token)
            .send()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    fn upload_url(&self, key: &str) -> String {
        format!(
            "https://{STORAGE_HOST}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.bucket,
            uri_encode(key, true)
        )
    }

    fn object_url(&self, key: &str) -> String {
        format!(
            "https://{STORAGE_HOST}/storage/v1/b/{}/o/{}",
            self.bucket,
            uri_encode(key, true)
        )
    }

    /// Build a V4 signed GET URL for `key`.
    fn sign_get_url(
        &self,
        key: &ServiceAccountKey,
        object: &str,
        ttl: Duration,
    ) -> Result<String, anyhow::Error> {
        let now = Utc::now();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let datestamp = now.format("%Y%m%d").to_string();
        let scope = format!("{datestamp}/auto/storage/goog4_request");
        let credential = format!("{}/{scope}", key.client_email);
        let expires = ttl.min(MAX_SIGNED_URL_TTL).as_secs().max(1);

        let path = format!("/{}/{}", self.bucket, uri_encode(object, false));
        let query = [
            ("X-Goog-Algorithm", "GOOG4-RSA-SHA256".to_string()),
            ("X-Goog-Credential", credential),
            ("X-Goog-Date", timestamp.clone()),
            ("X-Goog-Expires", expires.to_string()),
            ("X-Goog-SignedHeaders", "host".to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{k}={}", uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");

        let canonical_request =
            format!("GET\n{path}\n{query}\nhost:{STORAGE_HOST}\n\nhost\nUNSIGNED-PAYLOAD");
        let request_digest = ring::digest::digest(&ring::digest::SHA256, canonical_request.as_bytes());
        let string_to_sign = format!(
            "GOOG4-RSA-SHA256\n{timestamp}\n{scope}\n{}",
            hex::encode(request_digest.as_ref())
        );

        let signature = sign_rs256(string_to_sign.as_bytes(), &key.private_key)?;
        Ok(format!(
            "https://{STORAGE_HOST}{path}?{query}&X-Goog-Signature={}",
            hex::encode(signature)
        ))
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let url = self.upload_url(key);
        let resp = self
            .send_authorized(|token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("Content-Type", "application/octet-stream")
                    .body(data.clone())
            })
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Backend(format!(
                "GCS upload failed ({status}): {body}"
            )));
        }

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let url = format!("{}?alt=media", self.object_url(key));
        let resp = self
            .send_authorized(|token| self.client.get(&url).bearer_auth(token))
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ObjectStoreError::NotFound(key.to_string()));
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::Backend(format!(
                "GCS download failed ({status}): {body}"
            )));
        }

        resp.bytes()
            .await
            .map_err(|e| ObjectStoreError::Backend(e.to_string()))
    }

    fn supports_signed_urls(&self) -> bool {
        self.signer.is_some()
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<Option<String>, ObjectStoreError> {
        let Some(ref signer) = self.signer else {
            return Ok(None);
        };
        self.sign_get_url(signer, key, ttl)
            .map(Some)
            .map_err(|e| ObjectStoreError::Backend(format!("GCS URL signing failed: {e}")))
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Percent-encode everything outside the RFC 3986 unreserved set. `/` is kept
/// literal in object paths and encoded in query values and object ids.
fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM armor and decode the PKCS#8 DER body
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &der_b64)?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode() {
        assert_eq!(uri_encode("abc-1_2.3~", true), "abc-1_2.3~");
        assert_eq!(uri_encode("a/b c", true), "a%2Fb%20c");
        assert_eq!(uri_encode("a/b c", false), "a/b%20c");
        assert_eq!(uri_encode("svc@proj.iam", true), "svc%40proj.iam");
    }
}
