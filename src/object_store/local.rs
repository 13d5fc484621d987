use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

use super::{ObjectStore, ObjectStoreError};

/// Directory-backed object store emulating a remote tier on local disk.
/// It cannot sign URLs, so downloads of its objects are proxied.
pub struct LocalStore {
    base_path: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, std::io::Error> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ObjectStoreError> {
        if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
            return Err(ObjectStoreError::Backend(format!("invalid object key '{key}'")));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        let path = self.object_path(key)?;
        // Write beside the target and rename so readers never see a torn object.
        let tmp = self.base_path.join(format!(".{key}.{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
