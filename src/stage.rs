//! Local staging area: first landing place for every upload.
//!
//! Layout under the stage root:
//! - `tmp/`   uploader-private partial files, named per request
//! - `blobs/` committed content, named by fingerprint
//!
//! A partial upload only becomes visible under `blobs/` through an atomic
//! rename after its full content was written and synced.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::fingerprint::{Fingerprint, Fingerprinter};

pub struct LocalStage {
    blobs_dir: PathBuf,
    tmp_dir: PathBuf,
}

impl LocalStage {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, std::io::Error> {
        let root = root.as_ref();
        let blobs_dir = root.join("blobs");
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&blobs_dir)?;
        std::fs::create_dir_all(&tmp_dir)?;
        Ok(Self { blobs_dir, tmp_dir })
    }

    /// Final path of committed content with this fingerprint.
    pub fn blob_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.blobs_dir.join(fingerprint.to_hex())
    }

    /// Start a new upload under a private temporary name. Dropping the
    /// returned handle before [`SealedUpload::promote`] removes the file.
    pub async fn begin(&self) -> Result<StagedUpload, std::io::Error> {
        let token = uuid::Uuid::new_v4();
        let named = tempfile::Builder::new()
            .prefix(&format!("{token}."))
            .suffix(".part")
            .tempfile_in(&self.tmp_dir)?;
        let (file, path) = named.into_parts();

        Ok(StagedUpload {
            file: tokio::fs::File::from_std(file),
            path,
            hasher: Fingerprinter::new(),
        })
    }

    /// Atomically publish sealed content under its fingerprint. Content is
    /// immutable per name, so replacing an existing file is harmless.
    pub fn promote(&self, sealed: SealedUpload) -> Result<PathBuf, std::io::Error> {
        let target = self.blob_path(&sealed.fingerprint);
        sealed.path.persist(&target).map_err(|e| e.error)?;
        Ok(target)
    }

    pub async fn read(&self, path: &Path) -> Result<Bytes, std::io::Error> {
        Ok(Bytes::from(tokio::fs::read(path).await?))
    }
}

/// An upload being streamed into the stage.
pub struct StagedUpload {
    file: tokio::fs::File,
    path: TempPath,
    hasher: Fingerprinter,
}

impl StagedUpload {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), std::io::Error> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        Ok(())
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        self.hasher.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hasher.is_empty()
    }

    /// Flush and sync the content, fixing its fingerprint and size.
    pub async fn seal(mut self) -> Result<SealedUpload, std::io::Error> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let (fingerprint, size) = self.hasher.finish();
        Ok(SealedUpload {
            path: self.path,
            fingerprint,
            size,
        })
    }
}

/// Fully written, synced temporary content with a known fingerprint.
/// Dropping it without promoting discards the bytes.
pub struct SealedUpload {
    path: TempPath,
    pub fingerprint: Fingerprint,
    pub size: u64,
}

impl SealedUpload {
    pub fn discard(self) -> Result<(), std::io::Error> {
        self.path.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    fn committed(root: &Path) -> usize {
        count(&root.join("blobs"))
    }

    fn pending(root: &Path) -> usize {
        count(&root.join("tmp"))
    }

    #[tokio::test]
    async fn test_promote_publishes_under_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let stage = LocalStage::open(dir.path()).unwrap();

        let mut upload = stage.begin().await.unwrap();
        upload.write(b"ab").await.unwrap();
        upload.write(b"c").await.unwrap();
        assert_eq!(upload.len(), 3);

        let sealed = upload.seal().await.unwrap();
        assert_eq!(sealed.fingerprint, Fingerprint::of(b"abc"));
        assert_eq!(sealed.size, 3);

        let path = stage.promote(sealed).unwrap();
        assert_eq!(path, stage.blob_path(&Fingerprint::of(b"abc")));
        assert_eq!(stage.read(&path).await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(pending(dir.path()), 0);
        assert_eq!(committed(dir.path()), 1);
    }

    #[tokio::test]
    async fn test_dropped_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let stage = LocalStage::open(dir.path()).unwrap();

        let mut upload = stage.begin().await.unwrap();
        upload.write(b"partial").await.unwrap();
        assert_eq!(pending(dir.path()), 1);

        drop(upload);
        assert_eq!(pending(dir.path()), 0);
        assert_eq!(committed(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_use_private_names() {
        let dir = tempfile::tempdir().unwrap();
        let stage = LocalStage::open(dir.path()).unwrap();

        let mut first = stage.begin().await.unwrap();
        let mut second = stage.begin().await.unwrap();
        first.write(b"same").await.unwrap();
        second.write(b"same").await.unwrap();
        assert_eq!(pending(dir.path()), 2);

        let a = first.seal().await.unwrap();
        let b = second.seal().await.unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);

        stage.promote(a).unwrap();
        b.discard().unwrap();
        assert_eq!(pending(dir.path()), 0);
        assert_eq!(committed(dir.path()), 1);
    }
}
