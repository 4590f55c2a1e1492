//! On-disk content-addressed store for pulled images
//!
//! Pulling an image writes its manifest graph and blobs here; pushing reads
//! them back by digest. Layout under the store root:
//!
//! - `blobs/sha256/<hex>` - layer and config blobs
//! - `manifests/sha256/<hex>` - raw manifest bytes
//! - `manifests/sha256/<hex>.media-type` - the manifest media type
//! - `staging/` - in-flight writes, renamed into place once verified

use crate::digest::{DigestUtils, StreamingDigest};
use crate::error::{Result, SyncerError};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const BLOBS_DIR: &str = "blobs/sha256";
const MANIFESTS_DIR: &str = "manifests/sha256";
const STAGING_DIR: &str = "staging";

/// A manifest read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredManifest {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct ContentStore {
    root: PathBuf,
    temporary: bool,
}

impl ContentStore {
    /// Open (or create) a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            root: root.into(),
            temporary: false,
        };
        store.create_layout()?;
        Ok(store)
    }

    /// Create a store in a fresh temporary directory, removed on drop
    pub fn temporary() -> Result<Self> {
        let root = std::env::temp_dir().join(format!("syncerd-{}", uuid::Uuid::new_v4()));
        let mut store = Self::new(root)?;
        store.temporary = true;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn create_layout(&self) -> Result<()> {
        for dir in [BLOBS_DIR, MANIFESTS_DIR, STAGING_DIR] {
            let path = self.root.join(dir);
            std::fs::create_dir_all(&path).map_err(|e| {
                SyncerError::Io(format!("Failed to create directory {}: {}", path.display(), e))
            })?;
        }
        Ok(())
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = DigestUtils::extract_hex_part(digest)?;
        Ok(self.root.join(BLOBS_DIR).join(hex))
    }

    fn manifest_paths(&self, digest: &str) -> Result<(PathBuf, PathBuf)> {
        let hex = DigestUtils::extract_hex_part(digest)?;
        let dir = self.root.join(MANIFESTS_DIR);
        Ok((dir.join(hex), dir.join(format!("{}.media-type", hex))))
    }

    /// A file under `staging/`, deleted on drop unless persisted
    fn staging_file(&self) -> Result<(NamedTempFile, tokio::fs::File)> {
        let staging = NamedTempFile::new_in(self.root.join(STAGING_DIR))?;
        let file = tokio::fs::File::from_std(staging.as_file().try_clone()?);
        Ok((staging, file))
    }

    fn persist(staging: NamedTempFile, target: &Path) -> Result<()> {
        staging.persist(target).map_err(|e| {
            SyncerError::Io(format!("Failed to move {} into place: {}", target.display(), e.error))
        })?;
        Ok(())
    }

    async fn write_file(&self, target: &Path, contents: &[u8]) -> Result<()> {
        let (staging, mut file) = self.staging_file()?;
        file.write_all(contents).await?;
        file.flush().await?;
        drop(file);
        Self::persist(staging, target)
    }

    /// Whether a complete blob of the given size is already stored
    pub async fn has_blob(&self, digest: &str, size: u64) -> bool {
        let Ok(path) = self.blob_path(digest) else {
            return false;
        };
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len() == size,
            Err(_) => false,
        }
    }

    /// Stream a blob to disk, verifying it against `digest` before it becomes visible.
    ///
    /// Returns the number of bytes written.
    pub async fn write_blob<S, B, E>(&self, digest: &str, stream: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<B, E>>,
        B: AsRef<[u8]>,
        E: Into<SyncerError>,
    {
        let target = self.blob_path(digest)?;
        let mut stream = std::pin::pin!(stream);
        let mut hasher = StreamingDigest::new();

        let (staging, mut file) = self.staging_file()?;
        let written = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(Into::into)?;
                hasher.update(chunk.as_ref());
                file.write_all(chunk.as_ref()).await?;
            }
            file.flush().await?;
            Ok::<(), SyncerError>(())
        }
        .await;
        drop(file);
        written?;

        let bytes = hasher.bytes();
        let computed = hasher.finish();
        if computed != digest {
            return Err(SyncerError::Decode(format!(
                "Blob digest mismatch: expected {}, received {}",
                digest, computed
            )));
        }

        Self::persist(staging, &target)?;
        debug!(digest, bytes, "stored blob");
        Ok(bytes)
    }

    /// Open a stored blob for reading, returning the file and its size
    pub async fn open_blob(&self, digest: &str) -> Result<(tokio::fs::File, u64)> {
        let path = self.blob_path(digest)?;
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncerError::NotFound(format!("blob {} is not in the content store", digest))
            } else {
                SyncerError::Io(format!("Failed to open blob {}: {}", digest, e))
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Store a manifest after checking it hashes to `digest`
    pub async fn put_manifest(&self, digest: &str, media_type: &str, bytes: &[u8]) -> Result<()> {
        DigestUtils::verify_data_integrity(bytes, digest)?;
        let (manifest_path, type_path) = self.manifest_paths(digest)?;

        self.write_file(&type_path, media_type.as_bytes()).await?;
        self.write_file(&manifest_path, bytes).await
    }

    pub async fn get_manifest(&self, digest: &str) -> Result<StoredManifest> {
        let (manifest_path, type_path) = self.manifest_paths(digest)?;
        let bytes = tokio::fs::read(&manifest_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncerError::NotFound(format!(
                    "image {} has not been pulled into the content store",
                    digest
                ))
            } else {
                SyncerError::Io(format!("Failed to read manifest {}: {}", digest, e))
            }
        })?;
        let media_type = tokio::fs::read_to_string(&type_path).await?;
        Ok(StoredManifest {
            media_type: media_type.trim().to_string(),
            bytes,
        })
    }

    /// Drop all stored content, keeping the directory layout
    pub async fn clear(&self) -> Result<()> {
        for dir in ["blobs", "manifests", STAGING_DIR] {
            let path = self.root.join(dir);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(SyncerError::Io(format!(
                        "Failed to clear {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        self.create_layout()
    }
}

impl Drop for ContentStore {
    fn drop(&mut self) {
        if self.temporary {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}
