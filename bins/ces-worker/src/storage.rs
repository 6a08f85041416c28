//! Artifact storage for sources and execution logs.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid object key '{0}'")]
    InvalidKey(String),
    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },
}

/// Object store interface used by the flow
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Store the file at `local` under `key`, replacing any previous object.
    async fn upload(&self, bucket: &str, local: &Path, key: &str) -> Result<(), StorageError>;

    /// Fetch `key` into the file at `local`.
    async fn download(&self, bucket: &str, key: &str, local: &Path) -> Result<(), StorageError>;
}

/// Directory-backed store: buckets are directories, keys relative paths.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        let bucket = checked(bucket)?;
        let key = checked(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

fn checked(name: &str) -> Result<&Path, StorageError> {
    let path = Path::new(name);
    let plain = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if name.is_empty() || !plain {
        return Err(StorageError::InvalidKey(name.to_string()));
    }
    Ok(path)
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let dir = self.root.join(checked(bucket)?);
        tokio::fs::create_dir_all(&dir).await?;
        debug!(bucket, path = %dir.display(), "Bucket ready");
        Ok(())
    }

    async fn upload(&self, bucket: &str, local: &Path, key: &str) -> Result<(), StorageError> {
        let target = self.object_path(bucket, key)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local, &target).await?;
        debug!(bucket, key, "Object uploaded");
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str, local: &Path) -> Result<(), StorageError> {
        let source = self.object_path(bucket, key)?;
        match tokio::fs::copy(&source, local).await {
            Ok(_) => {
                debug!(bucket, key, "Object downloaded");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !source.exists() => {
                Err(StorageError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}
