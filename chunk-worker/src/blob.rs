use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("blob {0} does not exist")]
    NotFound(String),
    #[error("{0} is not a valid blob path")]
    InvalidPath(String),
    #[error("{operation} of blob {path} failed with: {error}")]
    IoError {
        operation: &'static str,
        path: String,
        error: io::Error,
    },
}

/// Where raw uploads are read from and chunk content is written to.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Bytes, BlobError>;

    async fn put(&self, path: &str, content: Bytes) -> Result<(), BlobError>;

    async fn exists(&self, path: &str) -> Result<bool, BlobError>;
}

/// Blobs kept as files under a root directory, keyed by their relative path.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    // Blob paths must stay inside the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if path.is_empty() || escapes {
            return Err(BlobError::InvalidPath(path.to_owned()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn get(&self, path: &str) -> Result<Bytes, BlobError> {
        let full_path = self.resolve(path)?;

        match tokio::fs::read(&full_path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(path.to_owned()))
            }
            Err(error) => Err(BlobError::IoError {
                operation: "read",
                path: path.to_owned(),
                error,
            }),
        }
    }

    async fn put(&self, path: &str, content: Bytes) -> Result<(), BlobError> {
        let full_path = self.resolve(path)?;
        let io_error = |error| BlobError::IoError {
            operation: "write",
            path: path.to_owned(),
            error,
        };

        if let Some(parent) = full_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&full_path, &content)
            .await
            .map_err(io_error)
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        let full_path = self.resolve(path)?;

        tokio::fs::try_exists(&full_path)
            .await
            .map_err(|error| BlobError::IoError {
                operation: "stat",
                path: path.to_owned(),
                error,
            })
    }
}
