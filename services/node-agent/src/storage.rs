//! Object storage access for template archives.
//!
//! The cache only needs one operation: stream the bytes behind a storage
//! key. [`HttpTemplateStorage`] serves production buckets exposed over
//! HTTP(S); [`FsTemplateStorage`] serves a local directory for dev mode
//! and tests.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("template archive not found: {0}")]
    NotFound(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),
}

/// A template archive being fetched. `content_length` is the size the
/// backend declared, when it declared one; the cache checks received
/// bytes against it.
pub struct TemplateArchive {
    pub storage_key: String,
    pub content_length: Option<u64>,
    pub stream: BoxStream<'static, Result<Bytes, StorageError>>,
}

impl std::fmt::Debug for TemplateArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateArchive")
            .field("storage_key", &self.storage_key)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Read access to the bucket holding template tarballs.
#[async_trait]
pub trait TemplateStorage: Send + Sync {
    async fn fetch(&self, storage_key: &str) -> Result<TemplateArchive, StorageError>;
}

/// Fetches archives from an HTTP(S) object store, addressed as
/// `{endpoint}/{bucket}/{key}`.
pub struct HttpTemplateStorage {
    client: Client,
    base_url: String,
}

impl HttpTemplateStorage {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        request_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()?;
        let base_url = format!("{}/{}", endpoint.trim_end_matches('/'), bucket);
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl TemplateStorage for HttpTemplateStorage {
    async fn fetch(&self, storage_key: &str) -> Result<TemplateArchive, StorageError> {
        let key = storage_key.trim_start_matches('/');
        let url = format!("{}/{}", self.base_url, key);
        debug!(url = %url, "Fetching template archive");

        let response = self.client.get(&url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }
        let response = response.error_for_status()?;

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StorageError::Http))
            .boxed();

        Ok(TemplateArchive {
            storage_key: storage_key.to_string(),
            content_length,
            stream,
        })
    }
}

/// Serves archives straight from a directory tree.
pub struct FsTemplateStorage {
    root: PathBuf,
}

impl FsTemplateStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, storage_key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(storage_key.trim_start_matches('/'));
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !plain || relative.as_os_str().is_empty() {
            return Err(StorageError::InvalidKey(storage_key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl TemplateStorage for FsTemplateStorage {
    async fn fetch(&self, storage_key: &str) -> Result<TemplateArchive, StorageError> {
        let path = self.resolve(storage_key)?;
        debug!(path = %path.display(), "Reading template archive");

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(storage_key.to_string()))
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let content_length = Some(bytes.len() as u64);
        let stream = futures_util::stream::once(async move { Ok(Bytes::from(bytes)) }).boxed();

        Ok(TemplateArchive {
            storage_key: storage_key.to_string(),
            content_length,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn fs_storage_streams_file_bytes() {
        let dir = TempDir::new().unwrap();
        let key_dir = dir.path().join("templates/paper");
        std::fs::create_dir_all(&key_dir).unwrap();
        std::fs::write(key_dir.join("1.0.0.tar"), b"tar bytes").unwrap();

        let storage = FsTemplateStorage::new(dir.path());
        let archive = storage.fetch("templates/paper/1.0.0.tar").await.unwrap();
        assert_eq!(archive.content_length, Some(9));

        let chunks: Vec<Bytes> = archive.stream.try_collect().await.unwrap();
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"tar bytes");
    }

    #[tokio::test]
    async fn fs_storage_reports_missing_keys() {
        let dir = TempDir::new().unwrap();
        let storage = FsTemplateStorage::new(dir.path());
        let error = storage.fetch("nope.tar").await.unwrap_err();
        assert!(matches!(error, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn fs_storage_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let storage = FsTemplateStorage::new(dir.path());
        let error = storage.fetch("../outside.tar").await.unwrap_err();
        assert!(matches!(error, StorageError::InvalidKey(_)));
    }
}
