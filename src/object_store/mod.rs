mod local;

pub use local::LocalStore;

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Sequential reader over a stored object.
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// Writable destination returned by [`ObjectStore::create`]. Nothing is
/// visible at the destination path until [`finish`](ObjectSink::finish)
/// succeeds; dropping an unfinished sink discards the bytes.
#[async_trait]
pub trait ObjectSink: AsyncWrite + Send + Unpin {
    async fn finish(self: Box<Self>) -> Result<(), ObjectStoreError>;
    async fn abort(self: Box<Self>);
}

/// Abstraction over physical storage. Paths are opaque to callers; the
/// layout behind them belongs to the implementation.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn open(&self, path: &Path) -> Result<ObjectReader, ObjectStoreError>;
    async fn create(&self, path: &Path) -> Result<Box<dyn ObjectSink>, ObjectStoreError>;
    /// Deleting a missing path is not an error.
    async fn delete(&self, path: &Path) -> Result<(), ObjectStoreError>;
    async fn stat(&self, path: &Path) -> Result<Option<ObjectMeta>, ObjectStoreError>;

    /// Write a small in-memory object in one go (derived assets).
    async fn put(&self, path: &Path, data: &[u8]) -> Result<u64, ObjectStoreError> {
        let mut sink = self.create(path).await?;
        if let Err(e) = sink.write_all(data).await {
            sink.abort().await;
            return Err(e.into());
        }
        sink.finish().await?;
        Ok(data.len() as u64)
    }

    /// Read at most `limit` leading bytes of an object.
    async fn read_prefix(&self, path: &Path, limit: u64) -> Result<Vec<u8>, ObjectStoreError> {
        let reader = self.open(path).await?;
        let mut data = Vec::new();
        reader.take(limit).read_to_end(&mut data).await?;
        Ok(data)
    }
}
