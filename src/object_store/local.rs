use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::{self, File};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{ObjectMeta, ObjectReader, ObjectSink, ObjectStore, ObjectStoreError};

/// Local filesystem object store. New objects are staged under `temp_dir`
/// and renamed into place once complete.
pub struct LocalStore {
    temp_dir: PathBuf,
}

impl LocalStore {
    pub fn new<P: AsRef<Path>>(temp_dir: P) -> Result<Self, std::io::Error> {
        let temp_dir = temp_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self { temp_dir })
    }

    fn map_io_error(e: io::Error, path: &Path) -> ObjectStoreError {
        match e.kind() {
            io::ErrorKind::NotFound => ObjectStoreError::NotFound(path.display().to_string()),
            _ => ObjectStoreError::Io(e),
        }
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn open(&self, path: &Path) -> Result<ObjectReader, ObjectStoreError> {
        let file = File::open(path)
            .await
            .map_err(|e| Self::map_io_error(e, path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn ObjectSink>, ObjectStoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path = self
            .temp_dir
            .join(format!("{}.part", uuid::Uuid::new_v4()));
        let file = File::create(&temp_path).await?;

        Ok(Box::new(LocalSink {
            file: Some(file),
            temp_path,
            dest: path.to_path_buf(),
            settled: false,
        }))
    }

    async fn delete(&self, path: &Path) -> Result<(), ObjectStoreError> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &Path) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta { size: meta.len() })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct LocalSink {
    file: Option<File>,
    temp_path: PathBuf,
    dest: PathBuf,
    /// Set once the staged file has been published or removed.
    settled: bool,
}

impl LocalSink {
    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sink already closed"))
    }
}

impl AsyncWrite for LocalSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().file_mut() {
            Ok(file) => Pin::new(file).poll_write(cx, buf),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file_mut() {
            Ok(file) => Pin::new(file).poll_flush(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().file_mut() {
            Ok(file) => Pin::new(file).poll_shutdown(cx),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[async_trait]
impl ObjectSink for LocalSink {
    async fn finish(mut self: Box<Self>) -> Result<(), ObjectStoreError> {
        let mut file = self.file.take().ok_or_else(|| {
            ObjectStoreError::Backend("sink already closed".to_string())
        })?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&self.temp_path, &self.dest).await {
            // Staging and destination may live on different filesystems.
            tracing::debug!(error = %e, dest = %self.dest.display(), "rename failed, copying instead");
            fs::copy(&self.temp_path, &self.dest).await?;
            let _ = fs::remove_file(&self.temp_path).await;
        }
        self.settled = true;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        drop(self.file.take());
        if let Err(e) = fs::remove_file(&self.temp_path).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(error = %e, path = %self.temp_path.display(), "Failed to remove staged upload");
            }
        }
        self.settled = true;
    }
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if !self.settled {
            drop(self.file.take());
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
