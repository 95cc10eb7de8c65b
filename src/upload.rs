//! Single-pass transfer of an upload source into the object store.

use std::path::Path;
use std::time::Instant;

use ring::digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::FileError;
use crate::object_store::{ObjectSink, ObjectStore};
use crate::storage::models::UploadProgress;

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub byte_size: u64,
    /// CRC32, lowercase hex
    pub content_hash: String,
    /// SHA-256, lowercase hex
    pub checksum: String,
}

/// Fast identity digest and cryptographic integrity digest fed from the same bytes.
pub struct DualDigest {
    crc: crc32fast::Hasher,
    sha: digest::Context,
}

impl Default for DualDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl DualDigest {
    pub fn new() -> Self {
        Self {
            crc: crc32fast::Hasher::new(),
            sha: digest::Context::new(&digest::SHA256),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.crc.update(chunk);
        self.sha.update(chunk);
    }

    /// Returns `(content_hash, checksum)`.
    pub fn finish(self) -> (String, String) {
        let crc = self.crc.finalize();
        let sha = self.sha.finish();
        (format!("{crc:08x}"), hex::encode(sha.as_ref()))
    }
}

#[derive(Debug, Clone)]
pub struct UploadPipeline {
    chunk_size: usize,
    /// 0 disables the ceiling
    max_file_size: u64,
}

impl UploadPipeline {
    pub fn new(chunk_size: usize, max_file_size: u64) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_file_size,
        }
    }

    /// Stream `source` into `dest`, hashing and size-checking every chunk.
    ///
    /// `on_progress` is called after each chunk. Cancellation is observed
    /// between chunks and while waiting on the source. On any failure the
    /// partially written destination is discarded.
    pub async fn run<R, F>(
        &self,
        store: &dyn ObjectStore,
        dest: &Path,
        source: &mut R,
        total_bytes: Option<u64>,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<TransferOutcome, FileError>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
        F: FnMut(&UploadProgress) + Send,
    {
        let mut sink = store.create(dest).await?;
        let mut buf = vec![0u8; self.chunk_size];
        let mut digest = DualDigest::new();
        let mut progress = UploadProgress::new(total_bytes);
        let mut transferred: u64 = 0;
        let started = Instant::now();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    discard(sink, store, dest).await;
                    return Err(FileError::Cancelled);
                }
                read = source.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    discard(sink, store, dest).await;
                    return Err(e.into());
                }
            };

            transferred += n as u64;
            if self.max_file_size > 0 && transferred > self.max_file_size {
                discard(sink, store, dest).await;
                return Err(FileError::SizeLimitExceeded {
                    limit: self.max_file_size,
                });
            }

            let chunk = &buf[..n];
            if let Err(e) = sink.write_all(chunk).await {
                discard(sink, store, dest).await;
                return Err(e.into());
            }
            digest.update(chunk);

            progress.advance(transferred, started.elapsed());
            on_progress(&progress);
        }

        if let Err(e) = sink.finish().await {
            if let Err(cleanup) = store.delete(dest).await {
                tracing::warn!(error = %cleanup, path = %dest.display(), "Failed to remove unfinished upload");
            }
            return Err(e.into());
        }

        let (content_hash, checksum) = digest.finish();
        Ok(TransferOutcome {
            byte_size: transferred,
            content_hash,
            checksum,
        })
    }
}

async fn discard(sink: Box<dyn ObjectSink>, store: &dyn ObjectStore, dest: &Path) {
    sink.abort().await;
    if let Err(e) = store.delete(dest).await {
        tracing::warn!(error = %e, path = %dest.display(), "Failed to remove partial upload");
    }
}
