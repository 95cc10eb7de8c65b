use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use file_ingest::config::FileConfig;
use file_ingest::error::FileError;
use file_ingest::manager::{FileManager, TransferOptions, UploadRequest};
use file_ingest::object_store::{
    LocalStore, ObjectMeta, ObjectReader, ObjectSink, ObjectStore, ObjectStoreError,
};
use file_ingest::processing::{ProcessingError, ProcessingPipeline, VirusScanner};
use file_ingest::storage::models::{
    FileFilter, FilePermissions, FileRecord, FileStatus, FileType, VirusScanResult,
};
use file_ingest::storage::{Database, RecordStore};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;

const HELLO_CRC32: &str = "3610a686";
const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

struct Harness {
    _dir: tempfile::TempDir,
    config: FileConfig,
    db: Database,
    store: Arc<dyn ObjectStore>,
    manager: Arc<FileManager>,
}

fn harness(tweak: impl FnOnce(&mut FileConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FileConfig::rooted_at(dir.path().join("files"));
    config.chunk_size = 1024;
    tweak(&mut config);

    let db = Database::open(dir.path().join("data")).unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(&config.temp_dir).unwrap());
    let manager = Arc::new(
        FileManager::new(config.clone(), Arc::clone(&store), Arc::new(db.clone())).unwrap(),
    );

    Harness {
        _dir: dir,
        config,
        db,
        store,
        manager,
    }
}

async fn read_content(manager: &FileManager, id: &str) -> Vec<u8> {
    let (_, mut reader) = manager.download_file(id).await.unwrap();
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await.unwrap();
    data
}

async fn wait_for(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn with_status(manager: &FileManager, status: FileStatus) -> Vec<FileRecord> {
    manager.list_files(&FileFilter {
        status: Some(status),
        ..Default::default()
    })
}

fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

struct SignatureScanner;

#[async_trait]
impl VirusScanner for SignatureScanner {
    async fn scan(&self, mut content: ObjectReader) -> Result<VirusScanResult, ProcessingError> {
        let mut data = Vec::new();
        content
            .read_to_end(&mut data)
            .await
            .map_err(|e| ProcessingError::Scan(e.to_string()))?;
        let infected = data.windows(5).any(|w| w == b"EICAR");
        Ok(VirusScanResult {
            clean: !infected,
            threats: if infected {
                vec!["Eicar-Test-Signature".to_string()]
            } else {
                Vec::new()
            },
            engine: "signature-test".to_string(),
            scanned_at: Utc::now(),
        })
    }
}

struct OfflineScanner;

#[async_trait]
impl VirusScanner for OfflineScanner {
    async fn scan(&self, _content: ObjectReader) -> Result<VirusScanResult, ProcessingError> {
        Err(ProcessingError::Scan("connection refused".to_string()))
    }
}

/// Local store that records how many stored bytes were read back.
struct CountingStore {
    inner: LocalStore,
    bytes_read: Arc<AtomicU64>,
}

struct CountingReader {
    inner: ObjectReader,
    bytes_read: Arc<AtomicU64>,
}

impl AsyncRead for CountingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let polled = Pin::new(&mut self.inner).poll_read(cx, buf);
        let read = (buf.filled().len() - before) as u64;
        self.bytes_read.fetch_add(read, Ordering::SeqCst);
        polled
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn open(&self, path: &Path) -> Result<ObjectReader, ObjectStoreError> {
        let inner = self.inner.open(path).await?;
        Ok(Box::new(CountingReader {
            inner,
            bytes_read: Arc::clone(&self.bytes_read),
        }))
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn ObjectSink>, ObjectStoreError> {
        self.inner.create(path).await
    }

    async fn delete(&self, path: &Path) -> Result<(), ObjectStoreError> {
        self.inner.delete(path).await
    }

    async fn stat(&self, path: &Path) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        self.inner.stat(path).await
    }
}

fn counting_manager(h: &Harness, config: FileConfig) -> (FileManager, Arc<AtomicU64>) {
    let bytes_read = Arc::new(AtomicU64::new(0));
    let store: Arc<dyn ObjectStore> = Arc::new(CountingStore {
        inner: LocalStore::new(&config.temp_dir).unwrap(),
        bytes_read: Arc::clone(&bytes_read),
    });
    let manager = FileManager::new(config, store, Arc::new(h.db.clone())).unwrap();
    (manager, bytes_read)
}

// ============================================================================
// Upload
// ============================================================================

#[tokio::test]
async fn test_upload_hello() {
    let h = harness(|c| c.max_file_size = 10);

    let file = h
        .manager
        .upload_file(&b"hello"[..], UploadRequest::new("hello.txt").with_total_size(5))
        .await
        .unwrap();

    assert_eq!(file.status, FileStatus::Ready);
    assert_eq!(file.byte_size, 5);
    assert_eq!(file.file_type, FileType::Text);
    assert_eq!(file.mime_type, "text/plain");
    assert_eq!(file.extension, "txt");
    assert_eq!(file.content_hash.as_deref(), Some(HELLO_CRC32));
    assert_eq!(file.checksum.as_deref(), Some(HELLO_SHA256));
    assert!(file.thumbnail.is_none());

    let preview = file.preview.as_ref().expect("text files get a preview");
    assert_eq!(std::fs::read(&preview.path).unwrap(), b"hello");

    assert!(h.manager.get_upload_progress(&file.id).is_none());
    assert_eq!(read_content(&h.manager, &file.id).await, b"hello");

    let persisted = h.db.get_file(&file.id).unwrap().unwrap();
    assert_eq!(persisted.status, FileStatus::Ready);
    assert_eq!(persisted.checksum.as_deref(), Some(HELLO_SHA256));
}

#[tokio::test]
async fn test_upload_size_limit() {
    let h = harness(|c| c.max_file_size = 10);

    let result = h
        .manager
        .upload_file(&b"hello world"[..], UploadRequest::new("big.png"))
        .await;
    assert!(matches!(
        result,
        Err(FileError::SizeLimitExceeded { limit: 10 })
    ));

    assert!(with_status(&h.manager, FileStatus::Ready).is_empty());
    let failed = with_status(&h.manager, FileStatus::Error);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].thumbnail.is_none());
    assert!(!Path::new(&failed[0].storage_path).exists());

    let download = h.manager.download_file(&failed[0].id).await;
    assert!(matches!(
        download,
        Err(FileError::NotReady {
            status: FileStatus::Error,
            ..
        })
    ));

    // Exactly at the limit is fine
    let file = h
        .manager
        .upload_file(&b"0123456789"[..], UploadRequest::new("fits.bin"))
        .await
        .unwrap();
    assert_eq!(file.byte_size, 10);
}

#[tokio::test]
async fn test_identical_content_identical_digests() {
    let h = harness(|_| {});
    let content = vec![42u8; 10_000];

    let a = h
        .manager
        .upload_file(&content[..], UploadRequest::new("a.bin"))
        .await
        .unwrap();
    let b = h
        .manager
        .upload_file(&content[..], UploadRequest::new("b.bin"))
        .await
        .unwrap();

    assert_ne!(a.id, b.id);
    assert_ne!(a.storage_path, b.storage_path);
    assert_eq!(a.content_hash, b.content_hash);
    assert_eq!(a.checksum, b.checksum);
}

#[tokio::test]
async fn test_upload_rejects_bad_names_and_types() {
    let h = harness(|c| c.blocked_types = vec!["exe".to_string()]);

    let traversal = h
        .manager
        .upload_file(&b"x"[..], UploadRequest::new("../../etc/passwd"))
        .await;
    assert!(matches!(traversal, Err(FileError::Validation(_))));

    let blocked = h
        .manager
        .upload_file(&b"MZ"[..], UploadRequest::new("setup.exe"))
        .await;
    assert!(matches!(blocked, Err(FileError::Validation(_))));

    let bad_metadata = h
        .manager
        .upload_file(
            &b"x"[..],
            UploadRequest::new("ok.txt")
                .with_metadata([("bad key".to_string(), json!(1))].into()),
        )
        .await;
    assert!(matches!(bad_metadata, Err(FileError::Validation(_))));

    // Nothing was admitted
    assert!(h.manager.list_files(&FileFilter::default()).is_empty());
}

#[tokio::test]
async fn test_upload_sanitizes_name() {
    let h = harness(|_| {});

    let file = h
        .manager
        .upload_file(&b"data"[..], UploadRequest::new("C:\\Users\\me\\what?.txt"))
        .await
        .unwrap();
    assert_eq!(file.name, "what_.txt");
    assert_eq!(file.original_name, "C:\\Users\\me\\what?.txt");

    let dotted = h
        .manager
        .upload_file(&b"data"[..], UploadRequest::new("v1..2.txt"))
        .await
        .unwrap();
    assert_eq!(dotted.name, "v1..2.txt");
}

// ============================================================================
// Admission and cancellation
// ============================================================================

#[tokio::test]
async fn test_admission_bound_and_cancel_while_waiting() {
    let h = harness(|c| c.concurrent_uploads = 1);

    let (mut first_writer, first_reader) = tokio::io::duplex(1024);
    let first = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        async move {
            manager
                .upload_file(first_reader, UploadRequest::new("first.bin"))
                .await
        }
    });
    wait_for(|| with_status(&h.manager, FileStatus::Uploading).len() == 1).await;

    let cancel = CancellationToken::new();
    let (_second_writer, second_reader) = tokio::io::duplex(1024);
    let second = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        let cancel = cancel.clone();
        async move {
            manager
                .upload_file(
                    second_reader,
                    UploadRequest::new("second.bin").with_cancel(cancel),
                )
                .await
        }
    });
    wait_for(|| with_status(&h.manager, FileStatus::Pending).len() == 1).await;
    assert_eq!(with_status(&h.manager, FileStatus::Uploading).len(), 1);

    cancel.cancel();
    assert!(matches!(second.await.unwrap(), Err(FileError::Cancelled)));
    assert!(with_status(&h.manager, FileStatus::Pending).is_empty());

    let timed_out = h
        .manager
        .upload_file(
            &b"late"[..],
            UploadRequest::new("late.bin").with_admission_timeout(Duration::from_millis(20)),
        )
        .await;
    assert!(matches!(timed_out, Err(FileError::Cancelled)));

    first_writer.write_all(b"first content").await.unwrap();
    drop(first_writer);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, FileStatus::Ready);
    assert_eq!(first.byte_size, 13);

    // Slot is free again
    let next = h
        .manager
        .upload_file(&b"next"[..], UploadRequest::new("next.bin"))
        .await
        .unwrap();
    assert_eq!(next.status, FileStatus::Ready);
    assert_eq!(h.manager.list_files(&FileFilter::default()).len(), 2);
}

#[tokio::test]
async fn test_second_upload_waits_for_slot() {
    let h = harness(|c| c.concurrent_uploads = 1);

    let (mut first_writer, first_reader) = tokio::io::duplex(1024);
    let first = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        async move {
            manager
                .upload_file(first_reader, UploadRequest::new("a.bin"))
                .await
        }
    });
    wait_for(|| with_status(&h.manager, FileStatus::Uploading).len() == 1).await;
    let first_id = with_status(&h.manager, FileStatus::Uploading)[0].id.clone();
    first_writer.write_all(b"first").await.unwrap();

    // B's bytes are already available; only the slot holds it back
    let (mut second_writer, second_reader) = tokio::io::duplex(1024);
    second_writer.write_all(b"second upload").await.unwrap();
    let second = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        async move {
            manager
                .upload_file(
                    second_reader,
                    UploadRequest::new("b.bin").with_total_size(13),
                )
                .await
        }
    });
    wait_for(|| with_status(&h.manager, FileStatus::Pending).len() == 1).await;
    let second_id = with_status(&h.manager, FileStatus::Pending)[0].id.clone();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        h.manager.get_file_info(&second_id).unwrap().status,
        FileStatus::Pending
    );
    assert_eq!(
        h.manager
            .get_upload_progress(&second_id)
            .unwrap()
            .bytes_transferred,
        0
    );
    assert_eq!(
        h.manager.get_file_info(&first_id).unwrap().status,
        FileStatus::Uploading
    );

    drop(first_writer);
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status, FileStatus::Ready);
    assert_eq!(first.byte_size, 5);

    wait_for(|| {
        let uploading = h
            .manager
            .get_file_info(&second_id)
            .is_ok_and(|f| f.status == FileStatus::Uploading);
        uploading
            && h.manager
                .get_upload_progress(&second_id)
                .is_some_and(|p| p.bytes_transferred == 13)
    })
    .await;

    drop(second_writer);
    let second = second.await.unwrap().unwrap();
    assert_eq!(second.id, second_id);
    assert_eq!(second.status, FileStatus::Ready);
    assert_eq!(second.byte_size, 13);
    assert_eq!(read_content(&h.manager, &second_id).await, b"second upload");
}

#[tokio::test]
async fn test_cancel_during_transfer_frees_slot() {
    let h = harness(|c| c.concurrent_uploads = 1);

    let cancel = CancellationToken::new();
    let (mut writer, reader) = tokio::io::duplex(1024);
    let upload = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        let cancel = cancel.clone();
        async move {
            manager
                .upload_file(
                    reader,
                    UploadRequest::new("slow.bin")
                        .with_total_size(100)
                        .with_cancel(cancel),
                )
                .await
        }
    });

    writer.write_all(&[7u8; 40]).await.unwrap();
    wait_for(|| {
        with_status(&h.manager, FileStatus::Uploading)
            .first()
            .and_then(|f| h.manager.get_upload_progress(&f.id))
            .is_some_and(|p| p.bytes_transferred == 40)
    })
    .await;

    let id = with_status(&h.manager, FileStatus::Uploading)[0].id.clone();
    let progress = h.manager.get_upload_progress(&id).unwrap();
    assert_eq!(progress.total_bytes, Some(100));
    assert_eq!(progress.percentage, Some(40.0));

    cancel.cancel();
    assert!(matches!(upload.await.unwrap(), Err(FileError::Cancelled)));

    let file = h.manager.get_file_info(&id).unwrap();
    assert_eq!(file.status, FileStatus::Error);
    assert!(h.manager.get_upload_progress(&id).is_none());
    assert!(!Path::new(&file.storage_path).exists());

    let next = h
        .manager
        .upload_file(&b"after"[..], UploadRequest::new("after.bin"))
        .await
        .unwrap();
    assert_eq!(next.status, FileStatus::Ready);
}

#[tokio::test]
async fn test_abandoned_upload_is_marked_error() {
    let h = harness(|_| {});

    let (mut writer, reader) = tokio::io::duplex(1024);
    let upload = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        async move {
            manager
                .upload_file(reader, UploadRequest::new("dropped.bin"))
                .await
        }
    });
    writer.write_all(b"some").await.unwrap();
    wait_for(|| with_status(&h.manager, FileStatus::Uploading).len() == 1).await;
    let id = with_status(&h.manager, FileStatus::Uploading)[0].id.clone();

    upload.abort();
    let _ = upload.await;

    let file = h.manager.get_file_info(&id).unwrap();
    assert_eq!(file.status, FileStatus::Error);
    assert!(h.manager.get_upload_progress(&id).is_none());
}

// ============================================================================
// Processing
// ============================================================================

#[tokio::test]
async fn test_image_gets_thumbnail_and_preview() {
    let h = harness(|_| {});
    let png = sample_png(640, 480);

    let file = h
        .manager
        .upload_file(&png[..], UploadRequest::new("photo.png"))
        .await
        .unwrap();

    assert_eq!(file.file_type, FileType::Image);
    let thumbnail = file.thumbnail.as_ref().unwrap();
    assert_eq!(thumbnail.width, Some(256));
    assert_eq!(thumbnail.height, Some(192));
    assert!(Path::new(&thumbnail.path).starts_with(&h.config.thumbnail_dir));

    // Already within the preview bound, so not resized
    let preview = file.preview.as_ref().unwrap();
    assert_eq!(preview.width, Some(640));
    assert!(Path::new(&preview.path).starts_with(&h.config.preview_dir));
}

#[tokio::test]
async fn test_generator_failure_still_ready() {
    let h = harness(|_| {});

    let file = h
        .manager
        .upload_file(&b"not really a png"[..], UploadRequest::new("broken.png"))
        .await
        .unwrap();

    assert_eq!(file.status, FileStatus::Ready);
    assert!(file.thumbnail.is_none());
    assert!(file.preview.is_none());
}

#[tokio::test]
async fn test_video_is_not_read_for_processing() {
    let h = harness(|_| {});
    let (manager, bytes_read) = counting_manager(&h, h.config.clone());
    let clip = vec![0u8; 8 * 1024 * 1024];

    let file = manager
        .upload_file(&clip[..], UploadRequest::new("clip.mp4"))
        .await
        .unwrap();

    assert_eq!(file.file_type, FileType::Video);
    assert_eq!(file.status, FileStatus::Ready);
    assert!(file.thumbnail.is_none());
    assert!(file.preview.is_none());
    assert_eq!(bytes_read.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_text_preview_reads_only_excerpt() {
    let h = harness(|_| {});
    let (manager, bytes_read) = counting_manager(&h, h.config.clone());
    let text = "line of text\n".repeat(1000);

    let file = manager
        .upload_file(text.as_bytes(), UploadRequest::new("notes.txt"))
        .await
        .unwrap();

    let preview = file.preview.as_ref().unwrap();
    assert_eq!(preview.byte_size, 4096);
    assert_eq!(bytes_read.load(Ordering::SeqCst), 4096);
}

#[tokio::test]
async fn test_threat_detected() {
    let h = harness(|_| {});
    let mut config = h.config.clone();
    config.virus_scan_enabled = true;
    let processing = ProcessingPipeline::new(Arc::clone(&h.store), &config)
        .with_scanner(Arc::new(SignatureScanner));
    let manager = FileManager::new(config, Arc::clone(&h.store), Arc::new(h.db.clone()))
        .unwrap()
        .with_processing(processing);

    let clean = manager
        .upload_file(&b"harmless"[..], UploadRequest::new("notes.txt"))
        .await
        .unwrap();
    assert!(clean.virus_scan.as_ref().unwrap().clean);

    let png = sample_png(32, 32);
    let mut infected = png.clone();
    infected.extend_from_slice(b"EICAR");
    let result = manager
        .upload_file(&infected[..], UploadRequest::new("photo.png"))
        .await;
    let Err(FileError::ThreatDetected { id, threats }) = result else {
        panic!("expected a threat");
    };
    assert_eq!(threats, vec!["Eicar-Test-Signature".to_string()]);

    let file = manager.get_file_info(&id).unwrap();
    assert_eq!(file.status, FileStatus::Error);
    assert!(file.thumbnail.is_none());
    assert!(!file.virus_scan.unwrap().clean);

    // Infected bytes stay until the caller deletes the record
    assert!(Path::new(&file.storage_path).exists());
    manager.delete_file(&id).await.unwrap();
    assert!(!Path::new(&file.storage_path).exists());
}

fn manager_with_scanner(
    h: &Harness,
    fail_closed: bool,
    scanner: Arc<dyn VirusScanner>,
) -> FileManager {
    let mut config = h.config.clone();
    config.virus_scan_enabled = true;
    config.scan_fail_closed = fail_closed;
    let processing = ProcessingPipeline::new(Arc::clone(&h.store), &config).with_scanner(scanner);
    FileManager::new(config, Arc::clone(&h.store), Arc::new(h.db.clone()))
        .unwrap()
        .with_processing(processing)
}

#[tokio::test]
async fn test_scan_failure_fails_open_by_default() {
    let h = harness(|_| {});
    let manager = manager_with_scanner(&h, false, Arc::new(OfflineScanner));

    let file = manager
        .upload_file(&b"unscanned"[..], UploadRequest::new("notes.txt"))
        .await
        .unwrap();
    assert_eq!(file.status, FileStatus::Ready);
    assert!(file.virus_scan.is_none());
    assert!(file.preview.is_some());
}

#[tokio::test]
async fn test_scan_failure_fails_closed() {
    let h = harness(|_| {});
    let manager = manager_with_scanner(&h, true, Arc::new(OfflineScanner));

    let result = manager
        .upload_file(&b"unscanned"[..], UploadRequest::new("notes.txt"))
        .await;
    let Err(FileError::ScanFailed { id, reason }) = result else {
        panic!("expected the scan failure to reject the file");
    };
    assert!(reason.contains("connection refused"));

    let file = manager.get_file_info(&id).unwrap();
    assert_eq!(file.status, FileStatus::Error);
    assert!(file.preview.is_none());
    assert_eq!(h.db.get_file(&id).unwrap().unwrap().status, FileStatus::Error);
}

// ============================================================================
// Mutations
// ============================================================================

#[tokio::test]
async fn test_delete_removes_everything() {
    let h = harness(|_| {});
    let png = sample_png(300, 300);

    let file = h
        .manager
        .upload_file(&png[..], UploadRequest::new("photo.png"))
        .await
        .unwrap();
    let thumbnail = file.thumbnail.clone().unwrap();
    let preview = file.preview.clone().unwrap();

    h.manager.delete_file(&file.id).await.unwrap();

    assert!(matches!(
        h.manager.get_file_info(&file.id),
        Err(FileError::NotFound(_))
    ));
    assert!(matches!(
        h.manager.download_file(&file.id).await,
        Err(FileError::NotFound(_))
    ));
    assert!(!Path::new(&file.storage_path).exists());
    assert!(!Path::new(&thumbnail.path).exists());
    assert!(!Path::new(&preview.path).exists());
    assert!(h.manager.list_files(&FileFilter::default()).is_empty());
    assert_eq!(h.manager.get_stats().total_files, 0);

    let tombstones = h.manager.list_tombstones();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].status, FileStatus::Deleted);
    assert!(tombstones[0].deleted_at.is_some());

    let persisted = h.db.get_file(&file.id).unwrap().unwrap();
    assert_eq!(persisted.status, FileStatus::Deleted);

    assert!(matches!(
        h.manager.delete_file(&file.id).await,
        Err(FileError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_in_flight_is_rejected() {
    let h = harness(|_| {});

    let (writer, reader) = tokio::io::duplex(1024);
    let upload = tokio::spawn({
        let manager = Arc::clone(&h.manager);
        async move {
            manager
                .upload_file(reader, UploadRequest::new("busy.bin"))
                .await
        }
    });
    wait_for(|| with_status(&h.manager, FileStatus::Uploading).len() == 1).await;
    let id = with_status(&h.manager, FileStatus::Uploading)[0].id.clone();

    assert!(matches!(
        h.manager.delete_file(&id).await,
        Err(FileError::InvalidTransition {
            from: FileStatus::Uploading,
            to: FileStatus::Deleted,
            ..
        })
    ));

    drop(writer);
    assert_eq!(upload.await.unwrap().unwrap().status, FileStatus::Ready);
}

#[tokio::test]
async fn test_metadata_merge_and_tag_union() {
    let h = harness(|_| {});

    let file = h
        .manager
        .upload_file(
            &b"data"[..],
            UploadRequest::new("doc.txt")
                .with_metadata([("a".to_string(), json!(1)), ("b".to_string(), json!(2))].into())
                .with_tags(["x"])
                .uploaded_by("alice"),
        )
        .await
        .unwrap();
    assert_eq!(file.uploaded_by.as_deref(), Some("alice"));

    let updated = h
        .manager
        .update_metadata(
            &file.id,
            [("b".to_string(), json!(3)), ("c".to_string(), json!(4))].into(),
        )
        .unwrap();
    let expected: HashMap<String, serde_json::Value> = [
        ("a".to_string(), json!(1)),
        ("b".to_string(), json!(3)),
        ("c".to_string(), json!(4)),
    ]
    .into();
    assert_eq!(updated.metadata, expected);

    let tagged = h.manager.add_tags(&file.id, ["x", "y", " "]).unwrap();
    assert_eq!(
        tagged.tags.iter().map(String::as_str).collect::<Vec<_>>(),
        vec!["x", "y"]
    );

    let rejected = h
        .manager
        .update_metadata(&file.id, [("_system_flag".to_string(), json!(true))].into());
    assert!(matches!(rejected, Err(FileError::Validation(_))));

    let persisted = h.db.get_file(&file.id).unwrap().unwrap();
    assert_eq!(persisted.metadata, expected);
    assert_eq!(persisted.tags, tagged.tags);

    assert!(matches!(
        h.manager.add_tags("missing", ["x"]),
        Err(FileError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_set_permissions() {
    let h = harness(|_| {});
    let file = h
        .manager
        .upload_file(&b"data"[..], UploadRequest::new("shared.txt"))
        .await
        .unwrap();

    let permissions = FilePermissions {
        owner: Some("alice".to_string()),
        public: true,
        shared_with: ["bob".to_string(), "carol".to_string()].into(),
    };
    let updated = h
        .manager
        .set_permissions(&file.id, permissions.clone())
        .unwrap();
    assert_eq!(updated.permissions, Some(permissions));
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_list_filters_and_ordering() {
    let h = harness(|_| {});

    let a = h
        .manager
        .upload_file(&b"alpha"[..], UploadRequest::new("a.txt").with_tags(["keep"]))
        .await
        .unwrap();
    let b = h
        .manager
        .upload_file(&b"fn main() {}"[..], UploadRequest::new("b.rs"))
        .await
        .unwrap();
    let c = h
        .manager
        .upload_file(&b"gamma"[..], UploadRequest::new("c.txt"))
        .await
        .unwrap();

    let all: Vec<String> = h
        .manager
        .list_files(&FileFilter::default())
        .into_iter()
        .map(|f| f.id)
        .collect();
    assert_eq!(all, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

    let code = h.manager.list_files(&FileFilter {
        file_type: Some(FileType::Code),
        ..Default::default()
    });
    assert_eq!(code.len(), 1);
    assert_eq!(code[0].id, b.id);

    let txt = h.manager.list_files(&FileFilter {
        extension: Some(".TXT".to_string()),
        ..Default::default()
    });
    assert_eq!(txt.len(), 2);

    let tagged = h.manager.list_files(&FileFilter {
        tag: Some("keep".to_string()),
        extension: Some("txt".to_string()),
        ..Default::default()
    });
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].id, a.id);
}

#[tokio::test]
async fn test_stats() {
    let h = harness(|c| c.max_file_size = 8);

    h.manager
        .upload_file(&b"one"[..], UploadRequest::new("one.txt"))
        .await
        .unwrap();
    h.manager
        .upload_file(&b"three"[..], UploadRequest::new("three.txt"))
        .await
        .unwrap();
    h.manager
        .upload_file(&b"{}"[..], UploadRequest::new("conf.json"))
        .await
        .unwrap();
    let _ = h
        .manager
        .upload_file(&b"way too large"[..], UploadRequest::new("big.txt"))
        .await;

    let stats = h.manager.get_stats();
    assert_eq!(stats.total_files, 4);
    assert_eq!(stats.total_size, 10);
    assert_eq!(stats.by_type[&FileType::Text].count, 3);
    assert_eq!(stats.by_type[&FileType::Text].total_size, 8);
    assert_eq!(stats.by_type[&FileType::Code].count, 1);
    assert_eq!(stats.by_status[&FileStatus::Ready], 3);
    assert_eq!(stats.by_status[&FileStatus::Error], 1);
}

// ============================================================================
// Versioning
// ============================================================================

#[tokio::test]
async fn test_versions_are_kept_and_trimmed() {
    let h = harness(|c| {
        c.versioning_enabled = true;
        c.max_versions = 2;
    });

    let file = h
        .manager
        .upload_file(&b"one"[..], UploadRequest::new("notes.txt"))
        .await
        .unwrap();
    let first_path = file.storage_path.clone();

    for content in ["two", "three", "four"] {
        h.manager
            .upload_version(&file.id, content.as_bytes(), TransferOptions::default())
            .await
            .unwrap();
    }

    let current = h.manager.get_file_info(&file.id).unwrap();
    assert_eq!(current.status, FileStatus::Ready);
    assert_eq!(current.byte_size, 4);
    assert_eq!(
        current.versions.iter().map(|v| v.version).collect::<Vec<_>>(),
        vec![2, 3]
    );
    assert_eq!(current.versions[1].byte_size, 5);
    assert!(!Path::new(&first_path).exists());
    assert!(current
        .versions
        .iter()
        .all(|v| Path::new(&v.storage_path).exists()));
    assert_eq!(read_content(&h.manager, &file.id).await, b"four");

    h.manager.delete_file(&file.id).await.unwrap();
    assert!(current
        .versions
        .iter()
        .all(|v| !Path::new(&v.storage_path).exists()));
}

#[tokio::test]
async fn test_versioning_disabled() {
    let h = harness(|_| {});
    let file = h
        .manager
        .upload_file(&b"one"[..], UploadRequest::new("notes.txt"))
        .await
        .unwrap();

    let result = h
        .manager
        .upload_version(&file.id, &b"two"[..], TransferOptions::default())
        .await;
    assert!(matches!(result, Err(FileError::VersioningDisabled)));
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_recovers_records() {
    let h = harness(|_| {});

    let ready = h
        .manager
        .upload_file(&b"kept"[..], UploadRequest::new("kept.txt"))
        .await
        .unwrap();
    let deleted = h
        .manager
        .upload_file(&b"gone"[..], UploadRequest::new("gone.txt"))
        .await
        .unwrap();
    h.manager.delete_file(&deleted.id).await.unwrap();

    let mut interrupted = ready.clone();
    interrupted.id = "interrupted".to_string();
    interrupted.status = FileStatus::Uploading;
    h.db.put_file(&interrupted).unwrap();

    let restarted =
        FileManager::new(h.config.clone(), Arc::clone(&h.store), Arc::new(h.db.clone())).unwrap();

    assert_eq!(
        restarted.get_file_info(&ready.id).unwrap().status,
        FileStatus::Ready
    );
    assert_eq!(
        restarted.get_file_info("interrupted").unwrap().status,
        FileStatus::Error
    );
    assert!(matches!(
        restarted.get_file_info(&deleted.id),
        Err(FileError::NotFound(_))
    ));
    assert_eq!(restarted.list_tombstones().len(), 1);
    assert_eq!(
        h.db.get_file("interrupted").unwrap().unwrap().status,
        FileStatus::Error
    );
}
