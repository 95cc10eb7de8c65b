//! The file manager: owns the record, tombstone and progress tables, the
//! upload admission gate, and drives the upload and processing pipelines.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::config::FileConfig;
use crate::error::FileError;
use crate::object_store::{ObjectReader, ObjectStore};
use crate::processing::{ProcessingPipeline, ProcessingReport};
use crate::storage::models::{
    AssetDescriptor, FileFilter, FilePermissions, FileRecord, FileStats, FileStatus, FileType, FileVersion,
    UploadProgress,
};
use crate::storage::RecordStore;
use crate::upload::{TransferOutcome, UploadPipeline};
use crate::validation::{DefaultValidator, SecurityValidator};

/// Caller-side controls for moving bytes: declared size, cancellation and
/// how long to wait for an admission slot.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Declared total, used only for progress reporting
    pub total_size: Option<u64>,
    pub cancel: CancellationToken,
    pub admission_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub filename: String,
    /// Falls back to a guess from the filename
    pub mime_type: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub uploaded_by: Option<String>,
    pub tags: Vec<String>,
    pub transfer: TransferOptions,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn uploaded_by(mut self, uploader: impl Into<String>) -> Self {
        self.uploaded_by = Some(uploader.into());
        self
    }

    pub fn with_total_size(mut self, total: u64) -> Self {
        self.transfer.total_size = Some(total);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.transfer.cancel = cancel;
        self
    }

    pub fn with_admission_timeout(mut self, timeout: Duration) -> Self {
        self.transfer.admission_timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
pub(crate) struct FileTables {
    /// Every record not yet deleted
    pub(crate) records: HashMap<String, FileRecord>,
    /// Deleted records awaiting the retention sweep
    pub(crate) tombstones: HashMap<String, FileRecord>,
    /// In-flight uploads only
    pub(crate) progress: HashMap<String, UploadProgress>,
}

pub struct FileManager {
    config: FileConfig,
    tables: RwLock<FileTables>,
    admission: Semaphore,
    store: Arc<dyn ObjectStore>,
    records: Arc<dyn RecordStore>,
    validator: Arc<dyn SecurityValidator>,
    upload: UploadPipeline,
    processing: ProcessingPipeline,
}

impl FileManager {
    /// Build a manager over `store` and `records`, creating the configured
    /// directories and loading persisted records. Records left mid-upload by
    /// an earlier process are marked as errors.
    pub fn new(
        config: FileConfig,
        store: Arc<dyn ObjectStore>,
        records: Arc<dyn RecordStore>,
    ) -> Result<Self, FileError> {
        for dir in [
            &config.storage_dir,
            &config.thumbnail_dir,
            &config.preview_dir,
            &config.temp_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }

        let mut tables = FileTables::default();
        for mut file in records.get_all_files()? {
            match file.status {
                FileStatus::Deleted => {
                    tables.tombstones.insert(file.id.clone(), file);
                }
                FileStatus::Uploading | FileStatus::Processing => {
                    tracing::warn!(file_id = %file.id, status = %file.status, "Recovering interrupted upload as error");
                    file.status = FileStatus::Error;
                    file.updated_at = Utc::now();
                    records.put_file(&file)?;
                    tables.records.insert(file.id.clone(), file);
                }
                _ => {
                    tables.records.insert(file.id.clone(), file);
                }
            }
        }
        tracing::info!(
            files = tables.records.len(),
            tombstones = tables.tombstones.len(),
            "Loaded file records"
        );

        Ok(Self {
            admission: Semaphore::new(config.concurrent_uploads.max(1)),
            upload: UploadPipeline::new(config.chunk_size, config.max_file_size),
            processing: ProcessingPipeline::new(Arc::clone(&store), &config),
            validator: Arc::new(DefaultValidator),
            tables: RwLock::new(tables),
            config,
            store,
            records,
        })
    }

    pub fn with_validator(mut self, validator: Arc<dyn SecurityValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_processing(mut self, processing: ProcessingPipeline) -> Self {
        self.processing = processing;
        self
    }

    pub fn config(&self) -> &FileConfig {
        &self.config
    }

    pub(crate) fn read_tables(&self) -> RwLockReadGuard<'_, FileTables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write_tables(&self) -> RwLockWriteGuard<'_, FileTables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_store(&self) -> &dyn RecordStore {
        self.records.as_ref()
    }

    // ========================================================================
    // Upload
    // ========================================================================

    /// Validate, stream, hash and process one upload.
    pub async fn upload_file<R>(
        &self,
        mut source: R,
        request: UploadRequest,
    ) -> Result<FileRecord, FileError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let UploadRequest {
            filename,
            mime_type,
            metadata,
            uploaded_by,
            tags,
            transfer,
        } = request;

        let name = self.validate_filename(&filename)?;
        self.validator
            .validate_request_body(&metadata)
            .map_err(|e| FileError::Validation(e.to_string()))?;
        let tags = self.clean_tags(tags)?;

        let extension = extension_of(&name);
        let mime_type = resolve_mime(mime_type, &name);
        check_type_policy(&self.config, &extension, &mime_type)?;

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let storage_path = self.storage_path_for(&id, &extension, None);
        let record = FileRecord {
            id: id.clone(),
            name,
            original_name: filename,
            storage_path: storage_path.to_string_lossy().into_owned(),
            byte_size: 0,
            file_type: FileType::classify(&extension, &mime_type),
            mime_type,
            extension,
            status: FileStatus::Pending,
            content_hash: None,
            checksum: None,
            created_at: now,
            updated_at: now,
            accessed_at: now,
            deleted_at: None,
            uploaded_by,
            tags,
            metadata,
            thumbnail: None,
            preview: None,
            versions: Vec::new(),
            permissions: None,
            virus_scan: None,
        };

        {
            let mut tables = self.write_tables();
            tables.records.insert(id.clone(), record);
            tables
                .progress
                .insert(id.clone(), UploadProgress::new(transfer.total_size));
        }
        let mut guard = InFlightGuard::new(self, id.clone(), true);

        let _permit = self.admit(&transfer).await?;

        let uploading = self.transition(&id, FileStatus::Uploading)?;
        self.persist_best_effort(&uploading);

        let outcome = self
            .upload
            .run(
                self.store.as_ref(),
                &storage_path,
                &mut source,
                transfer.total_size,
                &transfer.cancel,
                |progress| self.report_progress(&id, progress),
            )
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(file_id = %id, error = %e, "Upload failed");
                guard.settle();
                let failed = self.transition(&id, FileStatus::Error)?;
                self.persist_best_effort(&failed);
                return Err(e);
            }
        };

        let processing = self.update_record(&id, |file| {
            apply_transfer(file, &outcome);
            file.transition(FileStatus::Processing)
                .map_err(|(from, to)| invalid(&file.id, from, to))
        })?;

        let report = self.processing.run(&processing).await;
        let rejected = rejection(&id, &report);

        guard.settle();
        let finished = self.update_record(&id, |file| {
            apply_report(file, report);
            let next = if rejected.is_some() {
                FileStatus::Error
            } else {
                FileStatus::Ready
            };
            file.transition(next)
                .map_err(|(from, to)| invalid(&file.id, from, to))
        })?;
        self.persist_best_effort(&finished);

        if let Some(e) = rejected {
            return Err(e);
        }

        tracing::debug!(file_id = %id, byte_size = finished.byte_size, "Upload complete");
        Ok(finished)
    }

    /// Replace the content of a ready file, keeping the previous content as
    /// a version. The record stays ready throughout.
    pub async fn upload_version<R>(
        &self,
        id: &str,
        mut source: R,
        transfer: TransferOptions,
    ) -> Result<FileRecord, FileError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if !self.config.versioning_enabled {
            return Err(FileError::VersioningDisabled);
        }

        let current = {
            let mut tables = self.write_tables();
            let file = tables
                .records
                .get(id)
                .ok_or_else(|| FileError::NotFound(id.to_string()))?;
            if file.status != FileStatus::Ready {
                return Err(FileError::NotReady {
                    id: id.to_string(),
                    status: file.status,
                });
            }
            let file = file.clone();
            if tables.progress.contains_key(id) {
                return Err(FileError::UploadInProgress(id.to_string()));
            }
            tables
                .progress
                .insert(id.to_string(), UploadProgress::new(transfer.total_size));
            file
        };
        let _guard = InFlightGuard::new(self, id.to_string(), false);

        let _permit = self.admit(&transfer).await?;

        let revision = uuid::Uuid::new_v4().simple().to_string();
        let new_path = self.storage_path_for(id, &current.extension, Some(&revision));
        let outcome = self
            .upload
            .run(
                self.store.as_ref(),
                &new_path,
                &mut source,
                transfer.total_size,
                &transfer.cancel,
                |progress| self.report_progress(id, progress),
            )
            .await?;

        let mut candidate = current;
        candidate.storage_path = new_path.to_string_lossy().into_owned();
        apply_transfer(&mut candidate, &outcome);
        let report = self.processing.run(&candidate).await;

        if let Some(e) = rejection(id, &report) {
            self.remove_quietly(id, &candidate.storage_path, "rejected version")
                .await;
            return Err(e);
        }

        let swapped = {
            let mut tables = self.write_tables();
            match tables.records.get_mut(id) {
                Some(file) if file.status == FileStatus::Ready => {
                    let now = Utc::now();
                    let next_version = file.versions.last().map_or(1, |v| v.version + 1);
                    file.versions.push(FileVersion {
                        version: next_version,
                        storage_path: std::mem::take(&mut file.storage_path),
                        byte_size: file.byte_size,
                        content_hash: file.content_hash.take().unwrap_or_default(),
                        checksum: file.checksum.take().unwrap_or_default(),
                        created_at: now,
                    });
                    let excess = file.versions.len().saturating_sub(self.config.max_versions);
                    let trimmed: Vec<FileVersion> = file.versions.drain(..excess).collect();

                    let stale_assets: Vec<String> = [
                        stale_asset(file.thumbnail.as_ref(), report.thumbnail.as_ref()),
                        stale_asset(file.preview.as_ref(), report.preview.as_ref()),
                    ]
                    .into_iter()
                    .flatten()
                    .collect();

                    file.storage_path = candidate.storage_path.clone();
                    apply_transfer(file, &outcome);
                    apply_report(file, report);
                    file.updated_at = now;
                    Some((file.clone(), trimmed, stale_assets))
                }
                _ => None,
            }
        };

        let Some((file, trimmed, stale_assets)) = swapped else {
            self.remove_quietly(id, &candidate.storage_path, "orphaned version")
                .await;
            return Err(FileError::NotFound(id.to_string()));
        };

        self.persist(&file)?;
        for version in trimmed {
            self.remove_quietly(id, &version.storage_path, "trimmed version")
                .await;
        }
        for path in stale_assets {
            self.remove_quietly(id, &path, "stale derived asset").await;
        }

        tracing::debug!(file_id = %id, versions = file.versions.len(), "Stored new version");
        Ok(file)
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Open a ready file for reading and record the access.
    pub async fn download_file(&self, id: &str) -> Result<(FileRecord, ObjectReader), FileError> {
        let path = {
            let tables = self.read_tables();
            let file = tables
                .records
                .get(id)
                .ok_or_else(|| FileError::NotFound(id.to_string()))?;
            if file.status != FileStatus::Ready {
                return Err(FileError::NotReady {
                    id: id.to_string(),
                    status: file.status,
                });
            }
            PathBuf::from(&file.storage_path)
        };

        let reader = self.store.open(&path).await?;

        let file = self.update_record(id, |file| {
            file.accessed_at = Utc::now();
            Ok(())
        })?;
        self.persist_best_effort(&file);

        Ok((file, reader))
    }

    pub fn get_file_info(&self, id: &str) -> Result<FileRecord, FileError> {
        self.read_tables()
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| FileError::NotFound(id.to_string()))
    }

    /// Matching records, newest first.
    pub fn list_files(&self, filter: &FileFilter) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self
            .read_tables()
            .records
            .values()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        files
    }

    pub fn get_upload_progress(&self, id: &str) -> Option<UploadProgress> {
        self.read_tables().progress.get(id).cloned()
    }

    pub fn get_stats(&self) -> FileStats {
        let tables = self.read_tables();
        let mut stats = FileStats::default();
        for file in tables.records.values() {
            stats.total_files += 1;
            stats.total_size += file.byte_size;
            let by_type = stats.by_type.entry(file.file_type).or_default();
            by_type.count += 1;
            by_type.total_size += file.byte_size;
            *stats.by_status.entry(file.status).or_default() += 1;
        }
        stats
    }

    /// Deleted records still waiting for the retention sweep.
    pub fn list_tombstones(&self) -> Vec<FileRecord> {
        self.read_tables().tombstones.values().cloned().collect()
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Tombstone a settled file and remove its bytes, derived assets and
    /// versions. Removal failures are logged and do not abort the delete.
    pub async fn delete_file(&self, id: &str) -> Result<(), FileError> {
        let tombstone = {
            let mut tables = self.write_tables();
            let file = tables
                .records
                .get_mut(id)
                .ok_or_else(|| FileError::NotFound(id.to_string()))?;
            file.transition(FileStatus::Deleted)
                .map_err(|(from, to)| invalid(id, from, to))?;
            file.deleted_at = Some(Utc::now());

            let tombstone = tables
                .records
                .remove(id)
                .ok_or_else(|| FileError::NotFound(id.to_string()))?;
            tables.progress.remove(id);
            tables.tombstones.insert(id.to_string(), tombstone.clone());
            tombstone
        };

        self.remove_quietly(id, &tombstone.storage_path, "file").await;
        if let Some(ref thumbnail) = tombstone.thumbnail {
            self.remove_quietly(id, &thumbnail.path, "thumbnail").await;
        }
        if let Some(ref preview) = tombstone.preview {
            self.remove_quietly(id, &preview.path, "preview").await;
        }
        for version in &tombstone.versions {
            self.remove_quietly(id, &version.storage_path, "version")
                .await;
        }

        self.persist(&tombstone)?;
        tracing::debug!(file_id = %id, "Deleted file");
        Ok(())
    }

    /// Merge `metadata` into the record; existing keys are overwritten.
    pub fn update_metadata(
        &self,
        id: &str,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<FileRecord, FileError> {
        self.validator
            .validate_request_body(&metadata)
            .map_err(|e| FileError::Validation(e.to_string()))?;

        let file = self.update_record(id, |file| {
            file.metadata.extend(metadata);
            file.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist(&file)?;
        Ok(file)
    }

    /// Union `tags` into the record's tag set.
    pub fn add_tags<I, S>(&self, id: &str, tags: I) -> Result<FileRecord, FileError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags = self.clean_tags(tags.into_iter().map(Into::into).collect())?;
        let file = self.update_record(id, |file| {
            file.tags.extend(tags);
            file.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist(&file)?;
        Ok(file)
    }

    pub fn set_permissions(
        &self,
        id: &str,
        permissions: FilePermissions,
    ) -> Result<FileRecord, FileError> {
        let file = self.update_record(id, |file| {
            file.permissions = Some(permissions);
            file.updated_at = Utc::now();
            Ok(())
        })?;
        self.persist(&file)?;
        Ok(file)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn validate_filename(&self, filename: &str) -> Result<String, FileError> {
        if self.validator.contains_malicious_content(filename) {
            return Err(FileError::Validation(format!(
                "filename '{filename}' is not allowed"
            )));
        }
        let name = self.validator.sanitize_input(filename);
        if name.is_empty() {
            return Err(FileError::Validation(
                "filename is empty after sanitization".to_string(),
            ));
        }
        if self.validator.contains_malicious_content(&name) {
            return Err(FileError::Validation(format!(
                "filename '{name}' is not allowed"
            )));
        }
        Ok(name)
    }

    fn clean_tags(
        &self,
        tags: Vec<String>,
    ) -> Result<BTreeSet<String>, FileError> {
        let mut cleaned = BTreeSet::new();
        for tag in tags {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            if self.validator.contains_malicious_content(tag) {
                return Err(FileError::Validation(format!("tag '{tag}' is not allowed")));
            }
            cleaned.insert(tag.to_string());
        }
        Ok(cleaned)
    }

    fn storage_path_for(&self, id: &str, extension: &str, revision: Option<&str>) -> PathBuf {
        let stem = match revision {
            Some(rev) => format!("{id}-{rev}"),
            None => id.to_string(),
        };
        if extension.is_empty() {
            self.config.storage_dir.join(stem)
        } else {
            self.config.storage_dir.join(format!("{stem}.{extension}"))
        }
    }

    /// Wait for an upload slot, giving up on cancellation or timeout.
    async fn admit(&self, transfer: &TransferOptions) -> Result<SemaphorePermit<'_>, FileError> {
        let timeout = async {
            match transfer.admission_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = transfer.cancel.cancelled() => Err(FileError::Cancelled),
            permit = self.admission.acquire() => permit.map_err(|_| FileError::Cancelled),
            _ = timeout => Err(FileError::Cancelled),
        }
    }

    fn report_progress(&self, id: &str, progress: &UploadProgress) {
        let mut tables = self.write_tables();
        if let Some(entry) = tables.progress.get_mut(id) {
            entry.clone_from(progress);
        }
    }

    /// Mutate an active record under the write lock and return a copy.
    fn update_record<F>(&self, id: &str, mutate: F) -> Result<FileRecord, FileError>
    where
        F: FnOnce(&mut FileRecord) -> Result<(), FileError>,
    {
        let mut tables = self.write_tables();
        let file = tables
            .records
            .get_mut(id)
            .ok_or_else(|| FileError::NotFound(id.to_string()))?;
        mutate(file)?;
        Ok(file.clone())
    }

    fn transition(&self, id: &str, next: FileStatus) -> Result<FileRecord, FileError> {
        self.update_record(id, |file| {
            file.transition(next)
                .map_err(|(from, to)| invalid(&file.id, from, to))
        })
    }

    fn persist(&self, file: &FileRecord) -> Result<(), FileError> {
        self.records.put_file(file)?;
        Ok(())
    }

    fn persist_best_effort(&self, file: &FileRecord) {
        if let Err(e) = self.records.put_file(file) {
            tracing::error!(file_id = %file.id, error = %e, "Failed to persist file record");
        }
    }

    async fn remove_quietly(&self, id: &str, path: &str, what: &str) {
        if path.is_empty() {
            return;
        }
        if let Err(e) = self.store.delete(Path::new(path)).await {
            tracing::warn!(file_id = %id, path = %path, error = %e, "Failed to delete {what}");
        }
    }
}

/// Drops the progress entry when an upload finishes, however it finishes.
/// If the upload future is abandoned before settling, the record is
/// removed (still pending) or marked as an error (mid-transfer).
struct InFlightGuard<'a> {
    manager: &'a FileManager,
    id: String,
    owns_record: bool,
}

impl<'a> InFlightGuard<'a> {
    fn new(manager: &'a FileManager, id: String, owns_record: bool) -> Self {
        Self {
            manager,
            id,
            owns_record,
        }
    }

    fn settle(&mut self) {
        self.owns_record = false;
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let failed = {
            let mut tables = self.manager.write_tables();
            tables.progress.remove(&self.id);
            if !self.owns_record {
                return;
            }
            match tables.records.get(&self.id).map(|f| f.status) {
                Some(FileStatus::Pending) => {
                    tables.records.remove(&self.id);
                    None
                }
                Some(FileStatus::Uploading | FileStatus::Processing) => {
                    tables.records.get_mut(&self.id).and_then(|file| {
                        file.transition(FileStatus::Error).ok()?;
                        Some(file.clone())
                    })
                }
                _ => None,
            }
        };
        if let Some(file) = failed {
            tracing::warn!(file_id = %file.id, "Upload abandoned before completion");
            self.manager.persist_best_effort(&file);
        }
    }
}

fn invalid(id: &str, from: FileStatus, to: FileStatus) -> FileError {
    FileError::InvalidTransition {
        id: id.to_string(),
        from,
        to,
    }
}

fn apply_transfer(file: &mut FileRecord, outcome: &TransferOutcome) {
    file.byte_size = outcome.byte_size;
    file.content_hash = Some(outcome.content_hash.clone());
    file.checksum = Some(outcome.checksum.clone());
}

fn apply_report(file: &mut FileRecord, report: ProcessingReport) {
    file.thumbnail = report.thumbnail;
    file.preview = report.preview;
    file.virus_scan = report.virus_scan;
}

/// Why processing refused the content, if it did.
fn rejection(id: &str, report: &ProcessingReport) -> Option<FileError> {
    if let Some(threats) = report.threats() {
        return Some(FileError::ThreatDetected {
            id: id.to_string(),
            threats: threats.to_vec(),
        });
    }
    report
        .scan_failure
        .as_ref()
        .map(|reason| FileError::ScanFailed {
            id: id.to_string(),
            reason: reason.clone(),
        })
}

/// Path of an existing asset that the new report does not overwrite.
fn stale_asset(old: Option<&AssetDescriptor>, new: Option<&AssetDescriptor>) -> Option<String> {
    let old = old?;
    match new {
        Some(new) if new.path == old.path => None,
        _ => Some(old.path.clone()),
    }
}

fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Determine MIME type: from the caller, or guess from the filename, or fallback
fn resolve_mime(declared: Option<String>, name: &str) -> String {
    declared
        .map(|m| m.trim().to_ascii_lowercase())
        .filter(|m| !m.is_empty() && m != "application/octet-stream")
        .or_else(|| mime_guess::from_path(name).first().map(|m| m.to_string()))
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn normalize_rule(rule: &str) -> String {
    rule.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn block_rule_matches(rule: &str, extension: &str, mime_type: &str) -> bool {
    let rule = normalize_rule(rule);
    rule == "*" || rule == extension || rule == mime_type
}

fn allow_rule_matches(rule: &str, extension: &str, mime_type: &str) -> bool {
    let rule = normalize_rule(rule);
    if rule == "*" || rule == extension || rule == mime_type {
        return true;
    }
    rule.strip_suffix('*')
        .is_some_and(|prefix| !prefix.is_empty() && mime_type.starts_with(prefix))
}

/// Blocked rules win; a non-empty allow list must match.
pub(crate) fn check_type_policy(
    config: &FileConfig,
    extension: &str,
    mime_type: &str,
) -> Result<(), FileError> {
    if let Some(rule) = config
        .blocked_types
        .iter()
        .find(|r| block_rule_matches(r, extension, mime_type))
    {
        return Err(FileError::Validation(format!(
            "file type '{extension}' ({mime_type}) is blocked by rule '{rule}'"
        )));
    }

    if !config.allowed_types.is_empty()
        && !config
            .allowed_types
            .iter()
            .any(|r| allow_rule_matches(r, extension, mime_type))
    {
        return Err(FileError::Validation(format!(
            "file type '{extension}' ({mime_type}) is not allowed"
        )));
    }

    Ok(())
}
