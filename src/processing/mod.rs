//! Post-upload derivation of secondary assets.
//!
//! Thumbnails and previews are best-effort: a failing generator produces a
//! warning and leaves the descriptor unset. A virus scan that reports a
//! threat is the one fatal outcome.

mod clamav;
mod image_assets;

pub use clamav::ClamAvScanner;
pub use image_assets::ImageAssetGenerator;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;

use crate::config::FileConfig;
use crate::object_store::{ObjectReader, ObjectStore, ObjectStoreError};
use crate::storage::models::{AssetDescriptor, FileRecord, FileType, VirusScanResult};

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("{0:?} files are not supported by this generator")]
    Unsupported(FileType),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Storage error: {0}")]
    Storage(#[from] ObjectStoreError),
    #[error("Virus scan failed: {0}")]
    Scan(String),
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Encoded bytes of a derived asset, before it is stored
#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub data: Vec<u8>,
    pub mime_type: String,
    pub extension: &'static str,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Produces a thumbnail from a prefix of the stored content.
#[async_trait]
pub trait ThumbnailGenerator: Send + Sync {
    /// How many leading bytes of `file` the generator needs, or `None` when
    /// it would not produce anything for this file.
    fn thumbnail_input(&self, file: &FileRecord) -> Option<u64>;

    async fn thumbnail(
        &self,
        file: &FileRecord,
        data: Bytes,
    ) -> Result<GeneratedAsset, ProcessingError>;
}

/// Produces a preview from a prefix of the stored content.
#[async_trait]
pub trait PreviewGenerator: Send + Sync {
    /// How many leading bytes of `file` the generator needs, or `None` when
    /// it would not produce anything for this file.
    fn preview_input(&self, file: &FileRecord) -> Option<u64>;

    async fn preview(&self, file: &FileRecord, data: Bytes)
        -> Result<GeneratedAsset, ProcessingError>;
}

#[async_trait]
pub trait VirusScanner: Send + Sync {
    /// Scan the stored content as it is read from `content`.
    async fn scan(&self, content: ObjectReader) -> Result<VirusScanResult, ProcessingError>;
}

/// Which stage a warning came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Read,
    Thumbnail,
    Preview,
    VirusScan,
}

/// What the processing stages produced for one file
#[derive(Debug, Default)]
pub struct ProcessingReport {
    pub thumbnail: Option<AssetDescriptor>,
    pub preview: Option<AssetDescriptor>,
    pub virus_scan: Option<VirusScanResult>,
    /// Set when scanning is fail-closed and the scan could not complete
    pub scan_failure: Option<String>,
    pub warnings: Vec<(Stage, ProcessingError)>,
}

impl ProcessingReport {
    /// Threat names when the scan ran and did not come back clean.
    pub fn threats(&self) -> Option<&[String]> {
        self.virus_scan
            .as_ref()
            .filter(|scan| !scan.clean)
            .map(|scan| scan.threats.as_slice())
    }
}

pub struct ProcessingPipeline {
    store: Arc<dyn ObjectStore>,
    thumbnail_dir: PathBuf,
    preview_dir: PathBuf,
    thumbnails: Option<Arc<dyn ThumbnailGenerator>>,
    previews: Option<Arc<dyn PreviewGenerator>>,
    virus_scan_enabled: bool,
    scan_fail_closed: bool,
    scanner: Option<Arc<dyn VirusScanner>>,
}

impl ProcessingPipeline {
    /// Pipeline with the built-in image/text generators enabled per `config`
    /// and no scanner attached.
    pub fn new(store: Arc<dyn ObjectStore>, config: &FileConfig) -> Self {
        let generator = Arc::new(ImageAssetGenerator::default());
        Self {
            store,
            thumbnail_dir: config.thumbnail_dir.clone(),
            preview_dir: config.preview_dir.clone(),
            thumbnails: config
                .generate_thumbnails
                .then(|| generator.clone() as Arc<dyn ThumbnailGenerator>),
            previews: config
                .generate_previews
                .then(|| generator as Arc<dyn PreviewGenerator>),
            virus_scan_enabled: config.virus_scan_enabled,
            scan_fail_closed: config.scan_fail_closed,
            scanner: None,
        }
    }

    pub fn with_thumbnail_generator(mut self, generator: Arc<dyn ThumbnailGenerator>) -> Self {
        self.thumbnails = Some(generator);
        self
    }

    pub fn with_preview_generator(mut self, generator: Arc<dyn PreviewGenerator>) -> Self {
        self.previews = Some(generator);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn VirusScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    /// Run every eligible stage for `file`, whose bytes are already stored at
    /// `file.storage_path`. The scan runs first so that infected content
    /// never reaches a generator. Generators only see the prefix they asked
    /// for, and the file is not read at all when none of them will use it.
    pub async fn run(&self, file: &FileRecord) -> ProcessingReport {
        let mut report = ProcessingReport::default();
        let path = Path::new(&file.storage_path);

        if self.virus_scan_enabled {
            match self.scan(file, path).await {
                Ok(result) if !result.clean => {
                    tracing::warn!(
                        file_id = %file.id,
                        threats = ?result.threats,
                        "Virus scan detected threats"
                    );
                    report.virus_scan = Some(result);
                    return report;
                }
                Ok(result) => report.virus_scan = Some(result),
                Err(e) if self.scan_fail_closed => {
                    tracing::error!(file_id = %file.id, error = %e, "Virus scan failed, rejecting file");
                    report.scan_failure = Some(e.to_string());
                    return report;
                }
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "Virus scan skipped");
                    report.warnings.push((Stage::VirusScan, e));
                }
            }
        }

        let stages = file.file_type.stages();
        let thumbnail = self
            .thumbnails
            .as_ref()
            .filter(|_| stages.thumbnail)
            .and_then(|g| g.thumbnail_input(file).map(|limit| (g, limit)));
        let preview = self
            .previews
            .as_ref()
            .filter(|_| stages.preview)
            .and_then(|g| g.preview_input(file).map(|limit| (g, limit)));

        let wanted = thumbnail
            .iter()
            .map(|(_, limit)| *limit)
            .chain(preview.iter().map(|(_, limit)| *limit))
            .max();
        let Some(wanted) = wanted else {
            tracing::debug!(file_id = %file.id, file_type = ?file.file_type, "No derived assets for file");
            return report;
        };

        let data = match self.store.read_prefix(path, wanted).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                let err = ProcessingError::from(e);
                tracing::warn!(file_id = %file.id, error = %err, "Could not read file for processing");
                report.warnings.push((Stage::Read, err));
                return report;
            }
        };

        if let Some((generator, limit)) = thumbnail {
            let produced = generator.thumbnail(file, prefix(&data, limit)).await;
            match self.store_asset(file, produced, &self.thumbnail_dir, "thumb").await {
                Ok(descriptor) => report.thumbnail = Some(descriptor),
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "Thumbnail generation failed");
                    report.warnings.push((Stage::Thumbnail, e));
                }
            }
        }

        if let Some((generator, limit)) = preview {
            let produced = generator.preview(file, prefix(&data, limit)).await;
            match self.store_asset(file, produced, &self.preview_dir, "preview").await {
                Ok(descriptor) => report.preview = Some(descriptor),
                Err(e) => {
                    tracing::warn!(file_id = %file.id, error = %e, "Preview generation failed");
                    report.warnings.push((Stage::Preview, e));
                }
            }
        }

        report
    }

    async fn scan(
        &self,
        file: &FileRecord,
        path: &Path,
    ) -> Result<VirusScanResult, ProcessingError> {
        let Some(scanner) = &self.scanner else {
            tracing::warn!(file_id = %file.id, "Virus scanning enabled but no scanner configured");
            return Err(ProcessingError::Scan("no scanner configured".to_string()));
        };
        let content = self.store.open(path).await?;
        scanner.scan(content).await
    }

    async fn store_asset(
        &self,
        file: &FileRecord,
        produced: Result<GeneratedAsset, ProcessingError>,
        dir: &Path,
        suffix: &str,
    ) -> Result<AssetDescriptor, ProcessingError> {
        let asset = produced?;
        let path = dir.join(format!("{}_{suffix}.{}", file.id, asset.extension));
        let byte_size = self.store.put(&path, &asset.data).await?;

        Ok(AssetDescriptor {
            path: path.to_string_lossy().into_owned(),
            mime_type: asset.mime_type,
            byte_size,
            width: asset.width,
            height: asset.height,
            created_at: Utc::now(),
        })
    }
}

fn prefix(data: &Bytes, limit: u64) -> Bytes {
    let end = usize::try_from(limit).map_or(data.len(), |limit| limit.min(data.len()));
    data.slice(..end)
}
