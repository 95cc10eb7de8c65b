use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a file derived from its extension and MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Archive,
    Audio,
    Code,
    Document,
    Image,
    Other,
    Text,
    Video,
}

/// Derived-asset stages a file type is eligible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSupport {
    pub thumbnail: bool,
    pub preview: bool,
}

const ARCHIVE_EXTENSIONS: &[&str] = &["7z", "bz2", "gz", "rar", "tar", "tgz", "xz", "zip", "zst"];

const CODE_EXTENSIONS: &[&str] = &[
    "c", "cpp", "cs", "css", "go", "h", "hpp", "html", "java", "js", "json", "kt", "php", "py",
    "rb", "rs", "sh", "sql", "swift", "toml", "ts", "xml", "yaml", "yml",
];

const DOCUMENT_EXTENSIONS: &[&str] = &[
    "csv", "doc", "docx", "odp", "ods", "odt", "pdf", "ppt", "pptx", "rtf", "xls", "xlsx",
];

impl FileType {
    pub const ALL: [FileType; 8] = [
        FileType::Archive,
        FileType::Audio,
        FileType::Code,
        FileType::Document,
        FileType::Image,
        FileType::Other,
        FileType::Text,
        FileType::Video,
    ];

    /// Classify a file from its (lowercase, dotless) extension and MIME type.
    /// Extension lists win over the MIME type so that source files guessed as
    /// `text/*` still classify as code.
    pub fn classify(extension: &str, mime_type: &str) -> Self {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        if ARCHIVE_EXTENSIONS.contains(&ext.as_str()) {
            return FileType::Archive;
        }
        if CODE_EXTENSIONS.contains(&ext.as_str()) {
            return FileType::Code;
        }
        if DOCUMENT_EXTENSIONS.contains(&ext.as_str()) {
            return FileType::Document;
        }

        let (primary, sub) = mime_type.split_once('/').unwrap_or((mime_type, ""));
        match primary {
            "audio" => FileType::Audio,
            "image" => FileType::Image,
            "video" => FileType::Video,
            "text" => match sub {
                "csv" | "rtf" => FileType::Document,
                _ => FileType::Text,
            },
            "application" => match sub {
                "pdf"
                | "msword"
                | "rtf"
                | "vnd.openxmlformats-officedocument.wordprocessingml.document"
                | "vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                | "vnd.openxmlformats-officedocument.presentationml.presentation"
                | "vnd.ms-excel"
                | "vnd.ms-powerpoint" => FileType::Document,
                "zip" | "gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed" => {
                    FileType::Archive
                }
                "json" | "javascript" | "xml" | "x-sh" => FileType::Code,
                _ => FileType::Other,
            },
            _ => FileType::Other,
        }
    }

    /// Fixed stage eligibility table.
    pub const fn stages(self) -> StageSupport {
        match self {
            FileType::Image => StageSupport {
                thumbnail: true,
                preview: true,
            },
            FileType::Document => StageSupport {
                thumbnail: true,
                preview: true,
            },
            FileType::Video => StageSupport {
                thumbnail: true,
                preview: false,
            },
            FileType::Text => StageSupport {
                thumbnail: false,
                preview: true,
            },
            FileType::Archive | FileType::Audio | FileType::Code | FileType::Other => {
                StageSupport {
                    thumbnail: false,
                    preview: false,
                }
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Archive => "archive",
            FileType::Audio => "audio",
            FileType::Code => "code",
            FileType::Document => "document",
            FileType::Image => "image",
            FileType::Other => "other",
            FileType::Text => "text",
            FileType::Video => "video",
        }
    }
}

/// Lifecycle state of a file record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Uploading,
    Processing,
    Ready,
    Error,
    Deleted,
}

impl FileStatus {
    /// `pending -> uploading -> processing -> {ready | error}`, a failed
    /// transfer goes `uploading -> error`, and only settled records can be
    /// deleted.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Uploading)
                | (FileStatus::Uploading, FileStatus::Processing)
                | (FileStatus::Uploading, FileStatus::Error)
                | (FileStatus::Processing, FileStatus::Ready)
                | (FileStatus::Processing, FileStatus::Error)
                | (FileStatus::Ready, FileStatus::Deleted)
                | (FileStatus::Error, FileStatus::Deleted)
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            FileStatus::Pending | FileStatus::Uploading | FileStatus::Processing
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Pending => "pending",
            FileStatus::Uploading => "uploading",
            FileStatus::Processing => "processing",
            FileStatus::Ready => "ready",
            FileStatus::Error => "error",
            FileStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// A derived asset (thumbnail or preview) stored alongside the primary file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub path: String,
    pub mime_type: String,
    pub byte_size: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// A superseded copy of a file's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVersion {
    pub version: u32,
    pub storage_path: String,
    pub byte_size: u64,
    pub content_hash: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilePermissions {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub shared_with: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirusScanResult {
    pub clean: bool,
    #[serde(default)]
    pub threats: Vec<String>,
    pub engine: String,
    pub scanned_at: DateTime<Utc>,
}

/// A file record stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    // Identity
    pub id: String,
    pub name: String,
    pub original_name: String,
    pub storage_path: String,
    pub byte_size: u64,
    pub file_type: FileType,
    pub mime_type: String,
    pub extension: String,
    pub status: FileStatus,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,

    // Caller supplied
    #[serde(default)]
    pub uploaded_by: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    // Derived
    #[serde(default)]
    pub thumbnail: Option<AssetDescriptor>,
    #[serde(default)]
    pub preview: Option<AssetDescriptor>,
    #[serde(default)]
    pub versions: Vec<FileVersion>,
    #[serde(default)]
    pub permissions: Option<FilePermissions>,
    #[serde(default)]
    pub virus_scan: Option<VirusScanResult>,
}

impl FileRecord {
    /// Apply a status transition, refusing anything the lifecycle does not allow.
    pub fn transition(&mut self, next: FileStatus) -> Result<(), (FileStatus, FileStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Live transfer statistics for an in-flight upload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub percentage: Option<f64>,
    /// Bytes per second
    pub speed: f64,
    pub eta_seconds: Option<f64>,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl UploadProgress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        let now = Utc::now();
        Self {
            bytes_transferred: 0,
            total_bytes,
            percentage: total_bytes.filter(|t| *t > 0).map(|_| 0.0),
            speed: 0.0,
            eta_seconds: None,
            started_at: now,
            last_update: now,
        }
    }

    /// Recompute derived figures after `transferred` bytes in `elapsed`.
    pub fn advance(&mut self, transferred: u64, elapsed: Duration) {
        self.bytes_transferred = transferred;
        self.last_update = Utc::now();

        self.percentage = match self.total_bytes {
            Some(total) if total > 0 => Some(transferred as f64 * 100.0 / total as f64),
            _ => None,
        };

        let secs = elapsed.as_secs_f64();
        self.speed = if secs > f64::EPSILON {
            transferred as f64 / secs
        } else {
            0.0
        };

        self.eta_seconds = match self.total_bytes {
            Some(total) if self.speed > 0.0 => {
                Some(total.saturating_sub(transferred) as f64 / self.speed)
            }
            _ => None,
        };
    }
}

/// Predicates for listing files. Every set field must match.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileFilter {
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(default)]
    pub status: Option<FileStatus>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

impl FileFilter {
    pub fn matches(&self, file: &FileRecord) -> bool {
        if self.file_type.is_some_and(|t| t != file.file_type) {
            return false;
        }
        if self.status.is_some_and(|s| s != file.status) {
            return false;
        }
        if let Some(ref ext) = self.extension {
            if !ext.trim_start_matches('.').eq_ignore_ascii_case(&file.extension) {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !file.tags.contains(tag) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeStats {
    pub count: u64,
    pub total_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileStats {
    pub total_files: u64,
    pub total_size: u64,
    pub by_type: BTreeMap<FileType, TypeStats>,
    pub by_status: BTreeMap<FileStatus, u64>,
}
