use thiserror::Error;

use crate::object_store::ObjectStoreError;
use crate::storage::models::FileStatus;
use crate::storage::DatabaseError;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("File exceeds maximum size of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },
    #[error("Upload cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] ObjectStoreError),
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("File {id} is not ready (status: {status})")]
    NotReady { id: String, status: FileStatus },
    #[error("Threat detected in {id}: {}", .threats.join(", "))]
    ThreatDetected { id: String, threats: Vec<String> },
    #[error("Virus scan of {id} could not complete: {reason}")]
    ScanFailed { id: String, reason: String },
    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: FileStatus,
        to: FileStatus,
    },
    #[error("An upload is already in progress for {0}")]
    UploadInProgress(String),
    #[error("Versioning is disabled")]
    VersioningDisabled,
    #[error("Record store error: {0}")]
    Store(#[from] DatabaseError),
}

impl From<std::io::Error> for FileError {
    fn from(e: std::io::Error) -> Self {
        FileError::Io(ObjectStoreError::Io(e))
    }
}
