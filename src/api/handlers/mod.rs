mod admin;
mod files;

use crate::api::response::ApiError;
use crate::error::FileError;
use crate::object_store::ObjectStoreError;

pub use admin::{health, stats};
pub use files::{
    add_tags, create_file, create_version, delete_file, download_file, get_file, get_progress,
    list_files, set_permissions, update_metadata,
};

/// Map a FileError to an ApiError
fn file_error(e: FileError) -> ApiError {
    match e {
        FileError::Validation(_) | FileError::VersioningDisabled => {
            ApiError::bad_request(e.to_string())
        }
        FileError::SizeLimitExceeded { .. } => ApiError::payload_too_large(e.to_string()),
        FileError::NotFound(_) | FileError::Io(ObjectStoreError::NotFound(_)) => {
            ApiError::not_found(e.to_string())
        }
        FileError::NotReady { .. }
        | FileError::InvalidTransition { .. }
        | FileError::UploadInProgress(_) => ApiError::conflict(e.to_string()),
        FileError::ThreatDetected { .. } => ApiError::unprocessable(e.to_string()),
        FileError::ScanFailed { .. } => ApiError::unavailable(e.to_string()),
        FileError::Cancelled => ApiError::request_timeout(e.to_string()),
        FileError::Io(_) | FileError::Store(_) => ApiError::internal(e.to_string()),
    }
}
