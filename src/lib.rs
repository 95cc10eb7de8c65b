//! file-ingest - Managed file ingestion with streaming uploads and derived assets
//!
//! This crate accepts uploads as byte streams and turns them into managed records:
//! - Single-pass streaming with size enforcement, progress and content digests
//! - Bounded upload admission with cancellation and timeouts
//! - Thumbnails, previews and optional ClamAV scanning after upload
//! - Versioning, tombstoned deletes and a retention sweeper
//! - redb embedded database for records (ACID, MVCC, crash-safe)
//! - REST API with streaming multipart upload and download

pub mod api;
pub mod config;
pub mod error;
pub mod manager;
pub mod object_store;
pub mod processing;
pub mod retention;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod upload;
pub mod validation;

use std::sync::Arc;

use config::Config;
use manager::FileManager;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub manager: Arc<FileManager>,
}
