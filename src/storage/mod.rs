pub mod db;
mod files;
pub mod models;
mod tables;

pub use db::{Database, DatabaseError};
pub use tables::*;

use models::FileRecord;

/// Durability layer for file records. The in-memory tables of a
/// [`FileManager`](crate::manager::FileManager) are authoritative while the
/// process runs; the store lets them survive a restart.
pub trait RecordStore: Send + Sync {
    fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError>;
    fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError>;
    /// Returns whether a record was removed.
    fn delete_file(&self, id: &str) -> Result<bool, DatabaseError>;
    fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError>;
}
