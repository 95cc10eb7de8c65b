//! Shared test helpers for file-ingest unit tests.

use std::sync::Arc;

use crate::config::{Config, FileConfig, NodeConfig, ScannerConfig};
use crate::manager::FileManager;
use crate::object_store::LocalStore;
use crate::storage::Database;
use crate::AppState;

/// File options rooted in a temporary directory, with small limits for tests.
pub fn test_file_config(temp_dir: &tempfile::TempDir) -> FileConfig {
    FileConfig {
        max_file_size: 1024 * 1024, // 1MB for tests
        chunk_size: 1024,
        ..FileConfig::rooted_at(temp_dir.path().join("files"))
    }
}

/// Create a test manager over a temporary database and local object store.
pub fn test_manager(temp_dir: &tempfile::TempDir, files: FileConfig) -> Arc<FileManager> {
    let data_dir = temp_dir.path().join("data");
    let db = Database::open(&data_dir).expect("Failed to open test database");
    let store = LocalStore::new(&files.temp_dir).expect("Failed to create test object store");
    let manager =
        FileManager::new(files, Arc::new(store), Arc::new(db)).expect("Failed to create manager");
    Arc::new(manager)
}

/// Create a test AppState around [`test_manager`].
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    let files = test_file_config(temp_dir);
    let config = Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: temp_dir.path().join("data").to_string_lossy().to_string(),
        },
        files: files.clone(),
        scanner: ScannerConfig::default(),
    };

    Arc::new(AppState {
        config,
        manager: test_manager(temp_dir, files),
    })
}
