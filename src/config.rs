use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Upper bound accepted for `RETENTION_DAYS` (100 years)
pub const MAX_RETENTION_DAYS: u32 = 36_500;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub files: FileConfig,
    pub scanner: ScannerConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    /// Directory holding the record store
    pub data_dir: String,
}

/// Options consumed by [`FileManager`](crate::manager::FileManager) at construction.
#[derive(Debug, Clone)]
pub struct FileConfig {
    pub storage_dir: PathBuf,
    pub thumbnail_dir: PathBuf,
    pub preview_dir: PathBuf,
    /// Staging area for in-progress writes. Should share a filesystem with
    /// the other directories so publishing is a rename.
    pub temp_dir: PathBuf,
    /// Maximum upload size in bytes; 0 disables the ceiling
    pub max_file_size: u64,
    /// Extensions, MIME types, `image/*` style prefixes, or `*`
    pub allowed_types: Vec<String>,
    /// Extensions, MIME types, or `*`
    pub blocked_types: Vec<String>,
    pub generate_thumbnails: bool,
    pub generate_previews: bool,
    pub virus_scan_enabled: bool,
    /// Reject files whose scan could not complete instead of accepting them
    pub scan_fail_closed: bool,
    pub versioning_enabled: bool,
    pub max_versions: usize,
    pub cleanup_interval: Duration,
    pub retention_days: u32,
    pub chunk_size: usize,
    pub concurrent_uploads: usize,
}

/// clamd connection used when virus scanning is enabled
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub host: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self::rooted_at("./files")
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3310,
            timeout_secs: 30,
        }
    }
}

impl FileConfig {
    /// Default options with every directory placed under `root`.
    pub fn rooted_at<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            storage_dir: root.join("storage"),
            thumbnail_dir: root.join("thumbnails"),
            preview_dir: root.join("previews"),
            temp_dir: root.join("tmp"),
            max_file_size: 100 * 1024 * 1024, // 100MB
            allowed_types: Vec::new(),
            blocked_types: Vec::new(),
            generate_thumbnails: true,
            generate_previews: true,
            virus_scan_enabled: false,
            scan_fail_closed: false,
            versioning_enabled: false,
            max_versions: 10,
            cleanup_interval: Duration::from_secs(3600),
            retention_days: 30,
            chunk_size: 64 * 1024,
            concurrent_uploads: 4,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "CHUNK_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.concurrent_uploads == 0 {
            return Err(ConfigError::ValidationError(
                "CONCURRENT_UPLOADS must be greater than 0".to_string(),
            ));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "CLEANUP_INTERVAL must be greater than 0".to_string(),
            ));
        }
        if self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::ValidationError(format!(
                "RETENTION_DAYS must be at most {MAX_RETENTION_DAYS}"
            )));
        }
        if self.versioning_enabled && self.max_versions == 0 {
            return Err(ConfigError::ValidationError(
                "MAX_VERSIONS must be greater than 0 when versioning is enabled".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            tracing::warn!("MAX_FILE_SIZE is 0, uploads are not size limited");
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let defaults = FileConfig::default();
        let files = FileConfig {
            storage_dir: env_path("STORAGE_DIR", defaults.storage_dir),
            thumbnail_dir: env_path("THUMBNAIL_DIR", defaults.thumbnail_dir),
            preview_dir: env_path("PREVIEW_DIR", defaults.preview_dir),
            temp_dir: env_path("TEMP_DIR", defaults.temp_dir),
            max_file_size: env_parse("MAX_FILE_SIZE", defaults.max_file_size),
            allowed_types: env_list("ALLOWED_TYPES"),
            blocked_types: env_list("BLOCKED_TYPES"),
            generate_thumbnails: env_bool("GENERATE_THUMBNAILS", defaults.generate_thumbnails),
            generate_previews: env_bool("GENERATE_PREVIEWS", defaults.generate_previews),
            virus_scan_enabled: env_bool("VIRUS_SCAN_ENABLED", defaults.virus_scan_enabled),
            scan_fail_closed: env_bool("CLAMAV_FAIL_CLOSED", defaults.scan_fail_closed),
            versioning_enabled: env_bool("VERSIONING_ENABLED", defaults.versioning_enabled),
            max_versions: env_parse("MAX_VERSIONS", defaults.max_versions),
            cleanup_interval: Duration::from_secs(env_parse(
                "CLEANUP_INTERVAL",
                defaults.cleanup_interval.as_secs(),
            )),
            retention_days: env_parse("RETENTION_DAYS", defaults.retention_days),
            chunk_size: env_parse("CHUNK_SIZE", defaults.chunk_size),
            concurrent_uploads: env_parse("CONCURRENT_UPLOADS", defaults.concurrent_uploads),
        };

        let scanner_defaults = ScannerConfig::default();
        let scanner = ScannerConfig {
            host: std::env::var("CLAMAV_HOST").unwrap_or(scanner_defaults.host),
            port: env_parse("CLAMAV_PORT", scanner_defaults.port),
            timeout_secs: env_parse("CLAMAV_TIMEOUT", scanner_defaults.timeout_secs),
        };

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            files,
            scanner,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_DIR cannot be empty".to_string(),
            ));
        }
        self.files.validate()?;
        if self.files.virus_scan_enabled && self.scanner.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "CLAMAV_HOST is required when VIRUS_SCAN_ENABLED=true".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

fn env_list(key: &str) -> Vec<String> {
    std::env::var(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_defaults_are_valid() {
        let config = FileConfig::rooted_at("/srv/files");
        assert_eq!(config.storage_dir, PathBuf::from("/srv/files/storage"));
        assert_eq!(config.temp_dir, PathBuf::from("/srv/files/tmp"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let config = FileConfig {
            chunk_size: 0,
            ..FileConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn versioning_requires_positive_max_versions() {
        let config = FileConfig {
            versioning_enabled: true,
            max_versions: 0,
            ..FileConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retention_days_are_bounded() {
        let config = FileConfig {
            retention_days: MAX_RETENTION_DAYS,
            ..FileConfig::default()
        };
        assert!(config.validate().is_ok());

        let config = FileConfig {
            retention_days: u32::MAX,
            ..FileConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
