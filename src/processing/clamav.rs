use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use clamav_client::clean;
use clamav_client::tokio::Tcp;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;

use super::{ProcessingError, VirusScanner};
use crate::config::ScannerConfig;
use crate::object_store::ObjectReader;
use crate::storage::models::VirusScanResult;

/// Streams content to a clamd daemon over TCP.
#[derive(Debug, Clone)]
pub struct ClamAvScanner {
    host: String,
    port: u16,
    timeout_secs: u64,
}

impl ClamAvScanner {
    pub fn new(config: &ScannerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout_secs: config.timeout_secs,
        }
    }
}

/// Pull the signature name out of a clamd reply such as
/// `stream: Eicar-Test-Signature FOUND`.
fn threat_name(response: &str) -> String {
    response
        .trim_end_matches('\0')
        .trim()
        .strip_suffix("FOUND")
        .and_then(|rest| rest.rsplit(':').next())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

#[async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, content: ObjectReader) -> Result<VirusScanResult, ProcessingError> {
        let start = Instant::now();
        let address = format!("{}:{}", self.host, self.port);
        let timeout = Duration::from_secs(self.timeout_secs);
        tracing::debug!(address = %address, "Starting ClamAV scan");

        // The client's futures are not Send; drive them on a blocking thread
        // so the content streams to clamd without being buffered here.
        let runtime = Handle::current();
        let scan = tokio::task::spawn_blocking(move || {
            runtime.block_on(async {
                let connection = Tcp {
                    host_address: address.as_str(),
                };
                let response = tokio::time::timeout(
                    timeout,
                    clamav_client::tokio::scan_stream(ReaderStream::new(content), connection, None),
                )
                .await
                .map_err(|_| {
                    ProcessingError::Scan(format!("timed out after {} seconds", timeout.as_secs()))
                })?
                .map_err(|e| ProcessingError::Scan(e.to_string()))?;

                let is_clean =
                    clean(&response).map_err(|e| ProcessingError::Scan(e.to_string()))?;
                let threats = if is_clean {
                    Vec::new()
                } else {
                    vec![threat_name(&String::from_utf8_lossy(&response))]
                };
                Ok::<_, ProcessingError>((is_clean, threats))
            })
        });

        let (is_clean, threats) = scan
            .await
            .map_err(|e| ProcessingError::Task(e.to_string()))??;

        tracing::info!(
            duration_ms = start.elapsed().as_millis() as u64,
            clean = is_clean,
            "ClamAV scan completed"
        );

        Ok(VirusScanResult {
            clean: is_clean,
            threats,
            engine: "clamav".to_string(),
            scanned_at: Utc::now(),
        })
    }
}
