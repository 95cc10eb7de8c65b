//! Background purge of tombstones that have outlived the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::manager::FileManager;
use crate::storage::models::FileRecord;

impl FileManager {
    /// Purge every tombstone older than the retention window relative to
    /// `now`. Returns how many were purged.
    pub fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        let retention_days = self.config().retention_days;
        let Some(cutoff) = retention_cutoff(now, retention_days) else {
            tracing::warn!(retention_days, "Retention window is out of range, nothing expires");
            return 0;
        };

        let expired: Vec<FileRecord> = {
            let mut tables = self.write_tables();
            let ids: Vec<String> = tables
                .tombstones
                .values()
                .filter(|f| f.deleted_at.unwrap_or(f.created_at) < cutoff)
                .map(|f| f.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| tables.tombstones.remove(id))
                .collect()
        };

        let mut purged = 0;
        for file in expired {
            match self.record_store().delete_file(&file.id) {
                Ok(_) => purged += 1,
                Err(e) => {
                    tracing::error!(file_id = %file.id, error = %e, "Failed to purge tombstone, keeping it");
                    self.write_tables().tombstones.insert(file.id.clone(), file);
                }
            }
        }

        if purged > 0 {
            tracing::info!(purged, "Retention sweep purged tombstones");
        }
        purged
    }
}

/// Oldest deletion time still retained at `now`, or `None` when the window
/// reaches before the earliest representable timestamp.
fn retention_cutoff(now: DateTime<Utc>, retention_days: u32) -> Option<DateTime<Utc>> {
    TimeDelta::try_days(i64::from(retention_days)).and_then(|window| now.checked_sub_signed(window))
}

/// Periodic driver for [`FileManager::sweep_once`].
pub struct RetentionSweeper {
    handle: JoinHandle<()>,
}

impl RetentionSweeper {
    /// Sweep every `interval` until `shutdown` is cancelled. The first sweep
    /// runs one interval after start.
    pub fn spawn(
        manager: Arc<FileManager>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Retention sweeper stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.sweep_once(Utc::now());
                    }
                }
            }
        });
        Self { handle }
    }

    /// Wait for the sweeper task to exit after shutdown was requested.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Retention sweeper task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_subtracts_whole_days() {
        let now = Utc::now();
        assert_eq!(retention_cutoff(now, 30), Some(now - TimeDelta::days(30)));
        assert_eq!(retention_cutoff(now, 0), Some(now));
    }

    #[test]
    fn cutoff_out_of_range_is_none() {
        assert_eq!(retention_cutoff(Utc::now(), u32::MAX), None);
    }
}
