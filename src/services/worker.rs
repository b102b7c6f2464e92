use crate::services::transfer::TransferCoordinator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodically removes orphaned files from the relay's temp directory.
///
/// Received files and artifacts are unlinked by their owners on every normal
/// exit; anything left behind is from a crashed process. Files of transfers
/// running in this process are skipped. A worker-only process cannot see
/// another process's transfers, so its age must exceed the longest transfer.
pub struct BackgroundWorker {
    temp_dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
    transfers: Option<Arc<TransferCoordinator>>,
}

impl BackgroundWorker {
    pub fn new(
        temp_dir: PathBuf,
        max_age_hours: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            temp_dir,
            max_age: Duration::from_secs(max_age_hours * 3600),
            interval: Duration::from_secs(3600),
            shutdown,
            transfers: None,
        }
    }

    /// Never sweep files that `coordinator` is still working on.
    pub fn with_transfers(mut self, coordinator: Arc<TransferCoordinator>) -> Self {
        self.transfers = Some(coordinator);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Temp sweeper started for {}", self.temp_dir.display());

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Temp sweeper shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    let removed = self.sweep_once().await;
                    if removed > 0 {
                        tracing::info!("🧹 Removed {} stale temp file(s)", removed);
                    }
                }
            }
        }
    }

    /// Deletes regular files older than the configured age. Returns how many went.
    pub async fn sweep_once(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                tracing::warn!("Cannot scan {}: {}", self.temp_dir.display(), e);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < self.max_age {
                continue;
            }
            let path = entry.path();
            if self.transfers.as_ref().is_some_and(|t| t.is_in_use(&path)) {
                tracing::debug!("Skipping {} (transfer still running)", path.display());
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }
}
