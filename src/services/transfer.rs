use crate::config::RelayConfig;
use crate::models::{CompressionAlgorithm, FileRecord, IngressRoute, StatusFields, TransferStatus};
use crate::services::compression::{
    CompressedArtifact, CompressionEngine, CompressionError, validate_level,
};
use crate::services::id_generator::IdGenerator;
use crate::services::metadata_store::{MetadataStore, StoreError};
use crate::services::preferences::{PreferenceError, PreferenceStore};
use crate::services::progress::{ProgressNotifier, TransferEvent, stored_summary};
use crate::services::storage::{ObjectReader, StorageAdapter, StorageError};
use crate::utils::format::sanitize_filename;
use dashmap::{DashMap, DashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{size} byte file must use the high-capacity path (limit {limit} bytes)")]
    TransportNotEligible { size: u64, limit: u64 },

    #[error("{size} byte file exceeds the {limit} byte ceiling")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("Compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("Storage unavailable after {attempts} attempts: {reason}")]
    StorageUnavailable { attempts: u32, reason: String },

    #[error("Storage rejected upload: {0}")]
    StorageRejected(String),

    #[error("No unused identifier after {attempts} attempts")]
    IdentifierExhaustion { attempts: u32 },

    #[error("Metadata store error: {0}")]
    Store(#[from] StoreError),

    #[error("Owner preference error: {0}")]
    Preference(#[from] PreferenceError),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransferError {
    /// Internal contract breaches, as opposed to bad input or backend trouble.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            TransferError::IdentifierExhaustion { .. } | TransferError::Store(_)
        )
    }
}

/// A fully received inbound file. Removed from disk when dropped.
#[derive(Debug)]
pub struct ReceivedFile {
    path: TempPath,
}

impl ReceivedFile {
    pub fn new(path: TempPath) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// How the requester picked a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionChoice {
    /// The owner's saved preference, else the configured default codec.
    Default,
    /// [`CompressionAlgorithm::recommend`] decides from name and size.
    Auto,
    Explicit(CompressionAlgorithm),
}

#[derive(Debug)]
pub struct TransferRequest {
    pub owner: String,
    pub original_name: String,
    pub declared_size: u64,
    pub route: IngressRoute,
    pub compression: CompressionChoice,
    pub level: Option<u32>,
    pub file: ReceivedFile,
}

#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub record: FileRecord,
    pub ratio: f64,
    pub attempts: u32,
}

/// A transfer running on its own task.
pub struct TransferHandle {
    pub events: mpsc::Receiver<TransferEvent>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<TransferOutcome, TransferError>>,
}

impl TransferHandle {
    pub async fn outcome(self) -> Result<TransferOutcome, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Io(io::Error::other(format!("transfer task: {}", e))))?
    }
}

/// Drives one file through admission, compression, upload and commit.
pub struct TransferCoordinator {
    store: MetadataStore,
    preferences: PreferenceStore,
    storage: Arc<dyn StorageAdapter>,
    ids: Arc<dyn IdGenerator>,
    engine: CompressionEngine,
    config: RelayConfig,
    active: DashMap<String, CancellationToken>,
    in_use: DashSet<PathBuf>,
}

impl TransferCoordinator {
    pub fn new(
        store: MetadataStore,
        storage: Arc<dyn StorageAdapter>,
        ids: Arc<dyn IdGenerator>,
        config: RelayConfig,
    ) -> Self {
        Self {
            preferences: PreferenceStore::new(store.connection().clone()),
            store,
            storage,
            ids,
            engine: CompressionEngine::new(config.temp_dir.clone()),
            config,
            active: DashMap::new(),
            in_use: DashSet::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    pub fn check_admission(&self, size: u64, route: IngressRoute) -> Result<(), TransferError> {
        if size > self.config.max_file_size {
            return Err(TransferError::FileTooLarge {
                size,
                limit: self.config.max_file_size,
            });
        }
        if route == IngressRoute::LowCapacity && size >= self.config.low_capacity_limit {
            return Err(TransferError::TransportNotEligible {
                size,
                limit: self.config.low_capacity_limit,
            });
        }
        Ok(())
    }

    /// Settles the codec and level for an upload by `owner`.
    ///
    /// A requested level wins over the owner's saved level, which wins over the
    /// configured one.
    pub async fn resolve_compression(
        &self,
        owner: &str,
        name: &str,
        size: u64,
        choice: CompressionChoice,
        level: Option<u32>,
    ) -> Result<(CompressionAlgorithm, Option<u32>), TransferError> {
        let (algorithm, saved_level) = match choice {
            CompressionChoice::Default => match self.preferences.get(owner).await? {
                Some(pref) if !pref.enabled => (CompressionAlgorithm::None, None),
                Some(pref) => (pref.algorithm, pref.level),
                None => (self.config.default_compression, None),
            },
            CompressionChoice::Auto => (CompressionAlgorithm::recommend(name, size), None),
            CompressionChoice::Explicit(algorithm) => (algorithm, None),
        };
        if algorithm == CompressionAlgorithm::None {
            return Ok((algorithm, None));
        }
        let level = level
            .or(saved_level)
            .unwrap_or(self.config.compression_level);
        validate_level(algorithm, level)?;
        Ok((algorithm, Some(level)))
    }

    /// Starts `request` on a new task and returns its event stream.
    pub fn spawn(self: &Arc<Self>, request: TransferRequest) -> TransferHandle {
        let (notifier, events) = ProgressNotifier::channel(self.config.event_buffer);
        let cancel = CancellationToken::new();
        let coordinator = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { coordinator.run(request, &notifier, &token).await });
        TransferHandle {
            events,
            cancel,
            task,
        }
    }

    /// Signals a running transfer. Returns false when `file_id` is not active.
    pub fn cancel(&self, file_id: &str) -> bool {
        match self.active.get(file_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_transfers(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Whether `path` is a received file or artifact of a running transfer.
    pub fn is_in_use(&self, path: &Path) -> bool {
        self.in_use.contains(path)
    }

    pub async fn run(
        &self,
        request: TransferRequest,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let _received = InUse::mark(&self.in_use, request.file.path());
        let prepared = self.prepare(&request, cancel).await;
        let record = match prepared {
            Ok(record) => record,
            Err(e) => {
                warn!("Transfer of {} refused: {}", request.original_name, e);
                notifier.notify(TransferEvent::Failed {
                    file_id: None,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };

        let id = record.id.clone();
        self.active.insert(id.clone(), cancel.clone());
        notifier.notify(TransferEvent::Received {
            file_id: id.clone(),
            original_name: record.original_name.clone(),
            original_size: record.original_size,
        });

        let result = self.drive(&record, &request.file, notifier, cancel).await;
        self.active.remove(&id);

        match result {
            Ok(outcome) => {
                info!(
                    "✅ Stored {} as {} (ratio {:.3}, {} attempt(s))",
                    record.original_name, id, outcome.ratio, outcome.attempts
                );
                notifier.notify(TransferEvent::Stored {
                    file_id: id,
                    ratio: outcome.ratio,
                    summary: stored_summary(
                        outcome.record.original_size,
                        outcome.record.stored_size(),
                        outcome.ratio,
                    ),
                });
                Ok(outcome)
            }
            Err(e) => {
                if e.is_invariant_violation() {
                    error!("Transfer {} failed: {}", id, e);
                } else {
                    warn!("Transfer {} failed: {}", id, e);
                }
                self.mark_failed(&id, &e).await;
                notifier.notify(TransferEvent::Failed {
                    file_id: Some(id),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn prepare(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
    ) -> Result<FileRecord, TransferError> {
        self.check_admission(request.declared_size, request.route)?;
        let (algorithm, level) = self
            .resolve_compression(
                &request.owner,
                &request.original_name,
                request.declared_size,
                request.compression,
                request.level,
            )
            .await?;
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.create_record(request, algorithm, level).await
    }

    async fn create_record(
        &self,
        request: &TransferRequest,
        algorithm: CompressionAlgorithm,
        level: Option<u32>,
    ) -> Result<FileRecord, TransferError> {
        let attempts = self.config.id_attempts;
        for attempt in 1..=attempts {
            let record = FileRecord::pending(
                self.ids.next_id(),
                request.owner.clone(),
                request.original_name.clone(),
                request.declared_size,
                algorithm,
                level,
            );
            match self.store.create(&record).await {
                Ok(()) => return Ok(record),
                Err(StoreError::DuplicateId(id)) => {
                    warn!("Identifier collision on {} (attempt {}/{})", id, attempt, attempts);
                }
                Err(e) => return Err(e.into()),
            }
        }
        error!("Identifier generator exhausted after {} attempts", attempts);
        Err(TransferError::IdentifierExhaustion { attempts })
    }

    async fn drive(
        &self,
        record: &FileRecord,
        file: &ReceivedFile,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        let id = record.id.as_str();
        ensure_active(cancel)?;

        let (artifact, _artifact_in_use) = match record.compression_level {
            Some(level) if record.compression != CompressionAlgorithm::None => {
                self.store
                    .update_status(id, TransferStatus::Compressing, StatusFields::default())
                    .await?;
                notifier.notify(TransferEvent::CompressionStarted {
                    algorithm: record.compression,
                    level,
                });

                let artifact = self
                    .engine
                    .compress(
                        file.path(),
                        &sanitize_filename(&record.original_name),
                        record.compression,
                        level,
                        cancel,
                    )
                    .await
                    .map_err(|e| match e {
                        CompressionError::Cancelled => TransferError::Cancelled,
                        other => other.into(),
                    })?;

                let in_use = InUse::mark(&self.in_use, artifact.path());
                notifier.notify(TransferEvent::CompressionFinished {
                    compressed_size: artifact.compressed_size,
                    ratio: artifact.ratio,
                });
                ensure_active(cancel)?;
                self.store
                    .update_status(
                        id,
                        TransferStatus::Uploading,
                        StatusFields::compressed(artifact.compressed_size),
                    )
                    .await?;
                (artifact, Some(in_use))
            }
            _ => {
                let artifact = self
                    .engine
                    .compress(file.path(), "", CompressionAlgorithm::None, 0, cancel)
                    .await?;
                self.store
                    .update_status(id, TransferStatus::Uploading, StatusFields::default())
                    .await?;
                (artifact, None)
            }
        };

        let (locator, attempts) = self
            .upload_with_retry(record, &artifact, notifier, cancel)
            .await?;
        notifier.notify(TransferEvent::UploadFinished { attempts });

        match self
            .store
            .update_status(id, TransferStatus::Stored, StatusFields::stored(&locator))
            .await
        {
            Ok(stored) => Ok(TransferOutcome {
                ratio: artifact.ratio,
                record: stored,
                attempts,
            }),
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&locator).await {
                    warn!("Could not remove orphaned object {}: {}", locator, cleanup);
                }
                Err(e.into())
            }
        }
    }

    async fn upload_with_retry(
        &self,
        record: &FileRecord,
        artifact: &CompressedArtifact,
        notifier: &ProgressNotifier,
        cancel: &CancellationToken,
    ) -> Result<(String, u32), TransferError> {
        let object_name = match artifact.algorithm.extension() {
            Some(ext) => format!("{}.{}", sanitize_filename(&record.original_name), ext),
            None => sanitize_filename(&record.original_name),
        };
        let max_attempts = self.config.upload_attempts;
        let mut attempt = 1;

        loop {
            notifier.notify(TransferEvent::UploadStarted { attempt });
            let reader: ObjectReader = Box::new(tokio::fs::File::open(artifact.path()).await?);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                result = self.storage.put(&object_name, reader, artifact.compressed_size) => result,
            };

            match result {
                Ok(locator) => return Ok((locator, attempt)),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = self
                        .config
                        .upload_retry_base
                        .saturating_mul(1 << (attempt - 1).min(16));
                    warn!(
                        "Upload of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        record.id, attempt, max_attempts, delay, e
                    );
                    notifier.notify(TransferEvent::UploadRetry {
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        reason: e.to_string(),
                    });
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(StorageError::Unavailable(reason)) => {
                    return Err(TransferError::StorageUnavailable {
                        attempts: attempt,
                        reason,
                    });
                }
                Err(e) => return Err(TransferError::StorageRejected(e.to_string())),
            }
        }
    }

    async fn mark_failed(&self, id: &str, cause: &TransferError) {
        let detail = cause.to_string();
        if let Err(e) = self
            .store
            .update_status(id, TransferStatus::Failed, StatusFields::failed(detail))
            .await
        {
            error!("Could not mark transfer {} failed: {}", id, e);
        }
    }
}

/// Keeps a path in the in-use set until dropped.
struct InUse<'a> {
    set: &'a DashSet<PathBuf>,
    path: PathBuf,
}

impl<'a> InUse<'a> {
    fn mark(set: &'a DashSet<PathBuf>, path: &Path) -> Self {
        set.insert(path.to_path_buf());
        Self {
            set,
            path: path.to_path_buf(),
        }
    }
}

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.path);
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), TransferError> {
    if cancel.is_cancelled() {
        Err(TransferError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::id_generator::RandomIdGenerator;
    use crate::services::storage::LocalStorageAdapter;
    use sea_orm::Database;

    async fn coordinator(dir: &Path) -> TransferCoordinator {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        crate::infrastructure::database::run_migrations(&db).await.unwrap();
        let storage = LocalStorageAdapter::new(dir.join("objects")).await.unwrap();
        let config = RelayConfig {
            temp_dir: dir.join("tmp"),
            ..RelayConfig::development()
        };
        TransferCoordinator::new(
            MetadataStore::new(db),
            Arc::new(storage),
            Arc::new(RandomIdGenerator::new()),
            config,
        )
    }

    #[tokio::test]
    async fn test_admission_boundaries() {
        let dir = tempfile::TempDir::new().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let limit = coordinator.config().low_capacity_limit;
        let ceiling = coordinator.config().max_file_size;

        assert!(coordinator.check_admission(limit - 1, IngressRoute::LowCapacity).is_ok());
        assert!(matches!(
            coordinator.check_admission(limit, IngressRoute::LowCapacity),
            Err(TransferError::TransportNotEligible { .. })
        ));
        assert!(coordinator.check_admission(limit, IngressRoute::HighCapacity).is_ok());
        assert!(coordinator.check_admission(ceiling, IngressRoute::HighCapacity).is_ok());
        assert!(matches!(
            coordinator.check_admission(ceiling + 1, IngressRoute::HighCapacity),
            Err(TransferError::FileTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_compression() {
        let dir = tempfile::TempDir::new().unwrap();
        let coordinator = coordinator(dir.path()).await;

        assert_eq!(
            coordinator
                .resolve_compression("alice", "a.bin", 10, CompressionChoice::Default, None)
                .await
                .unwrap(),
            (CompressionAlgorithm::Zip, Some(6))
        );
        assert_eq!(
            coordinator
                .resolve_compression("alice", "a.log", 10, CompressionChoice::Auto, Some(9))
                .await
                .unwrap(),
            (CompressionAlgorithm::Gzip, Some(9))
        );
        assert_eq!(
            coordinator
                .resolve_compression(
                    "alice",
                    "a.bin",
                    10,
                    CompressionChoice::Explicit(CompressionAlgorithm::None),
                    Some(42)
                )
                .await
                .unwrap(),
            (CompressionAlgorithm::None, None)
        );
        assert!(matches!(
            coordinator
                .resolve_compression(
                    "alice",
                    "a.bin",
                    10,
                    CompressionChoice::Explicit(CompressionAlgorithm::Lzma),
                    Some(10)
                )
                .await,
            Err(TransferError::Compression(CompressionError::InvalidLevel { .. }))
        ));
    }

    #[tokio::test]
    async fn test_default_choice_follows_owner_preference() {
        let dir = tempfile::TempDir::new().unwrap();
        let coordinator = coordinator(dir.path()).await;
        let prefs = coordinator.preferences();

        prefs
            .save("alice", true, CompressionAlgorithm::Lzma, Some(8))
            .await
            .unwrap();
        prefs
            .save("bob", false, CompressionAlgorithm::Gzip, None)
            .await
            .unwrap();

        let resolve = |owner, choice, level| {
            let coordinator = &coordinator;
            async move {
                coordinator
                    .resolve_compression(owner, "a.bin", 10, choice, level)
                    .await
                    .unwrap()
            }
        };
        assert_eq!(
            resolve("alice", CompressionChoice::Default, None).await,
            (CompressionAlgorithm::Lzma, Some(8))
        );
        // A level on the request beats the saved one
        assert_eq!(
            resolve("alice", CompressionChoice::Default, Some(2)).await,
            (CompressionAlgorithm::Lzma, Some(2))
        );
        // Explicit choices ignore the preference
        assert_eq!(
            resolve("alice", CompressionChoice::Explicit(CompressionAlgorithm::Gzip), None).await,
            (CompressionAlgorithm::Gzip, Some(6))
        );
        assert_eq!(
            resolve("bob", CompressionChoice::Default, Some(9)).await,
            (CompressionAlgorithm::None, None)
        );
        assert_eq!(
            resolve("carol", CompressionChoice::Default, None).await,
            (CompressionAlgorithm::Zip, Some(6))
        );
    }

    #[test]
    fn test_invariant_classification() {
        assert!(TransferError::IdentifierExhaustion { attempts: 5 }.is_invariant_violation());
        assert!(!TransferError::Cancelled.is_invariant_violation());
        assert!(!TransferError::StorageRejected("no".into()).is_invariant_violation());
    }
}
