use crate::models::{CompressionAlgorithm, FileRecord, TransferStatus};
use crate::services::compression::{CompressionError, decompress_file};
use crate::services::metadata_store::{MetadataStore, StoreError};
use crate::services::storage::{StorageAdapter, StorageError};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use thiserror::Error;
use tracing::{info, warn};
use utoipa::ToSchema;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File {id} is {status}")]
    NotReady { id: String, status: TransferStatus },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A fetched file restored to its original bytes. Deleted on drop.
#[derive(Debug)]
pub struct DownloadedFile {
    path: TempPath,
    pub name: String,
    pub size: u64,
}

impl DownloadedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct StorageUsage {
    pub stored_files: u64,
    pub original_bytes: u64,
    pub stored_bytes: u64,
    pub in_progress: u64,
    pub failed: u64,
}

/// Owner-facing lookup, fetch and delete over stored records.
pub struct FileService {
    store: MetadataStore,
    storage: Arc<dyn StorageAdapter>,
    temp_dir: PathBuf,
}

impl FileService {
    pub fn new(
        store: MetadataStore,
        storage: Arc<dyn StorageAdapter>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            storage,
            temp_dir: temp_dir.into(),
        }
    }

    /// Looks up a record on behalf of `owner`. Records of other owners read as missing.
    pub async fn lookup(&self, id: &str, owner: &str) -> Result<FileRecord, FileError> {
        match self.store.get(id).await {
            Ok(record) if record.owner == owner => Ok(record),
            Ok(_) | Err(StoreError::NotFound(_)) => Err(FileError::NotFound(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<FileRecord>, FileError> {
        Ok(self.store.list_by_owner(owner).await?)
    }

    /// Downloads a stored file and undoes its compression.
    pub async fn fetch(&self, id: &str, owner: &str) -> Result<DownloadedFile, FileError> {
        let record = self.lookup(id, owner).await?;
        let locator = match (&record.status, &record.storage_locator) {
            (TransferStatus::Stored, Some(locator)) => locator.clone(),
            (status, _) => {
                return Err(FileError::NotReady {
                    id: record.id,
                    status: *status,
                });
            }
        };

        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let mut reader = self.storage.get(&locator).await?;
        let fetched = self.temp_path("fetch-")?;
        let mut file = tokio::fs::File::create(&fetched).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        let restored = match record.compression {
            CompressionAlgorithm::None => fetched,
            algorithm => {
                let restored = self.temp_path("restore-")?;
                decompress_file(algorithm, &fetched, &restored).await?;
                restored
            }
        };

        let size = tokio::fs::metadata(&restored).await?.len();
        if size != record.original_size {
            warn!(
                "Fetched {} is {} bytes, record says {}",
                record.id, size, record.original_size
            );
        }

        Ok(DownloadedFile {
            path: restored,
            name: record.original_name,
            size,
        })
    }

    /// Removes the stored object, then the record. In-flight transfers cannot be deleted.
    pub async fn delete(&self, id: &str, owner: &str) -> Result<FileRecord, FileError> {
        let record = self.lookup(id, owner).await?;
        if !record.status.is_terminal() {
            return Err(FileError::NotReady {
                id: record.id,
                status: record.status,
            });
        }
        if let Some(locator) = &record.storage_locator {
            self.storage.delete(locator).await?;
        }
        self.store.delete(&record.id).await?;
        info!("🗑️ Deleted {} ({})", record.id, record.original_name);
        Ok(record)
    }

    pub async fn usage(&self, owner: &str) -> Result<StorageUsage, FileError> {
        let records = self.store.list_by_owner(owner).await?;
        let mut usage = StorageUsage::default();
        for record in &records {
            match record.status {
                TransferStatus::Stored => {
                    usage.stored_files += 1;
                    usage.original_bytes += record.original_size;
                    usage.stored_bytes += record.stored_size();
                }
                TransferStatus::Failed => usage.failed += 1,
                _ => usage.in_progress += 1,
            }
        }
        Ok(usage)
    }

    fn temp_path(&self, prefix: &str) -> io::Result<TempPath> {
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(&self.temp_dir)?
            .into_temp_path())
    }
}
