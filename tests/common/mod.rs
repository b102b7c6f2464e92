#![allow(dead_code)]

use async_trait::async_trait;
use file_relay::config::RelayConfig;
use file_relay::infrastructure::database;
use file_relay::models::IngressRoute;
use file_relay::services::id_generator::{IdGenerator, RandomIdGenerator};
use file_relay::services::metadata_store::MetadataStore;
use file_relay::services::storage::{ObjectReader, StorageAdapter, StorageError};
use file_relay::services::transfer::{
    CompressionChoice, ReceivedFile, TransferCoordinator, TransferRequest,
};
use sea_orm::Database;
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::sync::Notify;

/// In-memory backend whose failures are scripted per call.
pub struct ScriptedStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<VecDeque<StorageError>>,
    always_fail: Mutex<Option<StorageError>>,
    hang: AtomicBool,
    pub put_calls: AtomicU32,
    pub put_started: Notify,
}

impl ScriptedStorage {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            hang: AtomicBool::new(false),
            put_calls: AtomicU32::new(0),
            put_started: Notify::new(),
        }
    }

    /// The next puts fail with these errors, in order.
    pub fn fail_next(&self, errors: Vec<StorageError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn fail_always(&self, error: StorageError) {
        *self.always_fail.lock().unwrap() = Some(error);
    }

    /// Puts never complete.
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageAdapter for ScriptedStorage {
    async fn put(
        &self,
        _name: &str,
        mut reader: ObjectReader,
        _size: u64,
    ) -> Result<String, StorageError> {
        let call = self.put_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.put_started.notify_one();

        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(error) = self.always_fail.lock().unwrap().clone() {
            return Err(error);
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;
        let locator = format!("mock://{}", call);
        self.objects.lock().unwrap().insert(locator.clone(), data);
        Ok(locator)
    }

    async fn get(&self, locator: &str) -> Result<ObjectReader, StorageError> {
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(locator)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(locator.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().remove(locator);
        Ok(())
    }
}

/// Hands out fixed ids first, then a fallback forever.
pub struct ScriptedIds {
    queue: Mutex<VecDeque<String>>,
    fallback: Option<String>,
    random: RandomIdGenerator,
}

impl ScriptedIds {
    pub fn new(ids: &[&str], fallback: Option<&str>) -> Self {
        Self {
            queue: Mutex::new(ids.iter().map(|s| s.to_string()).collect()),
            fallback: fallback.map(str::to_string),
            random: RandomIdGenerator::new(),
        }
    }
}

impl IdGenerator for ScriptedIds {
    fn next_id(&self) -> String {
        if let Some(id) = self.queue.lock().unwrap().pop_front() {
            return id;
        }
        self.fallback
            .clone()
            .unwrap_or_else(|| self.random.next_id())
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: MetadataStore,
    pub storage: Arc<ScriptedStorage>,
    pub coordinator: Arc<TransferCoordinator>,
    pub config: RelayConfig,
}

pub async fn setup_store() -> MetadataStore {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    database::run_migrations(&db).await.unwrap();
    MetadataStore::new(db)
}

pub async fn harness() -> Harness {
    harness_with_ids(Arc::new(RandomIdGenerator::new())).await
}

pub async fn harness_with_ids(ids: Arc<dyn IdGenerator>) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = setup_store().await;
    let storage = Arc::new(ScriptedStorage::new());
    let config = RelayConfig {
        temp_dir: dir.path().join("tmp"),
        upload_retry_base: Duration::from_millis(1),
        ..RelayConfig::development()
    };
    std::fs::create_dir_all(&config.temp_dir).unwrap();

    let coordinator = Arc::new(TransferCoordinator::new(
        store.clone(),
        storage.clone(),
        ids,
        config.clone(),
    ));

    Harness {
        dir,
        store,
        storage,
        coordinator,
        config,
    }
}

impl Harness {
    /// Writes `data` where the ingress handler would have put it.
    pub fn received(&self, data: &[u8]) -> ReceivedFile {
        let path = tempfile::Builder::new()
            .prefix("recv-")
            .tempfile_in(&self.config.temp_dir)
            .unwrap()
            .into_temp_path();
        std::fs::write(&path, data).unwrap();
        ReceivedFile::new(path)
    }

    pub fn request(
        &self,
        name: &str,
        data: &[u8],
        route: IngressRoute,
        compression: CompressionChoice,
        level: Option<u32>,
    ) -> TransferRequest {
        TransferRequest {
            owner: "alice".to_string(),
            original_name: name.to_string(),
            declared_size: data.len() as u64,
            route,
            compression,
            level,
            file: self.received(data),
        }
    }

    pub fn temp_files(&self) -> Vec<PathBuf> {
        list_files(&self.config.temp_dir)
    }
}

pub fn list_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(_) => Vec::new(),
    }
}

pub fn compressible(len: usize) -> Vec<u8> {
    b"timestamp=2024-01-01 level=info msg=\"request served\" status=200\n"
        .iter()
        .cycle()
        .take(len)
        .copied()
        .collect()
}
