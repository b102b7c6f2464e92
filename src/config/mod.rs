use crate::models::CompressionAlgorithm;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),
}

/// Pipeline configuration injected into the transfer coordinator
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Directory for received files and compressed artifacts
    pub temp_dir: PathBuf,

    /// Absolute ceiling for a single file in bytes (default: 4 GiB)
    pub max_file_size: u64,

    /// Files at or above this size must arrive on the high-capacity path (default: 50 MiB)
    pub low_capacity_limit: u64,

    /// Codec used when the requester has no preference (default: zip)
    pub default_compression: CompressionAlgorithm,

    /// Codec level used when the requester has no preference (default: 6)
    pub compression_level: u32,

    /// Upload attempts before a transient storage failure becomes fatal (default: 3)
    pub upload_attempts: u32,

    /// First backoff delay between upload attempts, doubled each retry (default: 500 ms)
    pub upload_retry_base: Duration,

    /// Identifier draws before giving up on a colliding insert (default: 5)
    pub id_attempts: u32,

    /// Capacity of each transfer's progress channel (default: 32)
    pub event_buffer: usize,

    /// Age after which orphaned temp files are swept (default: 24)
    pub stale_temp_age_hours: u64,

    /// Metadata database URL (default: "sqlite://file_relay.db?mode=rwc")
    pub database_url: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            temp_dir: env::temp_dir().join("file-relay"),
            max_file_size: 4 * 1024 * 1024 * 1024, // 4 GiB
            low_capacity_limit: 50 * 1024 * 1024,  // 50 MiB
            default_compression: CompressionAlgorithm::Zip,
            compression_level: 6,
            upload_attempts: 3,
            upload_retry_base: Duration::from_millis(500),
            id_attempts: 5,
            event_buffer: 32,
            stale_temp_age_hours: 24,
            database_url: "sqlite://file_relay.db?mode=rwc".to_string(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            temp_dir: env::var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.temp_dir),

            max_file_size: env::var("MAX_FILE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_file_size),

            low_capacity_limit: env::var("LOW_CAPACITY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.low_capacity_limit),

            default_compression: env::var("DEFAULT_COMPRESSION")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.default_compression),

            compression_level: env::var("COMPRESSION_LEVEL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.compression_level),

            upload_attempts: env::var("UPLOAD_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.upload_attempts),

            upload_retry_base: env::var("UPLOAD_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.upload_retry_base),

            id_attempts: env::var("ID_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.id_attempts),

            event_buffer: env::var("EVENT_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.event_buffer),

            stale_temp_age_hours: env::var("STALE_TEMP_AGE_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.stale_temp_age_hours),

            database_url: env::var("DATABASE_URL").unwrap_or(default.database_url),
        }
    }

    /// Create config for development (small limits, fast retries)
    pub fn development() -> Self {
        Self {
            max_file_size: 1024 * 1024 * 1024,
            upload_retry_base: Duration::from_millis(10),
            database_url: "sqlite::memory:".to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_compression == CompressionAlgorithm::None {
            return Err(ConfigError::Invalid(
                "default compression must be zip, gzip or lzma".to_string(),
            ));
        }
        if let Some(range) = self.default_compression.level_range()
            && !range.contains(&self.compression_level)
        {
            return Err(ConfigError::Invalid(format!(
                "compression level {} outside {:?} for {}",
                self.compression_level, range, self.default_compression
            )));
        }
        if self.low_capacity_limit >= self.max_file_size {
            return Err(ConfigError::Invalid(format!(
                "low capacity limit ({}) must be below the file ceiling ({})",
                self.low_capacity_limit, self.max_file_size
            )));
        }
        if self.upload_attempts == 0 || self.id_attempts == 0 {
            return Err(ConfigError::Invalid(
                "attempt counts must be at least 1".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which services a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceMode {
    Api,
    Worker,
    All,
}

impl ServiceMode {
    /// Transfers only ever run inside the API service.
    pub fn runs_api(self) -> bool {
        matches!(self, ServiceMode::Api | ServiceMode::All)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, ServiceMode::Worker | ServiceMode::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    S3,
    Local,
}

/// Object storage settings, including credentials
#[derive(Clone)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub s3_endpoint: Option<String>,
    pub s3_region: String,
    pub s3_bucket: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Multipart part size for S3 uploads (default: 10 MB)
    pub s3_part_size: usize,
    /// Root directory of the local backend
    pub local_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Local,
            s3_endpoint: None,
            s3_region: "us-east-1".to_string(),
            s3_bucket: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_part_size: 10 * 1024 * 1024,
            local_root: PathBuf::from("file_storage"),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            backend: match env::var("STORAGE_BACKEND")
                .map(|v| v.to_lowercase())
                .as_deref()
            {
                Ok("s3") => StorageBackend::S3,
                Ok("local") => StorageBackend::Local,
                _ => default.backend,
            },
            s3_endpoint: env::var("S3_ENDPOINT").ok(),
            s3_region: env::var("S3_REGION").unwrap_or(default.s3_region),
            s3_bucket: env::var("S3_BUCKET").ok(),
            s3_access_key: env::var("S3_ACCESS_KEY").ok(),
            s3_secret_key: env::var("S3_SECRET_KEY").ok(),
            s3_part_size: env::var("S3_PART_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.s3_part_size),
            local_root: env::var("LOCAL_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.local_root),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == StorageBackend::S3 {
            if self.s3_bucket.is_none() {
                return Err(ConfigError::Missing("S3_BUCKET"));
            }
            if self.s3_access_key.is_none() || self.s3_secret_key.is_none() {
                return Err(ConfigError::Missing("S3_ACCESS_KEY/S3_SECRET_KEY"));
            }
            // S3 rejects multipart parts below 5 MiB except the last one
            if self.s3_part_size < 5 * 1024 * 1024 {
                return Err(ConfigError::Invalid(
                    "S3 part size must be at least 5 MiB".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let masked = |v: &Option<String>| if v.is_some() { "***" } else { "not set" };
        f.debug_struct("StorageConfig")
            .field("backend", &self.backend)
            .field("s3_endpoint", &self.s3_endpoint)
            .field("s3_region", &self.s3_region)
            .field("s3_bucket", &self.s3_bucket)
            .field("s3_access_key", &masked(&self.s3_access_key))
            .field("s3_secret_key", &masked(&self.s3_secret_key))
            .field("s3_part_size", &self.s3_part_size)
            .field("local_root", &self.local_root)
            .finish()
    }
}
