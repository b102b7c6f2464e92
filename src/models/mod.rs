use crate::services::compression::CompressionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use utoipa::ToSchema;

/// Codec applied to a file before it is handed to the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zip,
    Gzip,
    Lzma,
}

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "log", "csv", "json", "xml", "html", "css", "js", "py", "md",
];
const PACKED_EXTENSIONS: &[&str] = &["jpg", "png", "mp3", "mp4", "zip", "rar", "7z"];

impl CompressionAlgorithm {
    pub const ALL: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Zip,
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lzma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zip => "zip",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Lzma => "lzma",
        }
    }

    /// Accepted level range, `None` for the pass-through codec.
    pub fn level_range(&self) -> Option<std::ops::RangeInclusive<u32>> {
        match self {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zip | CompressionAlgorithm::Gzip => Some(0..=9),
            // xz presets
            CompressionAlgorithm::Lzma => Some(0..=9),
        }
    }

    /// Extension appended to the stored artifact name.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zip => Some("zip"),
            CompressionAlgorithm::Gzip => Some("gz"),
            CompressionAlgorithm::Lzma => Some("xz"),
        }
    }

    /// Picks a codec from the file name and size.
    ///
    /// Text formats compress best with gzip, already-packed media gains nothing and goes
    /// into a zip for compatibility, and anything over 100 MiB gets lzma.
    pub fn recommend(file_name: &str, size: u64) -> Self {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        if TEXT_EXTENSIONS.contains(&extension.as_str()) {
            CompressionAlgorithm::Gzip
        } else if PACKED_EXTENSIONS.contains(&extension.as_str()) {
            CompressionAlgorithm::Zip
        } else if size > 100 * 1024 * 1024 {
            CompressionAlgorithm::Lzma
        } else {
            CompressionAlgorithm::Zip
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionAlgorithm {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(CompressionAlgorithm::None),
            "zip" => Ok(CompressionAlgorithm::Zip),
            "gzip" | "gz" => Ok(CompressionAlgorithm::Gzip),
            "lzma" | "xz" => Ok(CompressionAlgorithm::Lzma),
            other => Err(CompressionError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// Lifecycle of a persisted file record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Compressing,
    Uploading,
    Stored,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Compressing => "compressing",
            TransferStatus::Uploading => "uploading",
            TransferStatus::Stored => "stored",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Stored | TransferStatus::Failed)
    }

    /// Forward-only transition table. Compressing may be skipped when the
    /// transfer runs without a codec.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Compressing) | (Pending, Uploading) => true,
            (Compressing, Uploading) => true,
            (Uploading, Stored) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "compressing" => Ok(TransferStatus::Compressing),
            "uploading" => Ok(TransferStatus::Uploading),
            "stored" => Ok(TransferStatus::Stored),
            "failed" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}

/// Which delivery path a file arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngressRoute {
    /// Small-message path with a hard size limit.
    LowCapacity,
    /// Streaming path for anything up to the absolute ceiling.
    HighCapacity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct FileRecord {
    pub id: String,
    pub owner: String,
    pub original_name: String,
    pub original_size: u64,
    pub compression: CompressionAlgorithm,
    pub compression_level: Option<u32>,
    pub compressed_size: Option<u64>,
    pub storage_locator: Option<String>,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

impl FileRecord {
    pub fn pending(
        id: String,
        owner: String,
        original_name: String,
        original_size: u64,
        compression: CompressionAlgorithm,
        compression_level: Option<u32>,
    ) -> Self {
        let compression_level = match compression {
            CompressionAlgorithm::None => None,
            _ => compression_level,
        };
        Self {
            id,
            owner,
            original_name,
            original_size,
            compression,
            compression_level,
            compressed_size: None,
            storage_locator: None,
            status: TransferStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error_detail: None,
        }
    }

    /// `compressed / original`; 1.0 for uncompressed or empty files.
    pub fn compression_ratio(&self) -> f64 {
        match self.compressed_size {
            Some(compressed) if self.original_size > 0 => {
                compressed as f64 / self.original_size as f64
            }
            _ => 1.0,
        }
    }

    /// Bytes held by the storage backend for this record.
    pub fn stored_size(&self) -> u64 {
        self.compressed_size.unwrap_or(self.original_size)
    }
}

/// An owner's standing codec choice, used when an upload does not name one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CompressionPreference {
    pub owner: String,
    /// When false, the owner's uploads are stored uncompressed by default.
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    /// Falls back to the configured level when unset.
    pub level: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Optional fields carried by a status update.
#[derive(Debug, Clone, Default)]
pub struct StatusFields {
    pub compressed_size: Option<u64>,
    pub storage_locator: Option<String>,
    pub error_detail: Option<String>,
}

impl StatusFields {
    pub fn compressed(size: u64) -> Self {
        Self {
            compressed_size: Some(size),
            ..Default::default()
        }
    }

    pub fn stored(locator: impl Into<String>) -> Self {
        Self {
            storage_locator: Some(locator.into()),
            ..Default::default()
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            error_detail: Some(detail.into()),
            ..Default::default()
        }
    }
}
