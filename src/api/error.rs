use crate::services::compression::CompressionError;
use crate::services::file_service::FileError;
use crate::services::metadata_store::StoreError;
use crate::services::preferences::PreferenceError;
use crate::services::storage::StorageError;
use crate::services::transfer::TransferError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    /// Right file, wrong ingress path.
    #[error("Wrong upload path: {0}")]
    WrongPath(String),

    #[error("Length Required")]
    LengthRequired,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage rejected: {0}")]
    BadGateway(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<TransferError> for AppError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::TransportNotEligible { .. } => AppError::WrongPath(e.to_string()),
            TransferError::FileTooLarge { .. } => AppError::PayloadTooLarge(e.to_string()),
            TransferError::Compression(
                CompressionError::UnsupportedAlgorithm(_) | CompressionError::InvalidLevel { .. },
            ) => AppError::BadRequest(e.to_string()),
            TransferError::StorageUnavailable { .. } => AppError::Unavailable(e.to_string()),
            TransferError::StorageRejected(_) => AppError::BadGateway(e.to_string()),
            TransferError::Cancelled => AppError::Conflict(e.to_string()),
            TransferError::Preference(inner) => inner.into(),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<FileError> for AppError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound(id) => AppError::NotFound(format!("File {} not found", id)),
            FileError::NotReady { .. } => AppError::Conflict(e.to_string()),
            FileError::Store(inner) => inner.into(),
            FileError::Storage(StorageError::Unavailable(msg)) => AppError::Unavailable(msg),
            FileError::Storage(inner) => AppError::BadGateway(inner.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => AppError::NotFound(format!("File {} not found", id)),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<CompressionError> for AppError {
    fn from(e: CompressionError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl From<PreferenceError> for AppError {
    fn from(e: PreferenceError) -> Self {
        match e {
            PreferenceError::Invalid(inner) => AppError::BadRequest(inner.to_string()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::WrongPath(msg) => (StatusCode::MISDIRECTED_REQUEST, msg),
            AppError::LengthRequired => (
                StatusCode::LENGTH_REQUIRED,
                "Content-Length header is required".to_string(),
            ),
            AppError::Unavailable(msg) => {
                tracing::warn!("Storage unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
