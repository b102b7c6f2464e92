use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::owner::Owner;
use crate::models::{CompressionAlgorithm, FileRecord, TransferStatus};
use crate::services::file_service::StorageUsage;
use axum::{
    Extension, Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct FileResponse {
    pub id: String,
    pub original_name: String,
    pub original_size: u64,
    pub compression: CompressionAlgorithm,
    pub compression_level: Option<u32>,
    pub compressed_size: Option<u64>,
    pub ratio: f64,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<FileRecord> for FileResponse {
    fn from(record: FileRecord) -> Self {
        Self {
            ratio: record.compression_ratio(),
            id: record.id,
            original_name: record.original_name,
            original_size: record.original_size,
            compression: record.compression,
            compression_level: record.compression_level,
            compressed_size: record.compressed_size,
            status: record.status,
            created_at: record.created_at,
            completed_at: record.completed_at,
            error: record.error_detail,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub file_id: String,
    pub cancelled: bool,
}

#[utoipa::path(
    get,
    path = "/files",
    responses(
        (status = 200, description = "Caller's files, oldest first", body = Vec<FileResponse>)
    ),
    tag = "files"
)]
pub async fn list_files(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> Result<Json<Vec<FileResponse>>, AppError> {
    let records = state.files.list(&owner).await?;
    Ok(Json(records.into_iter().map(FileResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/files/{id}",
    params(("id" = String, Path, description = "File ID")),
    responses(
        (status = 200, description = "File record", body = FileResponse),
        (status = 404, description = "Not found")
    ),
    tag = "files"
)]
pub async fn get_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Json<FileResponse>, AppError> {
    let record = state.files.lookup(&id, &owner).await?;
    Ok(Json(record.into()))
}

#[utoipa::path(
    get,
    path = "/files/{id}/download",
    params(("id" = String, Path, description = "File ID")),
    responses(
        (status = 200, description = "Original file bytes", content_type = "application/octet-stream"),
        (status = 404, description = "Not found"),
        (status = 409, description = "Transfer not finished")
    ),
    tag = "files"
)]
pub async fn download_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let downloaded = state.files.fetch(&id, &owner).await?;
    let file = tokio::fs::File::open(downloaded.path())
        .await
        .map_err(|e| AppError::Internal(format!("opening download: {}", e)))?;

    let disposition = HeaderValue::from_bytes(
        format!("attachment; filename=\"{}\"", downloaded.name.replace('"', "_")).as_bytes(),
    )
    .unwrap_or(HeaderValue::from_static("attachment"));

    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
        (header::CONTENT_DISPOSITION, disposition),
        (header::CONTENT_LENGTH, HeaderValue::from(downloaded.size)),
    ];

    // The open handle keeps the bytes readable after the temp path is unlinked
    drop(downloaded);
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

#[utoipa::path(
    delete,
    path = "/files/{id}",
    params(("id" = String, Path, description = "File ID")),
    responses(
        (status = 204, description = "Deleted"),
        (status = 404, description = "Not found"),
        (status = 409, description = "Transfer still running")
    ),
    tag = "files"
)]
pub async fn delete_file(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.files.delete(&id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/files/{id}/cancel",
    params(("id" = String, Path, description = "File ID")),
    responses(
        (status = 202, description = "Cancellation signalled", body = CancelResponse),
        (status = 404, description = "Not found"),
        (status = 409, description = "Transfer not running")
    ),
    tag = "transfers"
)]
pub async fn cancel_transfer(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CancelResponse>), AppError> {
    let record = state.files.lookup(&id, &owner).await?;
    if !state.coordinator.cancel(&record.id) {
        return Err(AppError::Conflict(format!(
            "File {} has no running transfer ({})",
            record.id, record.status
        )));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            file_id: record.id,
            cancelled: true,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/usage",
    responses(
        (status = 200, description = "Caller's storage totals", body = StorageUsage)
    ),
    tag = "files"
)]
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> Result<Json<StorageUsage>, AppError> {
    Ok(Json(state.files.usage(&owner).await?))
}
