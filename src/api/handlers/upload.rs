use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::owner::Owner;
use crate::models::{CompressionAlgorithm, IngressRoute};
use crate::services::transfer::{
    CompressionChoice, ReceivedFile, TransferHandle, TransferOutcome, TransferRequest,
};
use crate::utils::format::reduction_percent;
use axum::{
    Extension, Json,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Deserialize, IntoParams)]
pub struct UploadQuery {
    /// Original file name
    pub name: String,
    /// none, zip, gzip, lzma or auto
    pub compression: Option<String>,
    pub level: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub file_id: String,
    pub original_name: String,
    pub original_size: u64,
    pub compression: CompressionAlgorithm,
    pub compressed_size: Option<u64>,
    pub ratio: f64,
    pub reduction_percent: f64,
    pub attempts: u32,
}

impl From<TransferOutcome> for UploadResponse {
    fn from(outcome: TransferOutcome) -> Self {
        Self {
            file_id: outcome.record.id,
            original_name: outcome.record.original_name,
            original_size: outcome.record.original_size,
            compression: outcome.record.compression,
            compressed_size: outcome.record.compressed_size,
            ratio: outcome.ratio,
            reduction_percent: reduction_percent(outcome.ratio),
            attempts: outcome.attempts,
        }
    }
}

#[utoipa::path(
    post,
    path = "/upload",
    params(UploadQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 421, description = "File must use /upload/large"),
        (status = 413, description = "File exceeds the size ceiling"),
        (status = 503, description = "Storage unavailable")
    ),
    tag = "transfers"
)]
pub async fn upload_small(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    ingest(state, owner, IngressRoute::LowCapacity, query, headers, body).await
}

#[utoipa::path(
    post,
    path = "/upload/large",
    params(UploadQuery),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "File stored", body = UploadResponse),
        (status = 413, description = "File exceeds the size ceiling"),
        (status = 503, description = "Storage unavailable")
    ),
    tag = "transfers"
)]
pub async fn upload_large(
    State(state): State<AppState>,
    Extension(owner): Extension<Owner>,
    Query(query): Query<UploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    ingest(state, owner, IngressRoute::HighCapacity, query, headers, body).await
}

fn parse_choice(raw: Option<&str>) -> Result<CompressionChoice, AppError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(CompressionChoice::Default),
        Some(v) if v.eq_ignore_ascii_case("auto") => Ok(CompressionChoice::Auto),
        Some(v) => Ok(CompressionChoice::Explicit(v.parse::<CompressionAlgorithm>()?)),
    }
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"))
}

async fn ingest(
    state: AppState,
    Owner(owner): Owner,
    route: IngressRoute,
    query: UploadQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let declared_size = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or(AppError::LengthRequired)?;

    let name = query.name.trim().to_string();
    if name.is_empty() {
        return Err(AppError::BadRequest("name must not be empty".to_string()));
    }

    // Reject before a single body byte is read
    let coordinator = &state.coordinator;
    coordinator.check_admission(declared_size, route)?;
    let compression = parse_choice(query.compression.as_deref())?;
    coordinator
        .resolve_compression(&owner, &name, declared_size, compression, query.level)
        .await?;

    let file = receive_body(&state, body, declared_size).await?;
    tracing::info!(
        "📥 Received {} ({} bytes) from {} via {:?}",
        name,
        declared_size,
        owner,
        route
    );

    let handle = coordinator.spawn(TransferRequest {
        owner,
        original_name: name,
        declared_size,
        route,
        compression,
        level: query.level,
        file,
    });

    if wants_event_stream(&headers) {
        return Ok(event_stream(handle).into_response());
    }

    // The requester leaving cancels the transfer
    let guard = handle.cancel.clone().drop_guard();
    let outcome = handle.outcome().await;
    guard.disarm();
    Ok((StatusCode::CREATED, Json(UploadResponse::from(outcome?))).into_response())
}

async fn receive_body(
    state: &AppState,
    body: Body,
    declared_size: u64,
) -> Result<ReceivedFile, AppError> {
    let temp_dir = &state.config.temp_dir;
    let io_err = |e: io::Error| AppError::Internal(format!("receiving upload: {}", e));

    tokio::fs::create_dir_all(temp_dir).await.map_err(io_err)?;
    let path = tempfile::Builder::new()
        .prefix("recv-")
        .tempfile_in(temp_dir)
        .map_err(io_err)?
        .into_temp_path();

    let stream = body.into_data_stream().map_err(io::Error::other);
    let mut reader = StreamReader::new(stream).take(declared_size + 1);
    let mut out = tokio::fs::File::create(&path).await.map_err(io_err)?;
    let written = tokio::io::copy(&mut reader, &mut out)
        .await
        .map_err(|e| AppError::BadRequest(format!("upload interrupted: {}", e)))?;
    out.flush().await.map_err(io_err)?;

    if written != declared_size {
        return Err(AppError::BadRequest(format!(
            "received {} bytes but Content-Length was {}",
            written, declared_size
        )));
    }

    Ok(ReceivedFile::new(path))
}

/// Progress as server-sent events. Dropping the stream cancels the transfer.
fn event_stream(
    handle: TransferHandle,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let TransferHandle { events, cancel, .. } = handle;
    let state = (events, Some(cancel.drop_guard()));
    let stream = futures::stream::unfold(state, |(mut events, mut guard)| async move {
        let Some(event) = events.recv().await else {
            // Channel closed: the transfer already finished on its own
            if let Some(guard) = guard.take() {
                guard.disarm();
            }
            return None;
        };
        let sse = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event(event.name()));
        Some((Ok::<_, Infallible>(sse), (events, guard)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
