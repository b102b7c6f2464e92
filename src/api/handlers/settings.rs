use crate::AppState;
use crate::api::error::AppError;
use crate::api::middleware::owner::Owner;
use crate::models::{CompressionAlgorithm, CompressionPreference};
use axum::{Extension, Json, extract::State, http::StatusCode};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Settings that apply to the caller's uploads when no codec is requested.
#[derive(Debug, Serialize, ToSchema)]
pub struct SettingsResponse {
    pub enabled: bool,
    pub compression: CompressionAlgorithm,
    pub level: u32,
    /// False when the server defaults are in effect.
    pub custom: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateSettingsRequest {
    pub compression: String,
    pub level: Option<u32>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

fn effective(state: &AppState, preference: Option<CompressionPreference>) -> SettingsResponse {
    let config = state.coordinator.config();
    match preference {
        Some(p) => SettingsResponse {
            enabled: p.enabled,
            compression: p.algorithm,
            level: p.level.unwrap_or(config.compression_level),
            custom: true,
        },
        None => SettingsResponse {
            enabled: true,
            compression: config.default_compression,
            level: config.compression_level,
            custom: false,
        },
    }
}

#[utoipa::path(
    get,
    path = "/settings",
    responses(
        (status = 200, description = "Effective compression settings", body = SettingsResponse)
    ),
    tag = "settings"
)]
pub async fn get_settings(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> Result<Json<SettingsResponse>, AppError> {
    let preference = state.coordinator.preferences().get(&owner).await?;
    Ok(Json(effective(&state, preference)))
}

#[utoipa::path(
    put,
    path = "/settings",
    request_body = UpdateSettingsRequest,
    responses(
        (status = 200, description = "Saved", body = SettingsResponse),
        (status = 400, description = "Unknown codec or level out of range")
    ),
    tag = "settings"
)]
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<SettingsResponse>, AppError> {
    let algorithm = req.compression.parse::<CompressionAlgorithm>()?;
    let saved = state
        .coordinator
        .preferences()
        .save(&owner, req.enabled, algorithm, req.level)
        .await?;
    Ok(Json(effective(&state, Some(saved))))
}

#[utoipa::path(
    delete,
    path = "/settings",
    responses(
        (status = 204, description = "Back to server defaults")
    ),
    tag = "settings"
)]
pub async fn reset_settings(
    State(state): State<AppState>,
    Extension(Owner(owner)): Extension<Owner>,
) -> Result<StatusCode, AppError> {
    state.coordinator.preferences().clear(&owner).await?;
    Ok(StatusCode::NO_CONTENT)
}
