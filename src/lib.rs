pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::RelayConfig;
use crate::services::file_service::FileService;
use crate::services::metadata_store::MetadataStore;
use crate::services::transfer::TransferCoordinator;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware::from_fn,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::upload::upload_small,
        api::handlers::upload::upload_large,
        api::handlers::files::list_files,
        api::handlers::files::get_file,
        api::handlers::files::download_file,
        api::handlers::files::delete_file,
        api::handlers::files::cancel_transfer,
        api::handlers::files::get_usage,
        api::handlers::settings::get_settings,
        api::handlers::settings::update_settings,
        api::handlers::settings::reset_settings,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::upload::UploadResponse,
            api::handlers::files::FileResponse,
            api::handlers::files::CancelResponse,
            api::handlers::settings::SettingsResponse,
            api::handlers::settings::UpdateSettingsRequest,
            api::handlers::health::HealthResponse,
            services::file_service::StorageUsage,
            services::progress::TransferEvent,
            models::CompressionAlgorithm,
            models::TransferStatus,
        )
    ),
    tags(
        (name = "transfers", description = "Upload and transfer control endpoints"),
        (name = "files", description = "Stored file lookup endpoints"),
        (name = "settings", description = "Per-owner compression preferences")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub store: MetadataStore,
    pub coordinator: Arc<TransferCoordinator>,
    pub files: Arc<FileService>,
    pub config: RelayConfig,
}

pub fn create_app(state: AppState) -> Router {
    let owned = Router::new()
        .route(
            "/upload",
            post(api::handlers::upload::upload_small).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/upload/large",
            post(api::handlers::upload::upload_large).layer(DefaultBodyLimit::disable()),
        )
        .route("/files", get(api::handlers::files::list_files))
        .route(
            "/files/:id",
            get(api::handlers::files::get_file).delete(api::handlers::files::delete_file),
        )
        .route(
            "/files/:id/download",
            get(api::handlers::files::download_file),
        )
        .route(
            "/files/:id/cancel",
            post(api::handlers::files::cancel_transfer),
        )
        .route("/usage", get(api::handlers::files::get_usage))
        .route(
            "/settings",
            get(api::handlers::settings::get_settings)
                .put(api::handlers::settings::update_settings)
                .delete(api::handlers::settings::reset_settings),
        )
        .layer(from_fn(api::middleware::owner::owner_middleware));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::handlers::health::health_check))
        .merge(owned)
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
