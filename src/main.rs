use clap::Parser;
use dotenvy::dotenv;
use file_relay::config::{RelayConfig, ServiceMode, StorageConfig};
use file_relay::infrastructure::{database, storage};
use file_relay::services::file_service::FileService;
use file_relay::services::id_generator::RandomIdGenerator;
use file_relay::services::metadata_store::MetadataStore;
use file_relay::services::transfer::TransferCoordinator;
use file_relay::services::worker::BackgroundWorker;
use file_relay::utils::format::format_file_size;
use file_relay::{AppState, create_app};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Service type to run (api, worker, all)
    #[arg(short, long, value_enum, default_value_t = ServiceMode::All)]
    mode: ServiceMode,

    /// Port for the API server
    #[arg(short, long, default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "file_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("🚀 Starting File Relay [Mode: {:?}]...", args.mode);

    let config = RelayConfig::from_env();
    config.validate()?;
    let storage_config = StorageConfig::from_env();
    info!(
        "🛡️  Relay Config: Ceiling={}, Low-capacity limit={}, Default codec={} level {}",
        format_file_size(config.max_file_size),
        format_file_size(config.low_capacity_limit),
        config.default_compression,
        config.compression_level
    );
    info!("🗄️  Storage Config: {:?}", storage_config);

    let db = database::setup_database(&config.database_url).await?;
    let store = MetadataStore::new(db);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();

    let mut running_transfers = None;

    if args.mode.runs_api() {
        database::recover_interrupted(&store, args.mode).await?;

        let storage_adapter = storage::setup_storage(&storage_config).await?;

        let coordinator = Arc::new(TransferCoordinator::new(
            store.clone(),
            storage_adapter.clone(),
            Arc::new(RandomIdGenerator::new()),
            config.clone(),
        ));
        running_transfers = Some(coordinator.clone());
        let files = Arc::new(FileService::new(
            store.clone(),
            storage_adapter,
            config.temp_dir.clone(),
        ));

        let state = AppState {
            store,
            coordinator,
            files,
            config: config.clone(),
        };

        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("unknown");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                info!("📥 {} {}", request.method(), request.uri());
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    info!(
                        "📤 Finished in {:?} with status {}",
                        latency,
                        response.status()
                    );
                },
            );

        let app = create_app(state).layer(trace_layer);
        let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;

        info!("✅ API Server listening on: http://0.0.0.0:{}", args.port);
        info!(
            "📖 Swagger UI documentation: http://localhost:{}/swagger-ui",
            args.port
        );

        let mut server_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = server_shutdown.changed().await;
                })
                .await
            {
                error!("❌ Server runtime error: {}", e);
            }
        }));
    }

    if args.mode.runs_worker() {
        let mut worker = BackgroundWorker::new(
            config.temp_dir.clone(),
            config.stale_temp_age_hours,
            shutdown_rx.clone(),
        );
        if let Some(coordinator) = running_transfers {
            worker = worker.with_transfers(coordinator);
        }
        handles.push(tokio::spawn(worker.run()));
        info!("👷 Worker service initialized.");
    }

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    info!("🛑 Shutting down relay services...");
    for handle in handles {
        let _ = handle.await;
    }
    info!("👋 Relay exited cleanly.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("⌨️  Ctrl+C received, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("💤 SIGTERM received, initiating graceful shutdown...");
        },
    }
}
