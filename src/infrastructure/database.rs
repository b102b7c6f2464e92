use crate::config::ServiceMode;
use crate::entities::{file_records, owner_settings};
use crate::services::metadata_store::{MetadataStore, StoreError};
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Schema};
use std::time::Duration;
use tracing::{info, warn};

pub async fn setup_database(db_url: &str) -> anyhow::Result<DatabaseConnection> {
    info!("📂 Database: {}", db_url);

    let mut opt = ConnectOptions::new(db_url);
    // Every pooled connection to an in-memory SQLite URL is a separate database
    let max_connections = if db_url.contains(":memory:") { 1 } else { 16 };
    opt.max_connections(max_connections)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .sqlx_logging(true)
        .sqlx_logging_level(log::LevelFilter::Debug);

    let db = Database::connect(opt).await?;

    info!("✅ Database connected successfully");

    run_migrations(&db).await?;

    Ok(db)
}

pub async fn run_migrations(db: &DatabaseConnection) -> anyhow::Result<()> {
    let builder = db.get_database_backend();
    let schema = Schema::new(builder);

    for mut stmt in [
        schema.create_table_from_entity(file_records::Entity),
        schema.create_table_from_entity(owner_settings::Entity),
    ] {
        db.execute(builder.build(stmt.if_not_exists())).await?;
    }

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_file_records_owner ON file_records (owner, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records (status)",
    ] {
        db.execute(sea_orm::Statement::from_string(builder, index.to_string()))
            .await?;
    }

    Ok(())
}

/// Fails records a previous API process left mid-transfer.
///
/// A worker-only process never drives transfers and may share the database
/// with a live API process, so it leaves in-flight records alone.
pub async fn recover_interrupted(
    store: &MetadataStore,
    mode: ServiceMode,
) -> Result<u64, StoreError> {
    if !mode.runs_api() {
        return Ok(0);
    }
    let interrupted = store.fail_interrupted("interrupted by restart").await?;
    if interrupted > 0 {
        warn!("⚠️  Marked {} interrupted transfer(s) as failed", interrupted);
    }
    Ok(interrupted)
}
