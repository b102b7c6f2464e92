use crate::config::{StorageBackend, StorageConfig};
use crate::services::storage::{LocalStorageAdapter, S3StorageAdapter, StorageAdapter};
use anyhow::Context;
use aws_sdk_s3::config::Region;
use std::sync::Arc;
use tracing::info;

pub async fn setup_storage(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageAdapter>> {
    config.validate()?;

    match config.backend {
        StorageBackend::Local => {
            info!("💾 Local storage: {}", config.local_root.display());
            let adapter = LocalStorageAdapter::new(&config.local_root)
                .await
                .context("creating local storage root")?;
            Ok(Arc::new(adapter))
        }
        StorageBackend::S3 => setup_s3(config).await,
    }
}

async fn setup_s3(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageAdapter>> {
    let bucket = config.s3_bucket.clone().context("S3_BUCKET must be set")?;
    let access_key = config
        .s3_access_key
        .clone()
        .context("S3_ACCESS_KEY must be set")?;
    let secret_key = config
        .s3_secret_key
        .clone()
        .context("S3_SECRET_KEY must be set")?;

    info!(
        "☁️  S3 Storage: {} (Bucket: {})",
        config.s3_endpoint.as_deref().unwrap_or("aws default"),
        bucket
    );

    let mut loader = aws_config::from_env()
        .region(Region::new(config.s3_region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ));
    if let Some(endpoint) = &config.s3_endpoint {
        loader = loader.endpoint_url(endpoint);
    }
    let aws_config = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(config.s3_endpoint.is_some())
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);

    match s3_client.head_bucket().bucket(&bucket).send().await {
        Ok(_) => info!("✅ Bucket '{}' is ready", bucket),
        Err(_) => {
            info!("🪣 Bucket '{}' not found, creating...", bucket);
            if let Err(e) = s3_client.create_bucket().bucket(&bucket).send().await {
                tracing::error!("❌ Failed to create bucket '{}': {}", bucket, e);
            } else {
                info!("✅ Bucket '{}' created successfully", bucket);
            }
        }
    }

    Ok(Arc::new(S3StorageAdapter::new(
        s3_client,
        bucket,
        config.s3_part_size,
    )))
}
