//! Photo Worker - queue consumer for photo processing
//!
//! Claims processing jobs from the Redis queue and runs the full
//! pipeline per photo: original download, thumbnail + watermarked
//! preview, BlurHash, EXIF extraction, derivative uploads and record
//! persistence. Shuts down gracefully on SIGINT, draining in-flight
//! jobs first.

use photo_service::config::Config;
use photo_service::db::{PgAlbumStore, PgPhotoStore};
use photo_service::queue::{ConsumeOptions, PhotoQueue, QueueConsumer};
use photo_service::services::{ImageProcessor, LogoFetcher, ProcessPhotoHandler};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const PROCESS_QUEUE: &str = "photo-process";

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("photo_worker=info".parse().expect("valid directive"))
                .add_directive("photo_service=info".parse().expect("valid directive")),
        )
        .init();

    info!("Starting Photo Worker");

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env().map_err(|e| format!("{e}"))?;
    info!(
        backend = %config.storage.backend.as_str(),
        bucket = %config.storage.bucket,
        queue_concurrency = config.queue.concurrency,
        "Configuration loaded"
    );

    // Database pool
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&config.database.url)
        .await
        .map_err(|e| format!("database connection failed: {e}"))?;
    info!("Database pool initialized");

    // Redis connection (multiplexed, auto-reconnecting)
    let redis_client =
        redis::Client::open(config.redis.url.clone()).map_err(|e| format!("{e}"))?;
    let redis = ConnectionManager::new(redis_client)
        .await
        .map_err(|e| format!("redis connection failed: {e}"))?;
    info!("Redis connection initialized");

    // Storage adapter
    let storage = storage_adapter::from_config(&config.storage)
        .await
        .map_err(|e| format!("storage init failed: {e}"))?;
    storage
        .health_check()
        .await
        .map_err(|e| format!("storage health check failed: {e}"))?;

    // Processing handler
    let processor = ImageProcessor::new(config.processor.clone());
    let logo_fetcher = LogoFetcher::new(
        Duration::from_secs(config.processor.logo_fetch_timeout_secs),
        config.processor.logo_max_bytes,
    )
    .map_err(|e| format!("{e}"))?;
    let handler = Arc::new(ProcessPhotoHandler::new(
        storage,
        Arc::new(PgPhotoStore::new(pool.clone())),
        Arc::new(PgAlbumStore::new(pool)),
        processor,
        logo_fetcher,
    ));

    // Setup shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to listen for ctrl+c");
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // Queue consumer
    let queue = PhotoQueue::new(redis, &config.redis.namespace, PROCESS_QUEUE);
    let consumer = QueueConsumer::new(
        queue,
        handler,
        ConsumeOptions {
            concurrency: config.queue.concurrency,
            rate_per_second: config.queue.rate_per_second,
            stall_timeout: Duration::from_secs(config.queue.stall_timeout_secs),
            dead_letter_retention: config.queue.dead_letter_retention,
            ..ConsumeOptions::default()
        },
        shutdown_rx,
    );

    consumer.run().await.map_err(|e| format!("{e}"))?;

    info!("Photo Worker stopped");
    Ok(())
}
