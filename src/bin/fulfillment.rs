//! Order Fulfillment Worker
//!
//! Main worker process for the flash-sale pipeline.
//!
//! This binary:
//! - Connects to Redis (order queue, per-buyer locks)
//! - Connects to `PostgreSQL` and applies schema migrations
//! - Runs the single-threaded fulfillment loop with crash recovery
//!
//! # Usage
//!
//! ```bash
//! # Start infrastructure
//! docker compose up -d
//!
//! # Run worker
//! cargo run --bin fulfillment
//! ```

use flashsale::{Config, FlashLock, FulfillmentWorker, OrderQueue, PgOrderRepository};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flashsale=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting fulfillment worker...");

    // Load configuration
    let config = Config::from_env();
    tracing::info!(
        redis = %config.redis.url,
        postgres = %config.postgres.url,
        stream = %config.queue.stream,
        "Configuration loaded"
    );

    // Shared in-memory store
    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let conn = ConnectionManager::new(redis_client).await?;

    // Durable store
    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout))
        .connect(&config.postgres.url)
        .await?;
    flashsale::orders::migrate(&pool).await?;
    tracing::info!("✓ Database ready");

    // Worker
    let queue = OrderQueue::new(
        conn.clone(),
        config.queue.stream.clone(),
        config.queue.group.clone(),
        config.queue.consumer.clone(),
        config.queue.block_timeout_ms,
    );
    let worker = FulfillmentWorker::new(
        queue,
        FlashLock::new(conn),
        PgOrderRepository::new(pool),
        &config.seckill,
    );

    tracing::info!("✓ Fulfillment worker running, press Ctrl+C to shutdown");

    tokio::select! {
        result = worker.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down gracefully...");
        }
    }

    Ok(())
}
