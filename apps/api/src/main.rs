mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod repository;
mod routes;
mod state;
#[cfg(test)]
mod test_support;
mod transform;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::{create_pool, ensure_schema};
use crate::llm_client::build_client;
use crate::repository::postgres::PgRecordRepository;
use crate::routes::build_router;
use crate::state::AppState;
use crate::transform::orchestrator::Orchestrator;
use crate::transform::task::RunRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting fieldfill v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;
    ensure_schema(&db).await?;

    // Initialize Redis (reply cache)
    let redis = redis::Client::open(config.redis_url.clone())?;
    info!("Redis client initialized");

    // Initialize S3 / MinIO (exchange archive)
    let s3 = build_s3_client(&config).await;
    info!("S3 client initialized");

    // Text-generation client stack
    let client = build_client(&config, redis, s3);

    let transform_config = config.transform_config();
    info!(
        "Transform settings: max_examples={}, max_prompt_size={}, max_records_per_batch={}, timeout={}s",
        transform_config.max_examples,
        transform_config.max_prompt_size,
        transform_config.max_records_per_batch,
        transform_config.client_timeout.as_secs()
    );
    let orchestrator = Orchestrator::new(
        Arc::new(PgRecordRepository::new(db.clone())),
        client,
        transform_config,
    );

    // Build app state
    let state = AppState {
        db,
        orchestrator,
        runs: RunRegistry::with_retention(Duration::from_secs(config.run_retention_secs)),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "fieldfill-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
