use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

/// Creates the `records` table if it does not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id          BIGINT PRIMARY KEY,
            record_type TEXT NOT NULL,
            container   TEXT NOT NULL DEFAULT '',
            fields      JSONB NOT NULL,
            revision    BIGINT NOT NULL DEFAULT 0,
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create records table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS records_type_idx ON records (record_type, id)")
        .execute(pool)
        .await
        .context("Failed to create records index")?;

    info!("Database schema ready");
    Ok(())
}
