use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::models::record::{Field, Record, RecordId};
use crate::repository::{RecordRepository, RepositoryError};

/// Row shape of the `records` table.
#[derive(Debug, FromRow)]
struct RecordRow {
    id: i64,
    record_type: String,
    container: String,
    fields: Json<Vec<Field>>,
    revision: i64,
    updated_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Record {
            id: row.id,
            record_type: row.record_type,
            container: row.container,
            fields: row.fields.0,
            revision: row.revision,
            updated_at: Some(row.updated_at),
        }
    }
}

/// Postgres-backed record store with optimistic concurrency on `revision`.
#[derive(Clone)]
pub struct PgRecordRepository {
    pool: PgPool,
}

impl PgRecordRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordRepository for PgRecordRepository {
    async fn fetch(&self, id: RecordId) -> Result<Record, RepositoryError> {
        let row: Option<RecordRow> = sqlx::query_as(
            "SELECT id, record_type, container, fields, revision, updated_at FROM records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Record::from).ok_or(RepositoryError::NotFound(id))
    }

    async fn fetch_all_of_type(&self, record_type: &str) -> Result<Vec<Record>, RepositoryError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, record_type, container, fields, revision, updated_at
            FROM records
            WHERE record_type = $1
            ORDER BY id
            "#,
        )
        .bind(record_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Record::from).collect())
    }

    async fn persist(&self, record: &Record) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET fields = $1, revision = revision + 1, updated_at = NOW()
            WHERE id = $2 AND revision = $3
            "#,
        )
        .bind(Json(&record.fields))
        .bind(record.id)
        .bind(record.revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            debug!("Persisted record {} (revision {})", record.id, record.revision + 1);
            return Ok(());
        }

        // Nothing updated: either the row is gone or its revision moved on.
        let exists: Option<i64> = sqlx::query_scalar("SELECT revision FROM records WHERE id = $1")
            .bind(record.id)
            .fetch_optional(&self.pool)
            .await?;

        match exists {
            None => Err(RepositoryError::NotFound(record.id)),
            Some(_) => Err(RepositoryError::ConcurrentModification(record.id)),
        }
    }
}
