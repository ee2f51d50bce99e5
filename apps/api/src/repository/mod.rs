//! Record Repository — the seam between the transformation core and the
//! record store.
//!
//! The core only sees this trait; `AppState` carries an
//! `Arc<dyn RecordRepository>` chosen at startup.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::record::{Record, RecordId};

pub mod postgres;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record {0} not found")]
    NotFound(RecordId),

    #[error("record {0} was modified concurrently")]
    ConcurrentModification(RecordId),

    #[error("record store error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(e: sqlx::Error) -> Self {
        RepositoryError::Backend(e.to_string())
    }
}

#[async_trait]
pub trait RecordRepository: Send + Sync {
    async fn fetch(&self, id: RecordId) -> Result<Record, RepositoryError>;

    /// All records of `record_type` in collection order.
    async fn fetch_all_of_type(&self, record_type: &str) -> Result<Vec<Record>, RepositoryError>;

    /// Writes the record's fields back. Fails with `NotFound` if the id no
    /// longer exists and `ConcurrentModification` if the stored revision moved
    /// since `record` was fetched.
    async fn persist(&self, record: &Record) -> Result<(), RepositoryError>;
}
