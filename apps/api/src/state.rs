use sqlx::PgPool;

use crate::transform::orchestrator::Orchestrator;
use crate::transform::task::RunRegistry;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    /// Used directly only by the health check; records go through the orchestrator's repository.
    pub db: PgPool,
    /// Holds the record repository, the client stack and the run settings.
    pub orchestrator: Orchestrator,
    pub runs: RunRegistry,
}
