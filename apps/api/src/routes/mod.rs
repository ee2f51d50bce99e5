pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;
use crate::transform::handlers;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Transform API
        .route("/api/v1/transforms", post(handlers::handle_start_transform))
        .route(
            "/api/v1/transforms/preview",
            post(handlers::handle_preview_transform),
        )
        .route("/api/v1/transforms/:id", get(handlers::handle_get_transform))
        .route(
            "/api/v1/transforms/:id/cancel",
            post(handlers::handle_cancel_transform),
        )
        .with_state(state)
}
