//! Axum route handlers for the Transform API.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::record::RecordId;
use crate::state::AppState;
use crate::transform::batcher::BatchingStats;
use crate::transform::orchestrator::TransformRequest;
use crate::transform::task::RunSnapshot;

// ────────────────────────────────────────────────────────────────────────────
// Response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StartTransformResponse {
    pub run_id: Uuid,
    pub total_batches: usize,
    pub records_skipped: usize,
    pub example_ids: Vec<RecordId>,
}

#[derive(Debug, Serialize)]
pub struct PreviewResponse {
    pub record_type: String,
    pub example_ids: Vec<RecordId>,
    pub records_skipped: usize,
    pub oversized_ids: Vec<RecordId>,
    pub batching: BatchingStats,
    /// Prompt of the first batch; absent when no target needs filling.
    pub prompt: Option<String>,
    pub prompt_size: usize,
}

// ────────────────────────────────────────────────────────────────────────────
// Handlers
// ────────────────────────────────────────────────────────────────────────────

/// POST /api/v1/transforms
///
/// Validates the request, selects examples and plans batches, then runs the
/// batches in the background. Validation failures make no external call.
pub async fn handle_start_transform(
    State(state): State<AppState>,
    Json(request): Json<TransformRequest>,
) -> Result<(StatusCode, Json<StartTransformResponse>), AppError> {
    let prepared = state.orchestrator.prepare(request).await?;

    let total_batches = prepared.total_batches();
    let records_skipped = prepared.records_skipped;
    let example_ids = prepared.example_ids().to_vec();
    let run_id = state
        .runs
        .spawn(state.orchestrator.clone(), prepared)
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartTransformResponse {
            run_id,
            total_batches,
            records_skipped,
            example_ids,
        }),
    ))
}

/// GET /api/v1/transforms/:id
///
/// Latest progress snapshot; carries the final summary once the run ended.
pub async fn handle_get_transform(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSnapshot>, AppError> {
    state
        .runs
        .snapshot(run_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("transform run {run_id}")))
}

/// POST /api/v1/transforms/:id/cancel
///
/// Stops the run before its next batch. Applied updates are kept.
pub async fn handle_cancel_transform(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<RunSnapshot>, AppError> {
    state
        .runs
        .cancel(run_id)
        .await
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("transform run {run_id}")))
}

/// POST /api/v1/transforms/preview
///
/// Dry run: returns the first batch's prompt and the batching plan without
/// calling the text-generation service.
pub async fn handle_preview_transform(
    State(state): State<AppState>,
    Json(request): Json<TransformRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    let prepared = state.orchestrator.prepare(request).await?;
    let payload = prepared.preview_payload();

    Ok(Json(PreviewResponse {
        record_type: prepared.record_type.clone(),
        example_ids: prepared.example_ids().to_vec(),
        records_skipped: prepared.records_skipped,
        oversized_ids: prepared.plan.oversized.clone(),
        batching: prepared.plan.stats.clone(),
        prompt_size: payload.as_ref().map_or(0, |p| p.size()),
        prompt: payload.map(|p| p.text),
    }))
}
