//! Batcher — partitions the ordered target ids into batches bounded by payload
//! size and record count.
//!
//! Algorithm (greedy, single pass):
//! 1. Start a batch at the fixed prompt overhead (`base_size`)
//! 2. Append the next id while `running_size + size(id) <= max_size` and the
//!    batch holds fewer than `max_count` ids
//! 3. Otherwise close the batch and open a new one with that id
//! 4. An id too large on its own still gets a singleton batch, flagged oversized
//!
//! Concatenating the batches always yields the input sequence exactly.

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::models::record::RecordId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchingError {
    #[error("maximum records per batch must be at least 1")]
    ZeroRecordLimit,
}

/// Size and count bounds for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Characters of a payload with no target records.
    pub base_size: usize,
    pub max_size: usize,
    pub max_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub index: usize,
    pub ids: Vec<RecordId>,
    /// Estimated payload size including the fixed overhead.
    pub payload_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchingStats {
    pub num_batches: usize,
    pub num_records: usize,
    pub median_batch_size: f64,
    pub avg_batch_size: f64,
    pub oversized_records: usize,
    pub max_payload_size: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPlan {
    pub batches: Vec<Batch>,
    /// Ids whose payload alone exceeds `max_size`; each sits in its own batch.
    pub oversized: Vec<RecordId>,
    pub stats: BatchingStats,
}

/// Splits `ids` into batches under `limits`, using `estimate` for the
/// characters each id contributes to a payload.
pub fn plan_batches<F>(
    ids: &[RecordId],
    estimate: F,
    limits: BatchLimits,
) -> Result<BatchPlan, BatchingError>
where
    F: Fn(RecordId) -> usize,
{
    if limits.max_count == 0 {
        return Err(BatchingError::ZeroRecordLimit);
    }

    let mut batches: Vec<Batch> = Vec::new();
    let mut oversized = Vec::new();
    let mut current: Vec<RecordId> = Vec::new();
    let mut running_size = limits.base_size;

    for &id in ids {
        let size = estimate(id);

        let fits = running_size + size <= limits.max_size && current.len() < limits.max_count;
        if !current.is_empty() && !fits {
            close_batch(&mut batches, &mut current, running_size);
            running_size = limits.base_size;
        }

        if limits.base_size + size > limits.max_size {
            warn!(
                "Record {} may exceed the payload size budget ({} > {} characters)",
                id,
                limits.base_size + size,
                limits.max_size
            );
            oversized.push(id);
        }

        current.push(id);
        running_size += size;
    }

    if !current.is_empty() {
        close_batch(&mut batches, &mut current, running_size);
    }

    let stats = compute_stats(&batches, oversized.len());
    Ok(BatchPlan {
        batches,
        oversized,
        stats,
    })
}

fn close_batch(batches: &mut Vec<Batch>, current: &mut Vec<RecordId>, payload_size: usize) {
    batches.push(Batch {
        index: batches.len(),
        ids: std::mem::take(current),
        payload_size,
    });
}

fn compute_stats(batches: &[Batch], oversized_records: usize) -> BatchingStats {
    if batches.is_empty() {
        return BatchingStats::default();
    }

    let mut sizes: Vec<usize> = batches.iter().map(|b| b.ids.len()).collect();
    sizes.sort_unstable();
    let num_records: usize = sizes.iter().sum();
    let mid = sizes.len() / 2;
    let median_batch_size = if sizes.len() % 2 == 0 {
        (sizes[mid - 1] + sizes[mid]) as f64 / 2.0
    } else {
        sizes[mid] as f64
    };

    BatchingStats {
        num_batches: batches.len(),
        num_records,
        median_batch_size,
        avg_batch_size: num_records as f64 / batches.len() as f64,
        oversized_records,
        max_payload_size: batches.iter().map(|b| b.payload_size).max().unwrap_or(0),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
