//! Background runs — a cancellable unit of work per transformation run that
//! publishes progress snapshots and ends with a summary.
//!
//! Each run executes on its own tokio task; the latest snapshot is held in a
//! `watch` channel so readers never block the run. Finished runs stay
//! queryable for a retention window and are evicted when a new run starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use crate::transform::orchestrator::{
    Orchestrator, PreparedRun, ProgressEvent, RunState, TransformSummary,
};

/// Cooperative cancellation, checked by the orchestrator between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub record_type: String,
    pub state: RunState,
    /// Zero-based index of the batch in flight.
    pub current_batch: Option<usize>,
    pub totals: TransformSummary,
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunSnapshot {
    fn apply(&mut self, event: &ProgressEvent) {
        match event {
            ProgressEvent::StateChanged { state, batch_index } => {
                self.state = *state;
                self.current_batch = *batch_index;
                self.totals.state = *state;
            }
            ProgressEvent::BatchCompleted { totals, .. } => {
                self.totals = totals.clone();
            }
        }
    }
}

struct RunHandle {
    cancel: CancelFlag,
    progress: watch::Receiver<RunSnapshot>,
}

impl RunHandle {
    fn snapshot(&self) -> RunSnapshot {
        let mut snapshot = self.progress.borrow().clone();
        snapshot.cancel_requested = self.cancel.is_cancelled();
        snapshot
    }

    /// True once the run finished at least `retention` before `now`.
    fn expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.progress
            .borrow()
            .finished_at
            .and_then(|finished| now.signed_duration_since(finished).to_std().ok())
            .is_some_and(|age| age >= retention)
    }
}

const DEFAULT_RUN_RETENTION: Duration = Duration::from_secs(3600);

/// Registry of the runs started by this process. Unfinished runs are never
/// evicted.
#[derive(Clone)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<Uuid, RunHandle>>>,
    retention: Duration,
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RUN_RETENTION)
    }
}

impl RunRegistry {
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            runs: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Starts `prepared` on a background task and returns its run id.
    pub async fn spawn(&self, orchestrator: Orchestrator, prepared: PreparedRun) -> Uuid {
        let run_id = Uuid::new_v4();
        let cancel = CancelFlag::new();
        let initial = RunSnapshot {
            run_id,
            record_type: prepared.record_type.clone(),
            state: RunState::Pending,
            current_batch: None,
            totals: TransformSummary {
                total_batches: prepared.total_batches(),
                records_skipped: prepared.records_skipped,
                oversized_records: prepared.plan.oversized.len(),
                ..Default::default()
            },
            cancel_requested: false,
            started_at: Utc::now(),
            finished_at: None,
        };
        let (tx, rx) = watch::channel(initial);

        {
            let mut runs = self.runs.write().await;
            let now = Utc::now();
            let before = runs.len();
            runs.retain(|_, handle| !handle.expired(now, self.retention));
            if runs.len() < before {
                info!("Evicted {} finished run(s)", before - runs.len());
            }
            runs.insert(
                run_id,
                RunHandle {
                    cancel: cancel.clone(),
                    progress: rx,
                },
            );
        }
        info!(
            "Started run {run_id} ({} batch(es))",
            prepared.total_batches()
        );

        let tx = Arc::new(tx);
        let progress_tx = tx.clone();
        let worker = tokio::spawn(async move {
            let on_progress = |event: &ProgressEvent| {
                progress_tx.send_modify(|snapshot| snapshot.apply(event));
            };
            orchestrator
                .run_prepared(&prepared, &cancel, &on_progress)
                .await
        });

        // A panicking run still reaches a terminal state.
        tokio::spawn(async move {
            let summary = match worker.await {
                Ok(summary) => summary,
                Err(e) => {
                    error!("Run {run_id} aborted: {e}");
                    let mut totals = tx.borrow().totals.clone();
                    totals.state = RunState::Failed;
                    totals
                        .first_error
                        .get_or_insert_with(|| format!("run aborted: {e}"));
                    totals
                }
            };

            info!("Run {run_id} ended in state {:?}", summary.state);
            tx.send_modify(|snapshot| {
                snapshot.state = summary.state;
                snapshot.current_batch = None;
                snapshot.totals = summary;
                snapshot.finished_at = Some(Utc::now());
            });
        });

        run_id
    }

    pub async fn snapshot(&self, run_id: Uuid) -> Option<RunSnapshot> {
        self.runs.read().await.get(&run_id).map(RunHandle::snapshot)
    }

    /// Requests cancellation. Batches already finished keep their updates.
    pub async fn cancel(&self, run_id: Uuid) -> Option<RunSnapshot> {
        let runs = self.runs.read().await;
        let handle = runs.get(&run_id)?;
        if !handle.progress.borrow().state.is_terminal() {
            info!("Cancellation requested for run {run_id}");
            handle.cancel.cancel();
        }
        Some(handle.snapshot())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
