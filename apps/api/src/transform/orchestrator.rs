//! Transformation Orchestrator — drives one run end to end.
//!
//! State machine:
//! `Pending → SelectingExamples → Batching → (per batch: BuildingPayload →
//! AwaitingResponse → ApplyingUpdates) → Completed | Cancelled | Failed`
//!
//! `prepare` covers validation, example selection and batching; it is the only
//! step that can fail the caller. `run_prepared` processes batches strictly in
//! order, absorbs record-level and batch-level faults into the summary, and
//! checks for cancellation between batches.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::llm_client::TextGenerationClient;
use crate::models::policy::{FieldInstructions, FieldPolicy, FieldRule};
use crate::models::record::{Record, RecordId};
use crate::repository::{RecordRepository, RepositoryError};
use crate::transform::batcher::{plan_batches, Batch, BatchLimits, BatchPlan};
use crate::transform::example_selector::{preferred_container, select_examples, SelectionQuery};
use crate::transform::field_merge::{group_by_record, resolve_merge, SkipReason};
use crate::transform::markup::is_blank;
use crate::transform::payload::{Payload, PayloadBuilder};
use crate::transform::reply_parser::{parse_reply, ReplyFieldValue, ReplyScope};
use crate::transform::task::CancelFlag;

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// Settings the core runs with, passed in at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformConfig {
    pub max_examples: usize,
    /// Payload budget in characters.
    pub max_prompt_size: usize,
    pub max_records_per_batch: usize,
    pub client_timeout: Duration,
}

/// Caller input for one run.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformRequest {
    pub target_ids: Vec<RecordId>,
    pub fields: Vec<FieldRule>,
    #[serde(default)]
    pub instructions: FieldInstructions,
    /// Overrides the configured example count for this run.
    #[serde(default)]
    pub max_examples: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    SelectingExamples,
    Batching,
    BuildingPayload,
    AwaitingResponse,
    ApplyingUpdates,
    Completed,
    Cancelled,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Cancelled | RunState::Failed
        )
    }
}

/// Blocking failures, reported before any external call.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Running totals of a run; the final value is the run's result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransformSummary {
    pub state: RunState,
    pub total_batches: usize,
    pub batches_processed: usize,
    pub batches_failed: usize,
    pub records_updated: usize,
    pub fields_updated: usize,
    pub records_failed: usize,
    /// Targets dropped before batching because they had nothing to fill.
    pub records_skipped: usize,
    pub records_missing_from_reply: usize,
    pub fields_skipped_policy: usize,
    pub fields_skipped_overwrite: usize,
    pub fields_unchanged: usize,
    pub parse_warnings: usize,
    pub oversized_records: usize,
    pub first_error: Option<String>,
}

impl TransformSummary {
    fn note_error(&mut self, message: String) {
        if self.first_error.is_none() {
            self.first_error = Some(message);
        }
    }

    fn record_failed(&mut self, id: RecordId, reason: impl Display) {
        warn!("Record {id} failed: {reason}");
        self.records_failed += 1;
        self.note_error(format!("record {id}: {reason}"));
    }

    fn final_state(&self, cancelled: bool) -> RunState {
        if cancelled {
            RunState::Cancelled
        } else if self.batches_processed > 0 && self.batches_failed == self.batches_processed {
            RunState::Failed
        } else {
            RunState::Completed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StateChanged {
        state: RunState,
        batch_index: Option<usize>,
    },
    BatchCompleted {
        batch_index: usize,
        total_batches: usize,
        failed: bool,
        totals: TransformSummary,
    },
}

pub type ProgressFn<'a> = dyn Fn(&ProgressEvent) + Send + Sync + 'a;

/// Everything decided before the first external call.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub record_type: String,
    pub policy: FieldPolicy,
    pub builder: PayloadBuilder,
    pub plan: BatchPlan,
    /// Targets that take part in the run, in request order.
    pub targets: Vec<Record>,
    pub records_skipped: usize,
}

impl PreparedRun {
    pub fn total_batches(&self) -> usize {
        self.plan.batches.len()
    }

    pub fn example_ids(&self) -> &[RecordId] {
        self.builder.example_ids()
    }

    /// The payload the first batch would send, built from the prepared state.
    pub fn preview_payload(&self) -> Option<Payload> {
        let batch = self.plan.batches.first()?;
        let records: Vec<Record> = batch
            .ids
            .iter()
            .filter_map(|id| self.targets.iter().find(|r| r.id == *id).cloned())
            .collect();
        Some(self.builder.render(&records))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    repository: Arc<dyn RecordRepository>,
    client: Arc<dyn TextGenerationClient>,
    config: TransformConfig,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn RecordRepository>,
        client: Arc<dyn TextGenerationClient>,
        config: TransformConfig,
    ) -> Self {
        Self {
            repository,
            client,
            config,
        }
    }

    /// Validates the request, selects examples and plans the batches.
    ///
    /// Algorithm:
    /// 1. Validate the field policy and the target id list
    /// 2. Fetch targets; all must exist, share one type and carry every selected field
    /// 3. Drop targets with nothing to fill
    /// 4. Select examples from the whole collection of that type, excluding targets
    /// 5. Partition the remaining targets under the size and count budgets
    pub async fn prepare(&self, request: TransformRequest) -> Result<PreparedRun, TransformError> {
        trace_state(RunState::Pending);

        let policy = FieldPolicy::new(request.fields)
            .map_err(|e| TransformError::Validation(e.to_string()))?;

        let target_ids = dedup_ids(&request.target_ids);
        if target_ids.is_empty() {
            return Err(TransformError::Validation(
                "no target records selected".to_string(),
            ));
        }

        let mut fetched = Vec::with_capacity(target_ids.len());
        for &id in &target_ids {
            match self.repository.fetch(id).await {
                Ok(record) => fetched.push(record),
                Err(RepositoryError::NotFound(id)) => {
                    return Err(TransformError::Validation(format!(
                        "record {id} does not exist"
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }

        let record_type = fetched[0].record_type.clone();
        if let Some(other) = fetched.iter().find(|r| r.record_type != record_type) {
            return Err(TransformError::Validation(format!(
                "all target records must share one type: record {} is '{}', expected '{}'",
                other.id, other.record_type, record_type
            )));
        }
        if let Some(missing) = policy.selected().find(|f| !fetched[0].has_field(f)) {
            return Err(TransformError::Validation(format!(
                "record type '{record_type}' has no field '{missing}'"
            )));
        }

        let (targets, skipped): (Vec<Record>, Vec<Record>) =
            fetched.into_iter().partition(|r| needs_fill(r, &policy));
        if !skipped.is_empty() {
            info!(
                "Skipping {} target record(s) with nothing to fill",
                skipped.len()
            );
        }

        trace_state(RunState::SelectingExamples);
        let examples = if targets.is_empty() {
            Vec::new()
        } else {
            let collection = self.repository.fetch_all_of_type(&record_type).await?;
            let readable: Vec<&str> = policy.readable().collect();
            let exclude: HashSet<RecordId> = target_ids.iter().copied().collect();
            let query = SelectionQuery {
                record_type: &record_type,
                fields: &readable,
                max_examples: request.max_examples.unwrap_or(self.config.max_examples),
                preferred_container: preferred_container(&targets),
                exclude: &exclude,
            };
            select_examples(&collection, &query)
                .into_iter()
                .map(|c| c.record)
                .collect::<Vec<_>>()
        };

        let builder = PayloadBuilder::new(&record_type, &examples, &policy, &request.instructions);

        trace_state(RunState::Batching);
        let sizes: HashMap<RecordId, usize> = targets
            .iter()
            .map(|r| (r.id, builder.record_size(r)))
            .collect();
        let ids: Vec<RecordId> = targets.iter().map(|r| r.id).collect();
        let plan = plan_batches(
            &ids,
            |id| sizes.get(&id).copied().unwrap_or(0),
            BatchLimits {
                base_size: builder.base_size(),
                max_size: self.config.max_prompt_size,
                max_count: self.config.max_records_per_batch,
            },
        )
        .map_err(|e| TransformError::Validation(e.to_string()))?;

        info!(
            "Prepared run over '{}': {} target(s), {} skipped, {} example(s), {} batch(es)",
            record_type,
            targets.len(),
            skipped.len(),
            examples.len(),
            plan.batches.len()
        );

        Ok(PreparedRun {
            record_type,
            policy,
            builder,
            plan,
            targets,
            records_skipped: skipped.len(),
        })
    }

    /// Validates, prepares and runs in one call.
    #[allow(dead_code)]
    pub async fn run(
        &self,
        request: TransformRequest,
        cancel: &CancelFlag,
        on_progress: &ProgressFn<'_>,
    ) -> Result<TransformSummary, TransformError> {
        let prepared = self.prepare(request).await?;
        Ok(self.run_prepared(&prepared, cancel, on_progress).await)
    }

    /// Processes every batch in order. Never fails: faults are counted in the summary.
    pub async fn run_prepared(
        &self,
        run: &PreparedRun,
        cancel: &CancelFlag,
        on_progress: &ProgressFn<'_>,
    ) -> TransformSummary {
        let total_batches = run.total_batches();
        let mut summary = TransformSummary {
            total_batches,
            records_skipped: run.records_skipped,
            oversized_records: run.plan.oversized.len(),
            ..Default::default()
        };

        let mut cancelled = false;
        for batch in &run.plan.batches {
            if cancel.is_cancelled() {
                info!(
                    "Run cancelled after {} of {} batch(es)",
                    summary.batches_processed, total_batches
                );
                cancelled = true;
                break;
            }

            let outcome = self.run_batch(run, batch, &mut summary, on_progress).await;
            summary.batches_processed += 1;
            let failed = match outcome {
                Ok(()) => {
                    info!("Batch {}/{} done", batch.index + 1, total_batches);
                    false
                }
                Err(message) => {
                    warn!("Batch {}/{} failed: {}", batch.index + 1, total_batches, message);
                    summary.batches_failed += 1;
                    summary.note_error(format!("batch {}: {message}", batch.index + 1));
                    true
                }
            };

            on_progress(&ProgressEvent::BatchCompleted {
                batch_index: batch.index,
                total_batches,
                failed,
                totals: summary.clone(),
            });
        }

        summary.state = summary.final_state(cancelled);
        on_progress(&ProgressEvent::StateChanged {
            state: summary.state,
            batch_index: None,
        });
        info!(
            "Run finished ({:?}): {} record(s) updated, {} field(s) updated, {} record(s) failed, {}/{} batch(es) processed",
            summary.state,
            summary.records_updated,
            summary.fields_updated,
            summary.records_failed,
            summary.batches_processed,
            total_batches
        );
        summary
    }

    /// Runs one batch. `Err` marks the whole batch failed; record-level faults
    /// are counted in `summary` and do not fail the batch.
    async fn run_batch(
        &self,
        run: &PreparedRun,
        batch: &Batch,
        summary: &mut TransformSummary,
        on_progress: &ProgressFn<'_>,
    ) -> Result<(), String> {
        enter(summary, RunState::BuildingPayload, batch.index, on_progress);
        let mut records = Vec::with_capacity(batch.ids.len());
        for &id in &batch.ids {
            match self.repository.fetch(id).await {
                Ok(record) => records.push(record),
                Err(e) => summary.record_failed(id, e),
            }
        }
        if records.is_empty() {
            return Err("none of the batch's records could be fetched".to_string());
        }
        let payload = run.builder.render(&records);
        debug!(
            "Batch {} payload: {} characters, {} target(s)",
            batch.index + 1,
            payload.size(),
            payload.target_ids.len()
        );

        enter(summary, RunState::AwaitingResponse, batch.index, on_progress);
        let reply = match self
            .client
            .execute(&payload.text, self.config.client_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                summary.records_failed += records.len();
                return Err(format!("client error: {e}"));
            }
        };

        let target_ids: HashSet<RecordId> = payload.target_ids.iter().copied().collect();
        let parsed = match parse_reply(
            &reply,
            &ReplyScope {
                target_ids: &target_ids,
                policy: &run.policy,
            },
        ) {
            Ok(parsed) => parsed,
            Err(e) => {
                summary.records_failed += records.len();
                return Err(e.to_string());
            }
        };
        for warning in &parsed.warnings {
            warn!("Batch {}: skipped record block: {}", batch.index + 1, warning);
        }
        summary.parse_warnings += parsed.warnings.len();

        enter(summary, RunState::ApplyingUpdates, batch.index, on_progress);
        let mut grouped = group_by_record(parsed.values);
        for record in &records {
            match grouped.remove(&record.id) {
                Some(values) => self.apply_record(run, record.id, &values, summary).await,
                None => {
                    summary.records_missing_from_reply += 1;
                    summary.record_failed(record.id, "missing from reply");
                }
            }
        }
        Ok(())
    }

    /// Re-fetches the record, resolves the merge and persists any change.
    async fn apply_record(
        &self,
        run: &PreparedRun,
        id: RecordId,
        values: &[ReplyFieldValue],
        summary: &mut TransformSummary,
    ) {
        let mut fresh = match self.repository.fetch(id).await {
            Ok(record) => record,
            Err(e) => return summary.record_failed(id, e),
        };

        let decision = resolve_merge(&fresh, &run.policy, values);
        // Echoed values count as unchanged, not as refused writes.
        summary.fields_skipped_policy += decision.refused_for(SkipReason::NotRequested)
            + decision.refused_for(SkipReason::MissingField)
            + decision.refused_for(SkipReason::PolicyViolation);
        summary.fields_skipped_overwrite += decision.refused_for(SkipReason::WouldOverwrite);
        summary.fields_unchanged += decision.echoed();
        if decision.is_empty() {
            return;
        }

        let result = decision.apply_to(&mut fresh);
        match self.repository.persist(&fresh).await {
            Ok(()) => {
                debug!("Record {id} updated: {:?}", result.changed_fields);
                summary.records_updated += 1;
                summary.fields_updated += result.changed_fields.len();
            }
            Err(e) => summary.record_failed(id, e),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

/// A target has work when a writable field is empty or an overwritable field exists.
fn needs_fill(record: &Record, policy: &FieldPolicy) -> bool {
    policy.rules().iter().any(|rule| {
        record.field(&rule.name).is_some_and(|content| {
            rule.access.overwritable || (rule.access.writable && is_blank(content))
        })
    })
}

fn dedup_ids(ids: &[RecordId]) -> Vec<RecordId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn enter(
    summary: &mut TransformSummary,
    state: RunState,
    batch_index: usize,
    on_progress: &ProgressFn<'_>,
) {
    trace_state(state);
    summary.state = state;
    on_progress(&ProgressEvent::StateChanged {
        state,
        batch_index: Some(batch_index),
    });
}

fn trace_state(state: RunState) {
    debug!("Run state: {:?}", state);
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::llm_client::{ClientError, ClientErrorReason, DummyClient};
    use crate::models::policy::FieldAccess;
    use crate::models::record::Field;
    use crate::test_support::{reply_xml, InMemoryRepository, ScriptedClient};

    fn config(max_records_per_batch: usize) -> TransformConfig {
        TransformConfig {
            max_examples: 3,
            max_prompt_size: 100_000,
            max_records_per_batch,
            client_timeout: Duration::from_secs(5),
        }
    }

    fn vocab(id: RecordId, container: &str, front: &str, back: &str) -> Record {
        Record::new(
            id,
            "Vocab",
            container,
            vec![Field::new("Front", front), Field::new("Back", back)],
        )
    }

    fn fill_back() -> Vec<FieldRule> {
        vec![
            FieldRule {
                name: "Front".to_string(),
                access: FieldAccess::read_only(),
            },
            FieldRule {
                name: "Back".to_string(),
                access: FieldAccess::fill_empty(),
            },
        ]
    }

    fn request(target_ids: Vec<RecordId>, fields: Vec<FieldRule>) -> TransformRequest {
        TransformRequest {
            target_ids,
            fields,
            instructions: FieldInstructions::new(),
            max_examples: None,
        }
    }

    fn collection() -> Vec<Record> {
        vec![
            vocab(1, "Spanish", "gato", ""),
            vocab(2, "Spanish", "perro", ""),
            vocab(3, "Spanish", "pájaro", ""),
            vocab(4, "Spanish", "pez", ""),
            vocab(10, "Spanish", "casa grande", "big house"),
            vocab(11, "Spanish", "sol", "sun"),
        ]
    }

    fn back_reply(id: RecordId, back: &str) -> String {
        reply_xml(&[(id, vec![("Back", back)])])
    }

    fn setup(
        records: Vec<Record>,
        client: Arc<dyn TextGenerationClient>,
        max_records_per_batch: usize,
    ) -> (Orchestrator, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new(records));
        let orchestrator = Orchestrator::new(repo.clone(), client, config(max_records_per_batch));
        (orchestrator, repo)
    }

    fn no_progress(_: &ProgressEvent) {}

    #[tokio::test]
    async fn test_zero_fields_fails_validation_without_external_call() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let (orchestrator, _) = setup(collection(), client.clone(), 10);

        let err = orchestrator
            .run(request(vec![1, 2], vec![]), &CancelFlag::new(), &no_progress)
            .await
            .unwrap_err();

        assert!(matches!(err, TransformError::Validation(_)));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_target_set_fails_validation() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let (orchestrator, _) = setup(collection(), client.clone(), 10);

        let err = orchestrator
            .prepare(request(vec![], fill_back()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransformError::Validation(_)));
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_target_and_unknown_field_fail_validation() {
        let (orchestrator, _) = setup(collection(), Arc::new(DummyClient), 10);

        let err = orchestrator
            .prepare(request(vec![1, 999], fill_back()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("999"));

        let mut fields = fill_back();
        fields.push(FieldRule {
            name: "Notes".to_string(),
            access: FieldAccess::fill_empty(),
        });
        let err = orchestrator.prepare(request(vec![1], fields)).await.unwrap_err();
        assert!(err.to_string().contains("Notes"));
    }

    #[tokio::test]
    async fn test_mixed_record_types_fail_validation() {
        let mut records = collection();
        records.push(Record::new(
            20,
            "Cloze",
            "Spanish",
            vec![Field::new("Front", ""), Field::new("Back", "")],
        ));
        let (orchestrator, _) = setup(records, Arc::new(DummyClient), 10);

        let err = orchestrator
            .prepare(request(vec![1, 20], fill_back()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransformError::Validation(_)));
    }

    #[tokio::test]
    async fn test_fills_empty_fields_end_to_end() {
        let (orchestrator, repo) = setup(collection(), Arc::new(DummyClient), 2);

        let summary = orchestrator
            .run(
                request(vec![1, 2, 3], fill_back()),
                &CancelFlag::new(),
                &no_progress,
            )
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.total_batches, 2);
        assert_eq!(summary.batches_processed, 2);
        assert_eq!(summary.records_updated, 3);
        assert_eq!(summary.fields_updated, 3);
        assert_eq!(summary.records_failed, 0);
        assert_eq!(summary.first_error, None);
        for id in [1, 2, 3] {
            assert_eq!(
                repo.get(id).unwrap().field("Back"),
                Some("Mock content for Back")
            );
        }
        // Read-only fields and untouched records stay as they were.
        assert_eq!(repo.get(1).unwrap().field("Front"), Some("gato"));
        assert_eq!(repo.get(4).unwrap().field("Back"), Some(""));
    }

    #[tokio::test]
    async fn test_examples_exclude_targets_and_precede_them() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(back_reply(1, "cat"))]));
        let (orchestrator, _) = setup(collection(), client.clone(), 10);

        let summary = orchestrator
            .run(request(vec![1], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.records_updated, 1);
        let prompt = &client.prompts()[0];
        assert_eq!(prompt.matches(r#"<record id="1""#).count(), 1);
        assert!(prompt.find(r#"<record id="10""#).unwrap() < prompt.find(r#"<record id="1""#).unwrap());
        assert!(prompt.contains("big house"));
    }

    #[tokio::test]
    async fn test_existing_value_skipped_as_would_overwrite() {
        let records = vec![Record::new(
            1,
            "Vocab",
            "Spanish",
            vec![
                Field::new("Front", "gato"),
                Field::new("Back", "existing"),
                Field::new("Notes", ""),
            ],
        )];
        let mut fields = fill_back();
        fields.push(FieldRule {
            name: "Notes".to_string(),
            access: FieldAccess::fill_empty(),
        });
        let client = Arc::new(ScriptedClient::new(vec![Ok(reply_xml(&[(
            1,
            vec![("Back", "new"), ("Notes", "feline")],
        )]))]));
        let (orchestrator, repo) = setup(records, client, 10);

        let summary = orchestrator
            .run(request(vec![1], fields), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        let record = repo.get(1).unwrap();
        assert_eq!(record.field("Back"), Some("existing"));
        assert_eq!(record.field("Notes"), Some("feline"));
        assert_eq!(summary.fields_skipped_overwrite, 1);
        assert_eq!(summary.fields_updated, 1);
    }

    #[tokio::test]
    async fn test_echoed_read_only_fields_not_counted_as_policy_skips() {
        let (orchestrator, _) = setup(collection(), Arc::new(DummyClient), 10);

        let summary = orchestrator
            .run(request(vec![1, 2, 3], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.fields_updated, 3);
        assert_eq!(summary.fields_skipped_policy, 0);
        assert_eq!(summary.fields_unchanged, 3);
    }

    #[tokio::test]
    async fn test_changed_read_only_field_counted_as_policy_skip() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(reply_xml(&[(
            1,
            vec![("Front", "gata"), ("Back", "cat")],
        )]))]));
        let (orchestrator, repo) = setup(collection(), client, 10);

        let summary = orchestrator
            .run(request(vec![1], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.fields_skipped_policy, 1);
        assert_eq!(summary.fields_unchanged, 0);
        assert_eq!(repo.get(1).unwrap().field("Front"), Some("gato"));
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_abort_run() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(back_reply(1, "cat")),
            Err(ClientError::new(ClientErrorReason::Timeout, "timed out")),
            Ok(back_reply(3, "bird")),
        ]));
        let (orchestrator, repo) = setup(collection(), client.clone(), 1);

        let summary = orchestrator
            .run(
                request(vec![1, 2, 3], fill_back()),
                &CancelFlag::new(),
                &no_progress,
            )
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.batches_processed, 3);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(summary.records_updated, 2);
        assert_eq!(summary.records_failed, 1);
        assert!(summary.first_error.as_deref().unwrap().starts_with("batch 2"));
        assert_eq!(client.calls(), 3);
        assert_eq!(repo.get(2).unwrap().field("Back"), Some(""));
        assert_eq!(repo.get(3).unwrap().field("Back"), Some("bird"));
    }

    #[tokio::test]
    async fn test_every_batch_failing_marks_run_failed() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("I cannot do that.".to_string()),
            Err(ClientError::new(ClientErrorReason::AuthFailure, "bad key")),
        ]));
        let (orchestrator, _) = setup(collection(), client, 1);

        let summary = orchestrator
            .run(request(vec![1, 2], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.batches_failed, 2);
        assert_eq!(summary.records_failed, 2);
        assert!(summary.first_error.unwrap().contains("malformed reply"));
    }

    #[tokio::test]
    async fn test_cancellation_after_second_batch() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(back_reply(1, "cat")),
            Ok(back_reply(2, "dog")),
            Ok(back_reply(3, "bird")),
            Ok(back_reply(4, "fish")),
        ]));
        let (orchestrator, repo) = setup(collection(), client.clone(), 1);
        let cancel = CancelFlag::new();
        let on_progress = {
            let cancel = cancel.clone();
            move |event: &ProgressEvent| {
                if let ProgressEvent::BatchCompleted { batch_index: 1, .. } = event {
                    cancel.cancel();
                }
            }
        };

        let summary = orchestrator
            .run(request(vec![1, 2, 3, 4], fill_back()), &cancel, &on_progress)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Cancelled);
        assert_eq!(summary.batches_processed, 2);
        assert_eq!(summary.total_batches, 4);
        assert_eq!(client.calls(), 2);
        // Applied updates stay in place.
        assert_eq!(repo.get(2).unwrap().field("Back"), Some("dog"));
        assert_eq!(repo.get(3).unwrap().field("Back"), Some(""));
    }

    #[tokio::test]
    async fn test_truncated_block_fails_only_its_record() {
        let reply = r#"<records type="Vocab">
  <record id="1" container="Spanish">
    <field name="Back">cat</field>
  </record>
  <record id="2" container="Spanish">
    <field name="Back">do"#;
        let client = Arc::new(ScriptedClient::new(vec![Ok(reply.to_string())]));
        let (orchestrator, repo) = setup(collection(), client, 10);

        let summary = orchestrator
            .run(request(vec![1, 2], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.batches_failed, 0);
        assert_eq!(summary.records_updated, 1);
        assert_eq!(summary.parse_warnings, 1);
        assert_eq!(summary.records_missing_from_reply, 1);
        assert_eq!(summary.records_failed, 1);
        assert_eq!(repo.get(1).unwrap().field("Back"), Some("cat"));
        assert_eq!(repo.get(2).unwrap().field("Back"), Some(""));
    }

    #[tokio::test]
    async fn test_targets_with_nothing_to_fill_are_skipped() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let (orchestrator, _) = setup(collection(), client.clone(), 10);

        let summary = orchestrator
            .run(request(vec![10, 11], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.total_batches, 0);
        assert_eq!(summary.records_skipped, 2);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_persist_conflict_counts_record_failure() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(reply_xml(&[
            (1, vec![("Back", "cat")]),
            (2, vec![("Back", "dog")]),
        ]))]));
        let (orchestrator, repo) = setup(collection(), client, 10);
        repo.fail_persist(2);

        let summary = orchestrator
            .run(request(vec![1, 2], fill_back()), &CancelFlag::new(), &no_progress)
            .await
            .unwrap();

        assert_eq!(summary.records_updated, 1);
        assert_eq!(summary.records_failed, 1);
        assert_eq!(summary.batches_failed, 0);
        assert!(summary.first_error.unwrap().starts_with("record 2"));
    }

    #[tokio::test]
    async fn test_progress_reported_after_each_batch() {
        let (orchestrator, _) = setup(collection(), Arc::new(DummyClient), 1);
        let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());
        let on_progress = |event: &ProgressEvent| events.lock().unwrap().push(event.clone());

        orchestrator
            .run(request(vec![1, 2, 3], fill_back()), &CancelFlag::new(), &on_progress)
            .await
            .unwrap();

        let events = events.into_inner().unwrap();
        let completed: Vec<(usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::BatchCompleted {
                    batch_index,
                    totals,
                    ..
                } => Some((*batch_index, totals.records_updated)),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![(0, 1), (1, 2), (2, 3)]);
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::StateChanged {
                state: RunState::Completed,
                batch_index: None
            })
        ));
    }

    #[tokio::test]
    async fn test_preview_renders_first_batch() {
        let (orchestrator, _) = setup(collection(), Arc::new(DummyClient), 2);

        let prepared = orchestrator
            .prepare(request(vec![1, 2, 3], fill_back()))
            .await
            .unwrap();
        let payload = prepared.preview_payload().unwrap();

        assert_eq!(payload.target_ids, vec![1, 2]);
        assert_eq!(prepared.example_ids(), &[10, 11, 4]);
    }
}
