//! Field-Merge Resolver — decides which reply values may be written into a
//! record under the run's field policy.
//!
//! Rules, evaluated per field in order:
//! 1. Field not selected for the run → `NotRequested`
//! 2. Field not writable → `PolicyViolation`
//! 3. Current content non-empty and field not overwritable → `WouldOverwrite`
//! 4. Incoming content equals the current content → `Unchanged`
//! 5. Otherwise the value is applied
//!
//! A skipped value identical to the current content is marked as an echo, so
//! refused writes can be told apart from fields the service merely repeated.
//!
//! Resolution is pure: it returns a decision and never touches the repository.

use std::collections::HashMap;

use serde::Serialize;

use crate::models::policy::FieldPolicy;
use crate::models::record::{Record, RecordId};
use crate::transform::markup::is_blank;
use crate::transform::reply_parser::ReplyFieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotRequested,
    /// The record's type has no such field.
    MissingField,
    PolicyViolation,
    WouldOverwrite,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedField {
    pub field: String,
    pub reason: SkipReason,
    /// Incoming content equals the current content.
    pub echoed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeDecision {
    pub applied: Vec<FieldChange>,
    pub skipped: Vec<SkippedField>,
}

impl MergeDecision {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }

    pub fn skipped_for(&self, reason: SkipReason) -> usize {
        self.skipped.iter().filter(|s| s.reason == reason).count()
    }

    /// Skips for `reason` whose value would actually have changed the field.
    pub fn refused_for(&self, reason: SkipReason) -> usize {
        self.skipped
            .iter()
            .filter(|s| s.reason == reason && !s.echoed)
            .count()
    }

    /// Skipped values that only repeated the current content.
    pub fn echoed(&self) -> usize {
        self.skipped.iter().filter(|s| s.echoed).count()
    }

    /// Writes the applied values into `record` and returns the changed field
    /// names. Fields outside the decision are left alone.
    pub fn apply_to(&self, record: &mut Record) -> FieldUpdateResult {
        let changed_fields = self
            .applied
            .iter()
            .filter(|change| record.set_field(&change.field, change.content.as_str()))
            .map(|change| change.field.clone())
            .collect();
        FieldUpdateResult {
            record_id: record.id,
            changed_fields,
        }
    }
}

/// Fields actually changed on one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldUpdateResult {
    pub record_id: RecordId,
    pub changed_fields: Vec<String>,
}

/// Resolves the reply values addressed to `record`.
///
/// Values for other records are ignored. Duplicate entries for the same field
/// collapse to the last one in reply order.
pub fn resolve_merge(
    record: &Record,
    policy: &FieldPolicy,
    values: &[ReplyFieldValue],
) -> MergeDecision {
    let mut latest: Vec<(&str, &str)> = Vec::new();
    for value in values.iter().filter(|v| v.record_id == record.id) {
        match latest.iter_mut().find(|(field, _)| *field == value.field) {
            Some(entry) => entry.1 = value.content.as_str(),
            None => latest.push((value.field.as_str(), value.content.as_str())),
        }
    }

    let mut decision = MergeDecision::default();
    for (field, incoming) in latest {
        match check_field(record, policy, field, incoming) {
            Some(reason) => decision.skipped.push(SkippedField {
                field: field.to_string(),
                reason,
                echoed: record.field(field) == Some(incoming),
            }),
            None => decision.applied.push(FieldChange {
                field: field.to_string(),
                content: incoming.to_string(),
            }),
        }
    }
    decision
}

fn check_field(
    record: &Record,
    policy: &FieldPolicy,
    field: &str,
    incoming: &str,
) -> Option<SkipReason> {
    let Some(access) = policy.get(field) else {
        return Some(SkipReason::NotRequested);
    };
    let Some(current) = record.field(field) else {
        return Some(SkipReason::MissingField);
    };
    if !access.writable {
        return Some(SkipReason::PolicyViolation);
    }
    if !is_blank(current) && !access.overwritable {
        return Some(SkipReason::WouldOverwrite);
    }
    if current == incoming {
        return Some(SkipReason::Unchanged);
    }
    None
}

/// Groups reply values by record id, keeping reply order within each record.
pub fn group_by_record(values: Vec<ReplyFieldValue>) -> HashMap<RecordId, Vec<ReplyFieldValue>> {
    let mut grouped: HashMap<RecordId, Vec<ReplyFieldValue>> = HashMap::new();
    for value in values {
        grouped.entry(value.record_id).or_default().push(value);
    }
    grouped
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{FieldAccess, FieldRule};
    use crate::models::record::Field;

    fn make_policy(back: FieldAccess) -> FieldPolicy {
        FieldPolicy::new(vec![
            FieldRule {
                name: "Front".to_string(),
                access: FieldAccess::read_only(),
            },
            FieldRule {
                name: "Back".to_string(),
                access: back,
            },
        ])
        .unwrap()
    }

    fn make_record(front: &str, back: &str) -> Record {
        Record::new(
            1,
            "Vocab",
            "Default",
            vec![
                Field::new("Front", front),
                Field::new("Back", back),
                Field::new("Notes", "keep"),
            ],
        )
    }

    fn value(field: &str, content: &str) -> ReplyFieldValue {
        ReplyFieldValue {
            record_id: 1,
            field: field.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_empty_writable_field_applied() {
        let record = make_record("gato", "");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::fill_empty()), &[value("Back", "cat")]);

        assert_eq!(
            decision.applied,
            vec![FieldChange {
                field: "Back".to_string(),
                content: "cat".to_string(),
            }]
        );
        assert!(decision.skipped.is_empty());
    }

    #[test]
    fn test_existing_value_would_overwrite() {
        let mut record = make_record("gato", "existing");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::fill_empty()), &[value("Back", "cat")]);

        assert!(decision.applied.is_empty());
        assert_eq!(decision.skipped_for(SkipReason::WouldOverwrite), 1);

        decision.apply_to(&mut record);
        assert_eq!(record.field("Back"), Some("existing"));
    }

    #[test]
    fn test_overwritable_replaces_existing_value() {
        let record = make_record("gato", "existing");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::overwrite()), &[value("Back", "cat")]);
        assert_eq!(decision.applied.len(), 1);
    }

    #[test]
    fn test_markup_only_content_counts_as_empty() {
        let record = make_record("gato", "<div><br></div>&nbsp;");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::fill_empty()), &[value("Back", "cat")]);
        assert_eq!(decision.applied.len(), 1);
    }

    #[test]
    fn test_read_only_and_unselected_fields_skipped() {
        let record = make_record("", "");
        let decision = resolve_merge(
            &record,
            &make_policy(FieldAccess::fill_empty()),
            &[value("Front", "new"), value("Notes", "changed"), value("Back", "cat")],
        );

        assert_eq!(decision.applied.len(), 1);
        assert_eq!(decision.skipped_for(SkipReason::PolicyViolation), 1);
        assert_eq!(decision.skipped_for(SkipReason::NotRequested), 1);
    }

    #[test]
    fn test_echoed_values_are_not_refusals() {
        let record = make_record("gato", "cat");
        let decision = resolve_merge(
            &record,
            &make_policy(FieldAccess::fill_empty()),
            &[value("Front", "gato"), value("Back", "cat")],
        );

        assert!(decision.is_empty());
        assert_eq!(decision.skipped_for(SkipReason::PolicyViolation), 1);
        assert_eq!(decision.skipped_for(SkipReason::WouldOverwrite), 1);
        assert_eq!(decision.refused_for(SkipReason::PolicyViolation), 0);
        assert_eq!(decision.refused_for(SkipReason::WouldOverwrite), 0);
        assert_eq!(decision.echoed(), 2);

        let decision = resolve_merge(
            &record,
            &make_policy(FieldAccess::fill_empty()),
            &[value("Front", "perro"), value("Back", "dog")],
        );
        assert_eq!(decision.refused_for(SkipReason::PolicyViolation), 1);
        assert_eq!(decision.refused_for(SkipReason::WouldOverwrite), 1);
        assert_eq!(decision.echoed(), 0);
    }

    #[test]
    fn test_unchanged_value_not_applied() {
        let record = make_record("gato", "cat");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::overwrite()), &[value("Back", "cat")]);

        assert!(decision.is_empty());
        assert_eq!(decision.skipped_for(SkipReason::Unchanged), 1);
    }

    #[test]
    fn test_duplicate_field_last_wins() {
        let record = make_record("gato", "");
        let decision = resolve_merge(
            &record,
            &make_policy(FieldAccess::fill_empty()),
            &[value("Back", "first"), value("Back", "second")],
        );

        assert_eq!(decision.applied.len(), 1);
        assert_eq!(decision.applied[0].content, "second");
    }

    #[test]
    fn test_values_for_other_records_ignored() {
        let record = make_record("gato", "");
        let mut other = value("Back", "wrong");
        other.record_id = 2;

        let decision = resolve_merge(&record, &make_policy(FieldAccess::fill_empty()), &[other]);

        assert_eq!(decision, MergeDecision::default());
    }

    #[test]
    fn test_apply_only_touches_applied_fields() {
        let mut record = make_record("gato", "");
        let decision = resolve_merge(&record, &make_policy(FieldAccess::fill_empty()), &[value("Back", "cat")]);

        let result = decision.apply_to(&mut record);

        assert_eq!(result.changed_fields, vec!["Back".to_string()]);
        assert_eq!(record.field("Front"), Some("gato"));
        assert_eq!(record.field("Back"), Some("cat"));
        assert_eq!(record.field("Notes"), Some("keep"));
    }

    #[test]
    fn test_group_by_record_keeps_reply_order() {
        let mut second = value("Back", "b");
        second.record_id = 2;
        let grouped = group_by_record(vec![value("Back", "x"), second, value("Front", "y")]);

        assert_eq!(grouped[&1].len(), 2);
        assert_eq!(grouped[&1][1].field, "Front");
        assert_eq!(grouped[&2].len(), 1);
    }
}
