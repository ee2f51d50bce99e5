//! Example Selector — ranks collection records by how well they fill the
//! selected fields and picks the best few as in-context examples.
//!
//! Pure and deterministic: the same collection, type, fields and limit always
//! yield the same ordered list.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::record::{Record, RecordId};
use crate::transform::markup::{is_blank, word_count};

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// A collection record with its ranking keys, computed fresh per selection.
#[derive(Debug, Clone, Serialize)]
pub struct ExampleCandidate {
    pub record: Record,
    /// Number of selected fields that are non-empty.
    pub filled_field_count: usize,
    /// Sum of word counts across the selected fields.
    pub total_word_count: usize,
}

/// Inputs of one selection call.
#[derive(Debug, Clone, Copy)]
pub struct SelectionQuery<'a> {
    pub record_type: &'a str,
    pub fields: &'a [&'a str],
    pub max_examples: usize,
    /// Soft preference: fully filled candidates in this container are taken first.
    pub preferred_container: Option<&'a str>,
    /// Ids that must never be picked (the run's own targets).
    pub exclude: &'a HashSet<RecordId>,
}

// ────────────────────────────────────────────────────────────────────────────
// Selection algorithm
// ────────────────────────────────────────────────────────────────────────────

/// Selects up to `max_examples` example records of `record_type`.
///
/// Algorithm:
/// 1. Keep records of the requested type that are not excluded
/// 2. Score each by `(filled_field_count, total_word_count)` over `fields`
/// 3. Take fully filled candidates from the preferred container first
/// 4. Backfill from every remaining candidate in ranking order
/// 5. Order the picked examples by the same ranking keys
///
/// The container preference never lifts a partially filled candidate above a
/// fully filled one. A limit of zero or a collection without matching records
/// yields an empty list.
pub fn select_examples(collection: &[Record], query: &SelectionQuery<'_>) -> Vec<ExampleCandidate> {
    if query.max_examples == 0 {
        return Vec::new();
    }

    let field_count = query.fields.len();
    let (mut preferred, mut others): (Vec<ExampleCandidate>, Vec<ExampleCandidate>) = collection
        .iter()
        .filter(|r| r.record_type == query.record_type && !query.exclude.contains(&r.id))
        .map(|r| score_candidate(r, query.fields))
        .partition(|c| {
            field_count > 0
                && c.filled_field_count == field_count
                && query
                    .preferred_container
                    .is_some_and(|container| c.record.container == container)
        });

    rank(&mut preferred);
    rank(&mut others);

    let mut picked: Vec<ExampleCandidate> = preferred
        .into_iter()
        .chain(others)
        .take(query.max_examples)
        .collect();

    rank(&mut picked);
    picked
}

/// Computes ranking keys for one record over the given fields.
/// Fields missing from the record count as empty.
pub fn score_candidate(record: &Record, fields: &[&str]) -> ExampleCandidate {
    let mut filled_field_count = 0;
    let mut total_word_count = 0;

    for content in fields.iter().filter_map(|name| record.field(name)) {
        if !is_blank(content) {
            filled_field_count += 1;
            total_word_count += word_count(content);
        }
    }

    ExampleCandidate {
        record: record.clone(),
        filled_field_count,
        total_word_count,
    }
}

/// Most frequent container among the targets; ties go to the first seen.
pub fn preferred_container(targets: &[Record]) -> Option<&str> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for record in targets {
        match counts.iter_mut().find(|(c, _)| *c == record.container) {
            Some((_, n)) => *n += 1,
            None => counts.push((record.container.as_str(), 1)),
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (container, n) in counts {
        if best.map_or(true, |(_, m)| n > m) {
            best = Some((container, n));
        }
    }
    best.map(|(c, _)| c)
}

/// Stable descending sort; equal keys keep collection order.
fn rank(candidates: &mut [ExampleCandidate]) {
    candidates.sort_by(|a, b| {
        (b.filled_field_count, b.total_word_count).cmp(&(a.filled_field_count, a.total_word_count))
    });
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
