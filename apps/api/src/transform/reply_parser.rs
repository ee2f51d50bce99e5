//! Reply Deserializer — turns the service's reply text back into per-record,
//! per-field values.
//!
//! Records are the unit of fault isolation: a truncated or corrupt `<record>`
//! block is skipped with a warning and every other well-formed block in the
//! same reply is still recovered. Only a reply with no recognisable structure
//! at all fails as a whole.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::models::policy::FieldPolicy;
use crate::models::record::RecordId;
use crate::transform::payload::unescape_xml;

const FRAGMENT_CHARS: usize = 120;

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([A-Za-z_][\w:.-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});

/// One proposed value decoded from a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplyFieldValue {
    pub record_id: RecordId,
    pub field: String,
    pub content: String,
}

/// Reply text (or a part of it) that does not have the expected structure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("malformed reply: {message} (near `{fragment}`)")]
pub struct MalformedReply {
    pub message: String,
    pub fragment: String,
}

impl MalformedReply {
    fn new(message: impl Into<String>, fragment: &str) -> Self {
        Self {
            message: message.into(),
            fragment: excerpt(fragment),
        }
    }
}

/// What the reply is allowed to address: the batch's targets and the run's selected fields.
#[derive(Debug, Clone, Copy)]
pub struct ReplyScope<'a> {
    pub target_ids: &'a HashSet<RecordId>,
    pub policy: &'a FieldPolicy,
}

/// Outcome of parsing one reply.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ParsedReply {
    /// Values in reply order; duplicates are kept for last-wins resolution downstream.
    pub values: Vec<ReplyFieldValue>,
    /// Non-fatal, one per skipped record block.
    pub warnings: Vec<MalformedReply>,
    /// Record blocks addressing ids outside the batch's targets.
    pub ignored_records: usize,
    /// Field entries whose name was not selected for this run.
    pub ignored_fields: usize,
}

/// Parses reply text into field values.
///
/// Tolerates whitespace differences, a surrounding Markdown code fence, unknown
/// fields and records outside the target set (both ignored and counted), and
/// corrupt record blocks (skipped with a warning). Fails with [`MalformedReply`]
/// only when the text contains neither a `<records>` container nor any
/// `<record>` element.
pub fn parse_reply(raw: &str, scope: &ReplyScope<'_>) -> Result<ParsedReply, MalformedReply> {
    let text = strip_code_fences(raw);
    let mut parsed = ParsedReply::default();

    let mut cursor = 0;
    let mut saw_record = false;

    while let Some(start) = find_element(text, "record", cursor) {
        saw_record = true;
        let next_start = find_element(text, "record", start + 1).unwrap_or(text.len());

        match parse_record_block(text, start, next_start) {
            Ok((block, end)) => {
                cursor = end;
                collect_block(block, scope, &mut parsed);
            }
            Err(warning) => {
                parsed.warnings.push(warning);
                cursor = next_start;
            }
        }
    }

    if !saw_record && find_element(text, "records", 0).is_none() {
        return Err(MalformedReply::new(
            "no <records> container or <record> elements found",
            text,
        ));
    }

    Ok(parsed)
}

/// Strips a surrounding ```xml … ``` or ``` … ``` fence.
pub fn strip_code_fences(text: &str) -> &str {
    let text = text.trim();
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. `xml`) on the opening fence line.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end()
        .strip_suffix("```")
        .map(str::trim)
        .unwrap_or(body.trim())
}

// ────────────────────────────────────────────────────────────────────────────
// Record and field scanning
// ────────────────────────────────────────────────────────────────────────────

struct RecordBlock<'t> {
    id: RecordId,
    fields: Vec<(String, String)>,
    source: &'t str,
}

/// Parses the `<record>` element starting at `start`. The block must close
/// before `limit` (the next record's start). Returns the block and the offset
/// just past its closing tag.
fn parse_record_block(
    text: &str,
    start: usize,
    limit: usize,
) -> Result<(RecordBlock<'_>, usize), MalformedReply> {
    let region = &text[start..limit];

    let open_end = region
        .find('>')
        .ok_or_else(|| MalformedReply::new("unterminated <record> tag", region))?;
    let attrs = &region["<record".len()..open_end];

    let close = region[open_end..]
        .find("</record>")
        .map(|i| open_end + i)
        .ok_or_else(|| MalformedReply::new("record block is missing </record>", region))?;
    let source = &region[..close + "</record>".len()];

    let id_attr = attribute(attrs, "id")
        .ok_or_else(|| MalformedReply::new("record block has no id attribute", source))?;
    let id = id_attr
        .trim()
        .parse::<RecordId>()
        .map_err(|_| MalformedReply::new(format!("invalid record id '{id_attr}'"), source))?;

    let fields = parse_fields(&region[open_end + 1..close])
        .map_err(|message| MalformedReply::new(message, source))?;

    Ok((RecordBlock { id, fields, source }, start + source.len()))
}

/// Parses every `<field name="…">…</field>` in a record body. Any structural
/// problem fails the whole record.
fn parse_fields(body: &str) -> Result<Vec<(String, String)>, String> {
    let mut fields = Vec::new();
    let mut cursor = 0;

    while let Some(start) = find_element(body, "field", cursor) {
        let tag_end = body[start..]
            .find('>')
            .map(|i| start + i)
            .ok_or_else(|| "unterminated <field> tag".to_string())?;
        let tag = &body[start + "<field".len()..tag_end];

        let self_closing = tag.trim_end().ends_with('/');
        let attrs = tag.trim_end().trim_end_matches('/');
        let name = attribute(attrs, "name").ok_or_else(|| "field has no name attribute".to_string())?;

        if self_closing {
            fields.push((name, String::new()));
            cursor = tag_end + 1;
            continue;
        }

        let content_start = tag_end + 1;
        let close = body[content_start..]
            .find("</field>")
            .map(|i| content_start + i)
            .ok_or_else(|| format!("field '{name}' is missing </field>"))?;
        let content = &body[content_start..close];
        if find_element(content, "field", 0).is_some() {
            return Err(format!("field '{name}' is not closed before the next field"));
        }

        fields.push((name, unescape_xml(content)));
        cursor = close + "</field>".len();
    }

    Ok(fields)
}

fn collect_block(block: RecordBlock<'_>, scope: &ReplyScope<'_>, parsed: &mut ParsedReply) {
    if !scope.target_ids.contains(&block.id) {
        tracing::debug!(
            "Ignoring reply block for record {} outside the batch: {}",
            block.id,
            excerpt(block.source)
        );
        parsed.ignored_records += 1;
        return;
    }

    for (field, content) in block.fields {
        if scope.policy.is_selected(&field) {
            parsed.values.push(ReplyFieldValue {
                record_id: block.id,
                field,
                content,
            });
        } else {
            parsed.ignored_fields += 1;
        }
    }
}

/// Finds the next `<name` opening tag at or after `from` whose name is not a
/// prefix of a longer tag name (so `record` does not match `<records`).
fn find_element(text: &str, name: &str, from: usize) -> Option<usize> {
    let needle = format!("<{name}");
    let mut cursor = from;
    while let Some(pos) = text.get(cursor..)?.find(&needle) {
        let at = cursor + pos;
        let after = text[at + needle.len()..].chars().next();
        match after {
            Some(c) if c.is_whitespace() || c == '>' || c == '/' => return Some(at),
            // Truncated right after the tag name still counts as an element start.
            None => return Some(at),
            _ => cursor = at + needle.len(),
        }
    }
    None
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    ATTR_RE
        .captures_iter(attrs)
        .find(|caps| &caps[1] == name)
        .and_then(|caps| caps.get(2).or_else(|| caps.get(3)))
        .map(|m| unescape_xml(m.as_str()))
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= FRAGMENT_CHARS {
        trimmed.to_string()
    } else {
        let mut cut: String = trimmed.chars().take(FRAGMENT_CHARS).collect();
        cut.push('…');
        cut
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
