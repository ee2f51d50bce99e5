//! Markup-aware text measures shared by example ranking and field merging.
//!
//! Field contents may carry HTML formatting. A field holding only markup
//! (`<br>`, `<div></div>`, `&nbsp;`) counts as empty, and word counts are taken
//! over the visible text only.

use once_cell::sync::Lazy;
use regex::Regex;

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static SPACE_ENTITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)&(nbsp|ensp|emsp|thinsp|#160|#xa0);").unwrap());

/// Removes tags and whitespace entities, leaving the visible text.
/// Tags become spaces so adjacent words separated only by markup stay apart.
pub fn strip_markup(content: &str) -> String {
    let without_tags = TAG_RE.replace_all(content, " ");
    SPACE_ENTITY_RE.replace_all(&without_tags, " ").into_owned()
}

/// True when the content is zero-length after removing markup and surrounding whitespace.
pub fn is_blank(content: &str) -> bool {
    if content.trim().is_empty() {
        return true;
    }
    strip_markup(content).trim().is_empty()
}

pub fn word_count(content: &str) -> usize {
    strip_markup(content).split_whitespace().count()
}
