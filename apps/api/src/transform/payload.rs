//! Payload Serializer — renders example and target records into the nested tag
//! format sent to the text-generation service, wrapped in the fill prompt.
//!
//! Format:
//! ```text
//! <records type="Vocab">
//!   <record id="1" container="Spanish">
//!     <field name="Front">hola</field>
//!     <field name="Back"></field>
//!   </record>
//! </records>
//! ```
//! Content and attribute values are escaped so the structure round-trips exactly.

use serde::Serialize;

use crate::models::policy::{FieldInstructions, FieldPolicy};
use crate::models::record::{Record, RecordId};
use crate::transform::prompts::{
    EXAMPLES_HEADER, FIELD_INSTRUCTION_LINE, FILL_MULTIPLE_FIELDS, FILL_SINGLE_FIELD,
    GENERIC_FILL_WITHOUT_EXAMPLES, GENERIC_FILL_WITH_EXAMPLES, INSTRUCTIONS_HEADER, INTRODUCTION,
    STRUCTURE_RULES, TARGETS_MULTIPLE_FIELDS, TARGETS_SINGLE_FIELD,
};

/// One rendered request, ready for the client.
#[derive(Debug, Clone, Serialize)]
pub struct Payload {
    pub text: String,
    pub example_ids: Vec<RecordId>,
    pub target_ids: Vec<RecordId>,
}

impl Payload {
    /// Size in characters, the unit of the prompt budget.
    pub fn size(&self) -> usize {
        self.text.chars().count()
    }
}

/// A field emitted for target records; `blank` fields are sent without content.
#[derive(Debug, Clone)]
struct TargetField {
    name: String,
    blank: bool,
}

/// Builds payloads for one run. The prompt around the target block (instructions
/// and examples) is rendered once; each batch only renders its own target block.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    record_type: String,
    /// Everything preceding the target block.
    prompt_head: String,
    target_fields: Vec<TargetField>,
    example_ids: Vec<RecordId>,
}

impl PayloadBuilder {
    pub fn new(
        record_type: &str,
        examples: &[Record],
        policy: &FieldPolicy,
        instructions: &FieldInstructions,
    ) -> Self {
        let example_fields: Vec<&str> = policy.readable().collect();
        let examples_xml = if examples.is_empty() {
            String::new()
        } else {
            let blocks: Vec<String> = examples
                .iter()
                .map(|r| render_record(r, example_fields.iter().map(|f| (*f, false))))
                .collect();
            wrap_records(record_type, &blocks)
        };

        // Targets carry every readable and every writable field; overwritable
        // ones are blanked so the service regenerates them.
        let target_fields = policy
            .rules()
            .iter()
            .filter(|r| r.access.readable || r.access.writable)
            .map(|r| TargetField {
                name: r.name.clone(),
                blank: r.access.overwritable,
            })
            .collect();

        Self {
            record_type: record_type.to_string(),
            prompt_head: render_prompt_head(&policy.fields_to_fill(), instructions, &examples_xml),
            target_fields,
            example_ids: examples.iter().map(|r| r.id).collect(),
        }
    }

    /// Renders the block a single target record contributes to the payload.
    pub fn record_block(&self, record: &Record) -> String {
        render_record(
            record,
            self.target_fields.iter().map(|f| (f.name.as_str(), f.blank)),
        )
    }

    /// Characters one target record adds to the payload, separator included.
    pub fn record_size(&self, record: &Record) -> usize {
        self.record_block(record).chars().count() + 1
    }

    /// Characters of a payload with no target records. The size of a payload is
    /// exactly `base_size() + Σ record_size(target)`.
    pub fn base_size(&self) -> usize {
        self.prompt_head.chars().count() + wrap_records(&self.record_type, &[]).chars().count()
    }

    pub fn render(&self, targets: &[Record]) -> Payload {
        let blocks: Vec<String> = targets.iter().map(|r| self.record_block(r)).collect();
        let mut text = self.prompt_head.clone();
        text.push_str(&wrap_records(&self.record_type, &blocks));
        Payload {
            text,
            example_ids: self.example_ids.clone(),
            target_ids: targets.iter().map(|r| r.id).collect(),
        }
    }

    pub fn example_ids(&self) -> &[RecordId] {
        &self.example_ids
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rendering helpers
// ────────────────────────────────────────────────────────────────────────────

fn render_prompt_head(
    fields_to_fill: &[&str],
    instructions: &FieldInstructions,
    examples_xml: &str,
) -> String {
    let has_examples = !examples_xml.is_empty();
    let mut parts: Vec<String> = vec![
        INTRODUCTION.to_string(),
        String::new(),
        INSTRUCTIONS_HEADER.to_string(),
    ];

    // Instruction text appears once per field, never per record.
    let instructed: Vec<String> = fields_to_fill
        .iter()
        .filter_map(|field| {
            instructions
                .get(*field)
                .filter(|text| !text.trim().is_empty())
                .map(|text| {
                    FIELD_INSTRUCTION_LINE
                        .replace("{field}", field)
                        .replace("{instruction}", text.trim())
                })
        })
        .collect();

    if instructed.is_empty() {
        parts.push(if has_examples {
            GENERIC_FILL_WITH_EXAMPLES.to_string()
        } else {
            GENERIC_FILL_WITHOUT_EXAMPLES.to_string()
        });
    } else {
        parts.extend(instructed);
    }

    match fields_to_fill {
        [] => {}
        [single] => parts.push(FILL_SINGLE_FIELD.replace("{field}", single)),
        many => {
            let list = many
                .iter()
                .map(|f| format!("'{f}'"))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(FILL_MULTIPLE_FIELDS.replace("{fields}", &list));
        }
    }
    parts.push(STRUCTURE_RULES.to_string());

    if has_examples {
        parts.push(String::new());
        parts.push(EXAMPLES_HEADER.to_string());
        parts.push(String::new());
        parts.push(examples_xml.to_string());
    }
    parts.push(String::new());

    parts.push(match fields_to_fill {
        [single] => TARGETS_SINGLE_FIELD.replace("{field}", single),
        _ => TARGETS_MULTIPLE_FIELDS.to_string(),
    });
    parts.push(String::new());
    parts.push(String::new());

    parts.join("\n")
}

/// Renders one `<record>` element. Fields the record's type lacks are skipped.
fn render_record<'f>(record: &Record, fields: impl Iterator<Item = (&'f str, bool)>) -> String {
    let mut lines = vec![format!(
        "  <record id=\"{}\" container=\"{}\">",
        record.id,
        escape_xml(&record.container)
    )];

    for (name, blank) in fields {
        let Some(content) = record.field(name) else {
            continue;
        };
        let body = if blank {
            String::new()
        } else {
            escape_xml(content)
        };
        lines.push(format!(
            "    <field name=\"{}\">{}</field>",
            escape_xml(name),
            body
        ));
    }

    lines.push("  </record>".to_string());
    lines.join("\n")
}

fn wrap_records(record_type: &str, blocks: &[String]) -> String {
    let mut lines = Vec::with_capacity(blocks.len() + 2);
    lines.push(format!("<records type=\"{}\">", escape_xml(record_type)));
    lines.extend(blocks.iter().cloned());
    lines.push("</records>".to_string());
    lines.join("\n")
}

/// Escapes `&`, `<`, `>`, `"` and `'` for use in element text or attribute values.
pub fn escape_xml(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for c in content.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape_xml`], also accepting numeric character references.
/// Unknown or unterminated entities are kept literally.
pub fn unescape_xml(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let decoded = after
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&after[..end]).map(|c| (c, end)));

        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &after[end + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = if let Some(hex) = name
                .strip_prefix("#x")
                .or_else(|| name.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse::<u32>().ok()?
            };
            char::from_u32(code)
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
