// Prompt wording for the field-filling request. The record blocks themselves
// are produced by `payload.rs`; these fragments wrap them.

pub const INTRODUCTION: &str =
    "You are a structured-record assistant. Your task is to fill empty fields in records based on context.";

pub const INSTRUCTIONS_HEADER: &str = "Instructions:";

/// Replace `{field}` and `{instruction}`.
pub const FIELD_INSTRUCTION_LINE: &str = "- For field '{field}': {instruction}";

pub const GENERIC_FILL_WITH_EXAMPLES: &str =
    "- Fill empty fields intelligently based on field names, container context, and examples.";

pub const GENERIC_FILL_WITHOUT_EXAMPLES: &str =
    "- Fill empty fields intelligently based on field names and container context.";

/// Replace `{field}`.
pub const FILL_SINGLE_FIELD: &str = "- Fill in only the following empty field: \"{field}\".";

/// Replace `{fields}` with a comma separated, single-quoted list.
pub const FILL_MULTIPLE_FIELDS: &str = "- Fill in only the following empty fields: {fields}.";

pub const STRUCTURE_RULES: &str = "\
- Keep every record's id attribute exactly as given.
- Escape &, <, > and quotes inside field content.
- Do not add records that were not requested.";

pub const EXAMPLES_HEADER: &str = "Here are some example records from the collection:";

/// Replace `{field}`.
pub const TARGETS_SINGLE_FIELD: &str = "Please fill the specified empty field (\"{field}\") in the following records and return them in the same XML format:";

pub const TARGETS_MULTIPLE_FIELDS: &str =
    "Please fill the specified empty fields in the following records and return them in the same XML format:";

