// Cross-cutting system prompt for generation calls. The per-run prompt
// wording lives in transform/prompts.rs alongside the payload builder.

/// System prompt that enforces a reply in the payload's tag format only.
pub const XML_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with the <records> XML block only. \
    Keep every record id and field name exactly as given. \
    Do NOT include any text outside the XML. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";
