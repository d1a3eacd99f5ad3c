//! Rendering of prompt arguments and tool results into message text.
//!
//! Prompt arguments (upper-case keys) become one user message: each key is a
//! labeled section, rendered in map order so identical arguments always
//! produce identical text. Tool results are serialized the same way a user
//! would paste them: strings verbatim, everything else as pretty JSON.

use serde_json::Value as JsonValue;

use crate::args::ArgMap;

/// Render one JSON value as message text.
///
/// Strings pass through untouched; structured values become pretty-printed
/// JSON so the model sees well-formed data rather than Rust debug output.
pub fn value_to_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

/// Render prompt arguments into the body of a single user message.
pub fn render_prompt_args(prompt_args: &ArgMap) -> String {
    let mut sections = Vec::with_capacity(prompt_args.len());
    for (key, value) in prompt_args {
        sections.push(format!("{}:\n{}", key, value_to_text(value)));
    }
    sections.join("\n\n")
}

/// Extract the body of a fenced block of the given kind from response text.
///
/// Matches a ```<kind> opener first; if the response used a bare ``` fence
/// instead, the first unlabeled block is accepted.
pub fn extract_block(text: &str, kind: &str) -> Option<String> {
    find_fenced(text, Some(kind)).or_else(|| find_fenced(text, None))
}

fn find_fenced(text: &str, kind: Option<&str>) -> Option<String> {
    let mut body: Vec<&str> = Vec::new();
    let mut in_block = false;

    for line in text.lines() {
        let trimmed = line.trim();
        if !in_block {
            if let Some(label) = trimmed.strip_prefix("```") {
                let matches = match kind {
                    Some(kind) => label.trim() == kind,
                    None => label.trim().is_empty(),
                };
                if matches {
                    in_block = true;
                }
            }
        } else if trimmed == "```" {
            return Some(body.join("\n"));
        } else {
            body.push(line);
        }
    }
    None
}
