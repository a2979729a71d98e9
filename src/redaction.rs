//! Secret scrubbing for anything that gets persisted or traced.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Marker written in place of a detected secret.
pub const REDACTED: &str = "[REDACTED]";

// Bare credentials: replaced wholesale.
static OPENAI_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9:_-]{16,}\b").unwrap());
static LANGFUSE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[ps]k-lf-[A-Za-z0-9:_-]{8,}").unwrap());

// Labelled credentials: the label survives, the value does not.
static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(authorization\s*:\s*bearer\s+)[A-Za-z0-9._:-]+").unwrap()
});
static API_KEY_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(api[-_ ]?key\s*[=:]\s*)["']?[A-Za-z0-9._:-]{8,}["']?"#).unwrap()
});
static TOKEN_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(token\s*[=:]\s*)["']?[A-Za-z0-9._:-]{8,}["']?"#).unwrap()
});

/// Replace credentials in free text with [`REDACTED`].
pub fn redact_text(value: &str) -> String {
    let replacement = format!("${{1}}{REDACTED}");
    let text = OPENAI_KEY.replace_all(value, REDACTED);
    let text = LANGFUSE_KEY.replace_all(&text, REDACTED);
    let text = BEARER.replace_all(&text, replacement.as_str());
    let text = API_KEY_ASSIGNMENT.replace_all(&text, replacement.as_str());
    let text = TOKEN_ASSIGNMENT.replace_all(&text, replacement.as_str());
    text.into_owned()
}

/// Recursively redact every string inside a JSON document.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(redact_text(s)),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), redact_value(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
