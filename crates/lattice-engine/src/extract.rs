use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("valid fence regex"))
}

/// Extract a JSON value from model output, handling markdown code fences and
/// conversational noise.
///
/// Layered fallbacks: direct parse → fenced block → first-to-last brace span
/// → raw-text wrap. Always returns a value; a malformed completion never
/// becomes an error at the step boundary.
pub fn extract_json(text: &str) -> Value {
    // 1. Direct parse
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return value;
    }

    // 2. Extract from markdown ```json ... ```
    if let Some(captures) = fence_re().captures(text) {
        if let Some(inner) = captures.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(inner.as_str()) {
                return value;
            }
        }
    }

    // 3. First '{' to last '}' span
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return value;
            }
        }
    }

    // 4. Fallback: wrap the raw text
    debug!("Could not parse JSON from model output, wrapping raw text");
    json!({ "raw_text": text })
}
