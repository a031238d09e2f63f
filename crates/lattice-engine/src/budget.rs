use std::sync::OnceLock;

use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;
use tracing::debug;

use lattice_core::state::RunState;

/// Get or initialize the cl100k_base tokenizer.
fn tokenizer() -> &'static CoreBPE {
    static TOKENIZER: OnceLock<CoreBPE> = OnceLock::new();
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("Failed to load cl100k_base tokenizer"))
}

/// Accurate token count using BPE tokenization (cl100k_base).
pub fn estimate_tokens(text: &str) -> usize {
    tokenizer().encode_ordinary(text).len()
}

/// Findings inclusion order: most causally relevant upstream outputs first.
/// Allocation stops at the first finding that has to be truncated.
pub const FINDINGS_PRIORITY: &[&str] = &[
    "domain_intelligence",
    "historical_review",
    "slr",
    "news",
    "gap_synthesis",
    "innovation",
    "paper_decomposition",
    "understanding",
    "technical_verification",
    "critique",
    "visualization",
    "scoring",
];

// Rough chars-per-token conversion used when slicing to a character budget.
const CHARS_PER_TOKEN: usize = 4;

/// Trim a state snapshot to fit a token budget.
///
/// The core subset (task, source_url, job_id) is always kept verbatim. The
/// remaining character allowance is walked over the findings map in priority
/// order: a finding is included whole if it fits, otherwise it is truncated
/// to the remaining allowance and allocation stops — lower-priority findings
/// are dropped entirely, never partially spliced.
pub fn budget_context(state: &RunState, max_tokens: usize, reserve_tokens: usize) -> String {
    let core = json!({
        "task": state.task,
        "source_url": state.source_url,
        "job_id": state.job_id,
    });
    let core_str = core.to_string();

    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut remaining = max_chars
        .saturating_sub(core_str.len())
        .saturating_sub(reserve_tokens.saturating_mul(CHARS_PER_TOKEN));

    if state.findings.is_empty() || remaining == 0 {
        return core_str;
    }

    // Priority keys first, then any remaining findings in stable order.
    let mut order: Vec<&str> = FINDINGS_PRIORITY
        .iter()
        .copied()
        .filter(|key| state.findings.contains_key(*key))
        .collect();
    let mut rest: Vec<&str> = state
        .findings
        .keys()
        .map(|k| k.as_str())
        .filter(|k| !FINDINGS_PRIORITY.contains(k))
        .collect();
    rest.sort_unstable();
    order.extend(rest);

    let mut included = serde_json::Map::new();
    for key in order {
        let entry = &state.findings[key];
        let entry_str = entry.to_string();

        if entry_str.len() < remaining {
            included.insert(key.to_string(), entry.clone());
            remaining -= entry_str.len();
        } else {
            included.insert(key.to_string(), Value::String(smart_truncate(&entry_str, remaining)));
            break;
        }
    }

    let result = json!({
        "task": state.task,
        "source_url": state.source_url,
        "job_id": state.job_id,
        "findings": Value::Object(included),
    });
    let result_str = result.to_string();
    debug!(tokens = estimate_tokens(&result_str), "Context budgeted");
    result_str
}

/// Truncate text while attempting to preserve JSON structure.
///
/// Arrays and objects shed whole entries from the tail until they fit; plain
/// text falls back to character slicing.
fn smart_truncate(text: &str, max_chars: usize) -> String {
    if text.len() <= max_chars {
        return text.to_string();
    }

    if let Ok(parsed) = serde_json::from_str::<Value>(text) {
        match parsed {
            Value::Array(mut items) => {
                while !items.is_empty() && Value::Array(items.clone()).to_string().len() > max_chars
                {
                    items.pop();
                }
                return Value::Array(items).to_string();
            }
            Value::Object(mut map) => {
                while !map.is_empty() && Value::Object(map.clone()).to_string().len() > max_chars {
                    let last_key = map.keys().next_back().cloned();
                    if let Some(key) = last_key {
                        map.remove(&key);
                    }
                }
                return Value::Object(map).to_string();
            }
            _ => {}
        }
    }

    format!("{}...(truncated)", truncate_str(text, max_chars))
}

/// Slice a string to at most `max_chars` bytes on a char boundary.
fn truncate_str(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut idx = max_chars;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    &text[..idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::state::StateUpdate;

    fn state_with_findings(entries: &[(&str, Value)]) -> RunState {
        let mut state = RunState::new("7", "graph neural networks for traffic");
        for (key, value) in entries {
            state.apply(StateUpdate::new().with_finding(*key, value.clone()));
        }
        state
    }

    #[test]
    fn core_fields_survive_any_budget() {
        let state = state_with_findings(&[("slr", json!({"papers": vec!["a"; 100]}))]);
        // Budget far below the core payload.
        let context = budget_context(&state, 1, 0);

        let parsed: Value = serde_json::from_str(&context).unwrap();
        assert_eq!(parsed["task"], "graph neural networks for traffic");
        assert_eq!(parsed["job_id"], "7");
        // All findings omitted, output still valid JSON.
        assert!(parsed.get("findings").is_none());
    }

    #[test]
    fn whole_findings_fit_under_generous_budget() {
        let state = state_with_findings(&[
            ("domain_intelligence", json!({"subfields": ["gnn"]})),
            ("slr", json!({"papers": 12})),
        ]);
        let context = budget_context(&state, 4096, 100);

        let parsed: Value = serde_json::from_str(&context).unwrap();
        assert_eq!(parsed["findings"]["domain_intelligence"]["subfields"][0], "gnn");
        assert_eq!(parsed["findings"]["slr"]["papers"], 12);
    }

    #[test]
    fn allocation_stops_at_first_truncation() {
        let big = json!({"text": "x".repeat(4000)});
        let state = state_with_findings(&[
            ("domain_intelligence", big.clone()),
            ("historical_review", json!({"short": true})),
            ("slr", json!({"short": true})),
        ]);
        // Enough for part of the first finding only.
        let context = budget_context(&state, 500, 0);

        let parsed: Value = serde_json::from_str(&context).unwrap();
        let findings = parsed["findings"].as_object().unwrap();
        assert!(findings.contains_key("domain_intelligence"));
        // Lower-priority findings are dropped entirely, never spliced.
        assert!(!findings.contains_key("historical_review"));
        assert!(!findings.contains_key("slr"));
    }

    #[test]
    fn priority_order_is_respected() {
        let filler = json!({"text": "y".repeat(2000)});
        let state = state_with_findings(&[
            ("slr", filler.clone()),
            ("domain_intelligence", filler.clone()),
        ]);
        // Room for roughly one finding.
        let context = budget_context(&state, 300, 0);

        let parsed: Value = serde_json::from_str(&context).unwrap();
        let findings = parsed["findings"].as_object().unwrap();
        // domain_intelligence outranks slr.
        assert!(findings.contains_key("domain_intelligence"));
        assert!(!findings.contains_key("slr"));
    }

    #[test]
    fn smart_truncate_pops_array_items() {
        let text = serde_json::to_string(&json!(["aaaa", "bbbb", "cccc", "dddd"])).unwrap();
        let truncated = smart_truncate(&text, 18);
        let parsed: Value = serde_json::from_str(&truncated).unwrap();
        let items = parsed.as_array().unwrap();
        assert!(!items.is_empty());
        assert!(items.len() < 4);
    }

    #[test]
    fn smart_truncate_plain_text_slices_on_char_boundary() {
        let text = "héllo wörld ".repeat(50);
        let truncated = smart_truncate(&text, 25);
        assert!(truncated.ends_with("...(truncated)"));
    }

    #[test]
    fn token_estimation_is_nonzero_for_text() {
        assert!(estimate_tokens("hello world") >= 1);
        assert_eq!(estimate_tokens(""), 0);
    }
}
