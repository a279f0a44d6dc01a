//! Extract a JSON object from an agent reply.
//!
//! Agents may answer with a bare JSON document, a fenced code block, or
//! prose wrapping one or more objects.

use crate::error::AgentError;
use serde_json::Value;

/// Keys that mark an object as the agent's actual verdict.
const VERDICT_KEYS: [&str; 4] = ["decision", "agent", "status", "final_action"];

/// Normalise a raw agent body into a JSON object.
pub fn normalize_body(body: Value) -> Result<Value, AgentError> {
    match body {
        Value::Object(_) => Ok(body),
        Value::String(text) => extract_json(&text),
        other => Err(AgentError::Malformed(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

/// Pull the verdict object out of free text.
pub fn extract_json(text: &str) -> Result<Value, AgentError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(AgentError::Malformed("empty response".to_string()));
    }

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    for block in fenced_blocks(trimmed) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(value);
        }
    }

    let candidates: Vec<Value> = brace_candidates(trimmed)
        .into_iter()
        .filter_map(|slice| serde_json::from_str::<Value>(slice).ok())
        .filter(Value::is_object)
        .collect();

    if let Some(preferred) = candidates.iter().find(|c| has_verdict_key(c)) {
        return Ok(preferred.clone());
    }

    candidates
        .into_iter()
        .max_by_key(|c| c.to_string().len())
        .ok_or_else(|| {
            let preview: String = trimmed.chars().take(120).collect();
            AgentError::Malformed(format!("no JSON object found in: {}", preview))
        })
}

fn has_verdict_key(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| VERDICT_KEYS.iter().any(|key| map.contains_key(*key)))
        .unwrap_or(false)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Contents of ``` fenced blocks, with an optional language tag stripped.
fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];

        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => break,
        }
    }

    blocks
}

/// Every top-level balanced `{...}` slice, skipping braces inside strings.
fn brace_candidates(text: &str) -> Vec<&str> {
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        candidates.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_direct_json() {
        let value = extract_json(r#" {"decision": "CLEAR", "confidence": 95} "#).unwrap();
        assert_eq!(value["decision"], "CLEAR");
    }

    #[test]
    fn test_fenced_block() {
        let text = "Here is the verdict:\n```json\n{\"status\": \"BREACH\"}\n```\nThanks.";
        assert_eq!(extract_json(text).unwrap(), json!({"status": "BREACH"}));
    }

    #[test]
    fn test_prefers_verdict_object_over_larger_one() {
        let text = r#"Context {"notes": "a very long note about the payment history"} and
            result {"decision": "BLOCK"} done"#;
        assert_eq!(extract_json(text).unwrap(), json!({"decision": "BLOCK"}));
    }

    #[test]
    fn test_braces_inside_strings_are_ignored() {
        let text = r#"prefix {"reason": "closing } inside", "final_action": "HOLD"} suffix"#;
        assert_eq!(extract_json(text).unwrap()["final_action"], "HOLD");
    }

    #[test]
    fn test_no_json_is_malformed() {
        assert!(matches!(extract_json("sorry, cannot help"), Err(AgentError::Malformed(_))));
        assert!(matches!(extract_json("   "), Err(AgentError::Malformed(_))));
        assert!(matches!(normalize_body(json!([1, 2])), Err(AgentError::Malformed(_))));
    }

    #[test]
    fn test_string_body_is_unwrapped() {
        let body = Value::String("```\n{\"agent\": \"liquidity\"}\n```".to_string());
        assert_eq!(normalize_body(body).unwrap()["agent"], "liquidity");
    }
}
