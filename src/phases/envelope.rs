//! Envelope extraction — pull the structured JSON out of a model's final
//! message.
//!
//! Parser policy: prefer a fenced ```json block; otherwise take the first
//! syntactically-valid JSON value in the text. Array entries missing
//! required keys are dropped while the rest of the array is kept.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```json\s*\n(.*?)```").expect("static regex"))
}

/// Locate the first parseable JSON value in the text.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Some(captures) = fence_re().captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&captures[1]) {
            return Some(value);
        }
    }
    first_balanced_value(text)
}

/// Scan for `{` / `[` openers and try to parse each balanced candidate,
/// returning the first that is valid JSON.
fn first_balanced_value(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'{' || b == b'[' {
            if let Some(end) = balanced_end(bytes, i) {
                if let Ok(value) = serde_json::from_str::<Value>(&text[i..=end]) {
                    return Some(value);
                }
            }
        }
        i += 1;
    }
    None
}

/// Index of the byte closing the value opened at `start`, tracking strings
/// and escapes.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// The improvements array from an observe envelope, keeping only entries
/// that carry a usable title or description.
pub fn parse_improvements(envelope: &Value) -> Vec<Value> {
    envelope
        .get("improvements")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    item.get("title")
                        .or_else(|| item.get("description"))
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| !s.trim().is_empty())
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Extract a string field, accepting either `"field": "x"` or a nested
/// object's `id`.
pub fn string_or_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Object(obj) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .map(String::from),
        _ => None,
    }
}

pub fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_block_wins() {
        let text = "Some prose {not json}\n```json\n{\"a\": 1}\n```\ntrailing";
        assert_eq!(extract_json(text), Some(json!({"a": 1})));
    }

    #[test]
    fn bare_object_is_found_after_invalid_candidate() {
        let text = "weird {braces but not json] then {\"ok\": true} after";
        assert_eq!(extract_json(text), Some(json!({"ok": true})));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"result: {"msg": "has } and { inside", "n": 2}"#;
        let value = extract_json(text).unwrap();
        assert_eq!(value["n"], 2);
    }

    #[test]
    fn no_json_yields_none() {
        assert_eq!(extract_json("plain prose, no structure"), None);
    }

    #[test]
    fn improvements_drop_entries_without_title() {
        let envelope = json!({
            "improvements": [
                {"title": "fix parser", "category": "bug"},
                {"category": "bug"},
                {"title": "   "},
                {"description": "untitled but described"}
            ]
        });
        let items = parse_improvements(&envelope);
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn string_or_id_accepts_both_shapes() {
        let obj = json!({"id": "improve-1", "title": "t"});
        assert_eq!(string_or_id(Some(&obj)), Some("improve-1".into()));
        let s = json!("improve-2");
        assert_eq!(string_or_id(Some(&s)), Some("improve-2".into()));
        assert_eq!(string_or_id(Some(&json!(null))), None);
        assert_eq!(string_or_id(None), None);
    }
}
