//! Tolerant extraction of structured calls from LLM responses.
//!
//! Models wrap their answer in prose, code fences, or slightly broken JSON.
//! Extraction tries, in order:
//!
//! 1. the first fenced code block (```` ```json ````, ```` ```yaml ````, bare),
//! 2. JSON with repairs: missing commas between containers, trailing
//!    commas, unquoted keys, unterminated strings and unclosed brackets,
//! 3. YAML.
//!
//! If none yields a call list the result is [`Error::DataParsing`].

use serde_json::Value as Json;
use tracing::debug;

use super::Call;
use crate::{Error, Result};

/// Parse every call in `response`, in the order the model emitted them.
pub fn extract_calls(response: &str) -> Result<Vec<Call>> {
    let body = code_block(response).unwrap_or(response).trim();
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let parsed = extract_json(body)
        .map(|(_, json)| json)
        .or_else(|_| serde_yaml::from_str::<Json>(body).map_err(Error::from))
        .map_err(|e| Error::DataParsing { message: e.to_string(), data: Some(response.to_string()) })?;

    let items = match parsed {
        Json::Array(items) => items,
        Json::Object(mut obj) => match obj.remove("calls") {
            Some(Json::Array(items)) => items,
            _ => vec![Json::Object(obj)],
        },
        other => {
            return Err(Error::DataParsing {
                message: format!("expected a list of calls, got {other}"),
                data: Some(response.to_string()),
            });
        }
    };

    let calls: Vec<Call> = items.iter().filter_map(Call::from_json).collect();
    if calls.is_empty() && !items.is_empty() {
        return Err(Error::DataParsing {
            message: "no entry names a function".into(),
            data: Some(response.to_string()),
        });
    }
    debug!(count = calls.len(), "extracted calls");
    Ok(calls)
}

/// Contents of the first fenced code block, language tag removed.
pub fn code_block(text: &str) -> Option<&str> {
    let start = text.find("```")? + 3;
    let rest = &text[start..];
    let body_start = rest.find('\n').map(|i| i + 1).unwrap_or(0);
    let tag = rest[..body_start].trim();
    if !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
        // `{...}` right after the fence, no language tag
        let end = rest.find("```").unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
    let body = &rest[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

/// Repair common JSON faults outside of string literals.
pub fn fix_faulty_json(data: &str) -> String {
    let chars: Vec<char> = data.chars().collect();
    let mut out = String::with_capacity(data.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());
    let last_significant = |out: &str| out.chars().rev().find(|c| !c.is_whitespace());

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' if matches!(next_significant(i + 1), Some('}' | ']') | None) => {}
            '{' | '[' if matches!(last_significant(&out), Some('}' | ']')) => {
                out.push(',');
                out.push(c);
            }
            c if (c.is_ascii_alphabetic() || c == '_') && matches!(last_significant(&out), Some('{' | ',')) => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if next_significant(i) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else {
                    out.push_str(&word);
                }
                continue;
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

/// Find the first JSON container in `s`, closing any string or bracket
/// left open at the end of input, and parse it.
pub fn extract_json(s: &str) -> Result<(String, Json)> {
    let start = s
        .find(['{', '['])
        .ok_or_else(|| Error::DataParsing { message: "No JSON string found.".into(), data: Some(s.to_string()) })?;

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut end = None;
    for (offset, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => stack.push(c),
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    end = Some(start + offset + c.len_utf8());
                    break;
                }
            }
            _ => {}
        }
    }

    let mut candidate = match end {
        Some(end) => s[start..end].to_string(),
        None => {
            let mut open = s[start..].trim_end().to_string();
            if in_string {
                open.push('"');
            }
            while let Some(opener) = stack.pop() {
                open.push(if opener == '{' { '}' } else { ']' });
            }
            open
        }
    };

    if let Ok(json) = serde_json::from_str(&candidate) {
        return Ok((candidate, json));
    }
    candidate = fix_faulty_json(&candidate);
    let json = serde_json::from_str(&candidate)
        .map_err(|e| Error::DataParsing { message: e.to_string(), data: Some(candidate.clone()) })?;
    Ok((candidate, json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Value;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plain_json_list() {
        let calls = extract_calls(r#"[{"name": "add", "arguments": {"name": "A"}}]"#).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "add");
        assert_eq!(calls[0].arguments.get("name"), Some(&Value::from("A")));
    }

    #[test]
    fn test_fenced_with_prose_and_function_alias() {
        let text = "Sure, here you go:\n```json\n[{\"function\": \"remove\", \"arguments\": {\"name\": \"X\"}},]\n```\nDone.";
        let calls = extract_calls(text).unwrap();
        assert_eq!(calls[0].name, "remove");
    }

    #[test]
    fn test_calls_wrapper_object() {
        let calls = extract_calls(r#"{"calls": [{"name": "a"}, {"name": "b"}]}"#).unwrap();
        let names: Vec<&str> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_truncated_json_is_closed() {
        let calls = extract_calls(r#"[{"name": "add", "arguments": {"name": "unterminated"#).unwrap();
        assert_eq!(calls[0].arguments.get("name"), Some(&Value::from("unterminated")));
    }

    #[test]
    fn test_yaml_fallback() {
        let text = "```yaml\n- name: add\n  arguments:\n    name: A\n- name: remove\n  arguments:\n    name: B\n```";
        let calls = extract_calls(text).unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].arguments.get("name"), Some(&Value::from("B")));
    }

    #[test]
    fn test_garbage_is_parsing_error() {
        let err = extract_calls("I cannot help with that: {{{ ]]").unwrap_err();
        assert!(matches!(err, Error::DataParsing { .. }));
    }

    #[test]
    fn test_fix_faulty_json() {
        assert_eq!(fix_faulty_json(r#"{"a": 1,}"#), r#"{"a": 1}"#);
        assert_eq!(fix_faulty_json(r#"{"a": 1} {"b": 2}"#), r#"{"a": 1} ,{"b": 2}"#);
        assert_eq!(fix_faulty_json(r#"{name: "x, y",}"#), r#"{"name": "x, y"}"#);
    }

    #[test]
    fn test_extract_json_picks_first_container() {
        let (text, json) = extract_json("prefix {\"a\": [1, 2]} trailing {\"b\": 1}").unwrap();
        assert_eq!(text, "{\"a\": [1, 2]}");
        assert_eq!(json["a"][1], 2);
    }
}
