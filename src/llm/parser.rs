//! Response parsing for LLM outputs.
//!
//! Extracts queries from responses that may wrap them in markdown code
//! blocks, and coerces free-form completions into JSON where the caller
//! expects structured output.

use crate::error::{GatewayError, Result};

/// Strips markdown code fences from an LLM response, returning the inner
/// content of the first matching block.
///
/// A block tagged with the requested language wins; an untagged block is
/// the fallback. Without any code block the trimmed response is returned
/// as-is.
pub fn strip_code_fences(response: &str, lang: &str) -> String {
    for tag in [lang, ""] {
        if let Some(inner) = fenced_block(response, tag) {
            return inner.trim().to_string();
        }
    }
    response.trim().to_string()
}

/// Extracts the first JSON value from an LLM response.
///
/// Handles fenced ```json blocks, bare objects, and bare arrays. Fails
/// with [`GatewayError::LlmParseError`] carrying the raw text when nothing
/// parseable is found.
pub fn extract_json(response: &str) -> Result<serde_json::Value> {
    let candidate = strip_code_fences(response, "json");

    // Fast path: the whole candidate parses.
    if let Ok(value) = serde_json::from_str(&candidate) {
        return Ok(value);
    }

    // Otherwise scan for the first balanced object or array.
    for open in ['{', '['] {
        if let Some(slice) = balanced_slice(&candidate, open) {
            if let Ok(value) = serde_json::from_str(slice) {
                return Ok(value);
            }
        }
    }

    Err(GatewayError::llm_parse(
        "no JSON object or array found in response",
        response,
    ))
}

/// Finds the first balanced `{...}` or `[...]` slice, respecting strings.
fn balanced_slice(text: &str, open: char) -> Option<&str> {
    let close = if open == '{' { '}' } else { ']' };
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Returns the body of the first fenced block whose info string equals
/// `tag` (the empty tag matches only untagged fences).
///
/// Fences are consumed in opening/closing pairs, so a rejected block is
/// skipped wholesale and prose between blocks is never mistaken for
/// code. An unterminated fence yields no block.
fn fenced_block<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let mut rest = text;
    loop {
        let (_, opened) = rest.split_once("```")?;
        // The info string is whatever follows the fence on its line.
        let (info, body) = opened.split_once('\n')?;
        let (inner, after_close) = body.split_once("```")?;
        if info.trim() == tag {
            return Some(inner);
        }
        rest = after_close;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_sql_fence() {
        let response = "Here's the query:\n\n```sql\nSELECT * FROM users;\n```\n\nDone.";
        assert_eq!(strip_code_fences(response, "sql"), "SELECT * FROM users;");
    }

    #[test]
    fn test_strip_generic_fence() {
        let response = "```\nSELECT COUNT(*) FROM orders;\n```";
        assert_eq!(
            strip_code_fences(response, "sql"),
            "SELECT COUNT(*) FROM orders;"
        );
    }

    #[test]
    fn test_no_fence_returns_trimmed() {
        assert_eq!(
            strip_code_fences("  SELECT 1  ", "sql"),
            "SELECT 1".to_string()
        );
    }

    #[test]
    fn test_other_language_not_stripped_as_sql() {
        let response = "```python\nprint('hi')\n```";
        // No sql block, no bare block: returned as-is.
        assert_eq!(strip_code_fences(response, "sql"), response.trim());
    }

    #[test]
    fn test_fence_pairs_skip_prose_between_blocks() {
        // The rejected python block is consumed as a whole; the prose
        // between blocks is not mistaken for an untagged block.
        let response = "```python\nprint('hi')\n```\nprose here\n```\nSELECT 2;\n```";
        assert_eq!(strip_code_fences(response, "sql"), "SELECT 2;");
    }

    #[test]
    fn test_unterminated_fence_yields_no_block() {
        let response = "```sql\nSELECT 1";
        assert_eq!(strip_code_fences(response, "sql"), response.trim());
    }

    #[test]
    fn test_extract_json_fenced() {
        let response = "Sure:\n```json\n{\"collection\": \"orders\", \"pipeline\": []}\n```";
        let value = extract_json(response).unwrap();
        assert_eq!(value["collection"], json!("orders"));
    }

    #[test]
    fn test_extract_json_embedded_in_prose() {
        let response = "The query is {\"limit\": 5, \"note\": \"a } inside\"} as requested.";
        let value = extract_json(response).unwrap();
        assert_eq!(value["limit"], json!(5));
        assert_eq!(value["note"], json!("a } inside"));
    }

    #[test]
    fn test_extract_json_array() {
        let response = "Selected tools: [\"postgres.execute\", \"file.export\"]";
        let value = extract_json(response).unwrap();
        assert!(value.is_array());
        assert_eq!(value.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_extract_json_failure_carries_raw() {
        let response = "I cannot answer that question.";
        let err = extract_json(response).unwrap_err();
        match err {
            GatewayError::LlmParseError { raw, .. } => {
                assert_eq!(raw, response);
            }
            _ => panic!("expected LlmParseError"),
        }
    }

    #[test]
    fn test_nested_json() {
        let response = r#"{"filter": {"must": [{"key": "user", "match": {"value": "u1"}}]}}"#;
        let value = extract_json(response).unwrap();
        assert!(value["filter"]["must"].is_array());
    }
}
