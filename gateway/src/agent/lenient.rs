//! Tolerant JSON parsing for accumulated tool arguments.
//!
//! Models occasionally emit near-JSON in `input_json_delta` fragments:
//! single-quoted strings, trailing commas, or nothing at all. Strict
//! parsing is tried first; the lenient pass normalizes those deviations
//! before giving up.

use serde_json::Value;

use crate::error::{RelayError, RelayResult};

/// Parse tool arguments, accepting single-quoted strings and trailing
/// commas. Empty input parses as `{}`.
pub fn parse_lenient(input: &str) -> RelayResult<Value> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let normalized = normalize(trimmed);
    serde_json::from_str(&normalized)
        .map_err(|e| RelayError::InvalidRequest(format!("unparseable tool arguments: {e}")))
}

/// Rewrite single-quoted strings to double-quoted and drop trailing
/// commas, tracking string state so quoted content is left alone.
fn normalize(input: &str) -> String {
    #[derive(PartialEq)]
    enum Ctx {
        Plain,
        InDouble,
        InSingle,
    }

    let mut out = String::with_capacity(input.len());
    let mut ctx = Ctx::Plain;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match ctx {
            Ctx::Plain => match c {
                '"' => {
                    ctx = Ctx::InDouble;
                    out.push('"');
                }
                '\'' => {
                    ctx = Ctx::InSingle;
                    out.push('"');
                }
                ',' => {
                    // Look ahead past whitespace: a closing bracket makes
                    // this a trailing comma.
                    let mut lookahead = chars.clone();
                    let mut next_significant = None;
                    for la in lookahead.by_ref() {
                        if !la.is_whitespace() {
                            next_significant = Some(la);
                            break;
                        }
                    }
                    if matches!(next_significant, Some('}') | Some(']')) {
                        // drop the comma
                    } else {
                        out.push(',');
                    }
                }
                _ => out.push(c),
            },
            Ctx::InDouble => match c {
                '\\' => {
                    out.push('\\');
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => {
                    ctx = Ctx::Plain;
                    out.push('"');
                }
                _ => out.push(c),
            },
            Ctx::InSingle => match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        if escaped == '\'' {
                            out.push('\'');
                        } else {
                            out.push('\\');
                            out.push(escaped);
                        }
                    }
                }
                '\'' => {
                    ctx = Ctx::Plain;
                    out.push('"');
                }
                '"' => out.push_str("\\\""),
                _ => out.push(c),
            },
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_strict_json_passes_through() {
        assert_eq!(
            parse_lenient(r#"{"city": "Oslo", "days": 3}"#).unwrap(),
            json!({"city": "Oslo", "days": 3})
        );
    }

    #[test]
    fn test_empty_input_is_empty_object() {
        assert_eq!(parse_lenient("").unwrap(), json!({}));
        assert_eq!(parse_lenient("   ").unwrap(), json!({}));
    }

    #[test]
    fn test_trailing_commas_accepted() {
        assert_eq!(
            parse_lenient(r#"{"a": 1, "b": [1, 2,],}"#).unwrap(),
            json!({"a": 1, "b": [1, 2]})
        );
    }

    #[test]
    fn test_single_quotes_accepted() {
        assert_eq!(
            parse_lenient(r#"{'query': 'select 1'}"#).unwrap(),
            json!({"query": "select 1"})
        );
    }

    #[test]
    fn test_double_quote_inside_single_quoted_string() {
        assert_eq!(
            parse_lenient(r#"{'note': 'say "hi"'}"#).unwrap(),
            json!({"note": "say \"hi\""})
        );
    }

    #[test]
    fn test_commas_inside_strings_untouched() {
        assert_eq!(
            parse_lenient(r#"{"csv": "a,b,", "n": 1}"#).unwrap(),
            json!({"csv": "a,b,", "n": 1})
        );
    }

    #[test]
    fn test_garbage_still_rejected() {
        assert!(parse_lenient("not json at all {{{").is_err());
    }
}
