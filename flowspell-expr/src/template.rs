// ABOUTME: {{ ... }} template expansion against a scope map
// ABOUTME: Expansion never fails; unresolvable placeholders become null/empty

use crate::eval::evaluate;
use serde_json::{Map, Value};
use tracing::debug;

/// Render a value into template output text. Null renders empty, strings
/// render without quotes, containers render as JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Expand `{{ … }}` placeholders in a template string.
///
/// A template that is exactly one placeholder yields the evaluated value
/// itself, preserving its type; mixed text yields a string. Evaluation
/// failures resolve to null/empty and are logged, never raised.
pub fn expand_string(template: &str, scope: &Map<String, Value>) -> Value {
    let trimmed = template.trim();
    if let Some(inner) = single_placeholder(trimmed) {
        return match evaluate(inner, scope) {
            Ok(value) => value,
            Err(err) => {
                debug!(template = %template, error = %err, "template expression failed");
                Value::Null
            }
        };
    }

    if !template.contains("{{") {
        return Value::String(template.to_string());
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                let expr = &after[..close];
                match evaluate(expr.trim(), scope) {
                    Ok(value) => out.push_str(&render(&value)),
                    Err(err) => {
                        debug!(expression = %expr, error = %err, "template expression failed");
                    }
                }
                rest = &after[close + 2..];
            }
            None => {
                // Unterminated placeholder: keep the raw text.
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    Value::String(out)
}

/// True when the whole string is one `{{ … }}` placeholder; returns the
/// inner expression.
fn single_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Recursively expand templates inside a JSON payload: strings are expanded,
/// arrays and objects are walked, other values pass through.
pub fn expand_value(value: &Value, scope: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => expand_string(s, scope),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| expand_value(v, scope)).collect())
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_value(v, scope));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("scope must be an object"),
        }
    }

    #[test]
    fn plain_strings_pass_through() {
        let s = scope(json!({}));
        assert_eq!(expand_string("no templates", &s), json!("no templates"));
    }

    #[test]
    fn single_placeholder_preserves_type() {
        let s = scope(json!({"state": {"items": [1, 2]}}));
        assert_eq!(expand_string("{{ state.items }}", &s), json!([1, 2]));
        assert_eq!(expand_string("{{ state.items.length }}", &s), json!(2));
    }

    #[test]
    fn mixed_text_interpolates() {
        let s = scope(json!({"state": {"counter": 5}, "computed": {"doubled": 10}}));
        assert_eq!(
            expand_string("c={{ state.counter }} d={{ computed.doubled }}", &s),
            json!("c=5 d=10")
        );
    }

    #[test]
    fn undefined_renders_empty_in_text_and_null_alone() {
        let s = scope(json!({}));
        assert_eq!(expand_string("v={{ missing }}", &s), json!("v="));
        assert_eq!(expand_string("{{ missing }}", &s), json!(null));
    }

    #[test]
    fn broken_expressions_never_raise() {
        let s = scope(json!({}));
        assert_eq!(expand_string("x={{ 1 +++ }}", &s), json!("x="));
        assert_eq!(expand_string("{{ missing.deep }}", &s), json!(null));
    }

    #[test]
    fn unterminated_placeholder_is_literal() {
        let s = scope(json!({}));
        assert_eq!(expand_string("a {{ b", &s), json!("a {{ b"));
    }

    #[test]
    fn expand_value_walks_containers() {
        let s = scope(json!({"item": "a.ts", "index": 1}));
        let payload = json!({
            "file": "{{ item }}",
            "args": ["--index", "{{ index }}"],
            "nested": {"n": "{{ index }}"}
        });
        let expanded = expand_value(&payload, &s);
        assert_eq!(expanded["file"], json!("a.ts"));
        assert_eq!(expanded["args"][1], json!(1));
        assert_eq!(expanded["nested"]["n"], json!(1));
    }

    #[test]
    fn arrays_render_as_json_in_text() {
        let s = scope(json!({"items": ["a", "b"]}));
        assert_eq!(
            expand_string("got {{ items }}", &s),
            json!("got [\"a\",\"b\"]")
        );
    }
}
