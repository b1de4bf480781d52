//! Step conditions
//!
//! A condition is a template. `lhs == rhs` and `lhs != rhs` compare the
//! resolved text of both sides; anything else is judged by truthiness.
//! A condition that still references something unresolvable is false.

use crate::core::template::{stringify, Scope, TemplateResolver};
use serde_json::Value;

/// Evaluate a step condition within a scope
pub fn evaluate(condition: &str, scope: Scope<'_>) -> bool {
    for (op, equal) in [("!=", false), ("==", true)] {
        if let Some((lhs, rhs)) = condition.split_once(op) {
            let (Some(lhs), Some(rhs)) = (resolve_operand(lhs, scope), resolve_operand(rhs, scope))
            else {
                return false;
            };
            return (lhs == rhs) == equal;
        }
    }

    let resolution = TemplateResolver::resolve_detailed(condition, scope);
    resolution.unresolved.is_empty() && is_truthy(&resolution.value)
}

fn resolve_operand(operand: &str, scope: Scope<'_>) -> Option<String> {
    let resolution = TemplateResolver::resolve_detailed(operand.trim(), scope);
    if !resolution.unresolved.is_empty() {
        return None;
    }
    let text = stringify(&resolution.value);
    Some(unquote(text.trim()).to_string())
}

fn unquote(text: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = text
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return inner;
        }
    }
    text
}

/// Truthiness of a resolved value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => {
            let s = s.trim().to_ascii_lowercase();
            !matches!(s.as_str(), "" | "false" | "no" | "off" | "0" | "null")
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}
