//! `{{path}}` placeholder substitution over JSON trees
//!
//! Rule steps may reference task variables and prior step outputs with
//! `{{vars.url}}`-style placeholders. Substitution walks the step value
//! homomorphically: strings are rewritten, containers are rebuilt with the
//! same shape, and all other scalars pass through untouched.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_json::Value;

lazy_static! {
    static ref PLACEHOLDER_RE: Regex =
        Regex::new(r#"\{\{([\w\[\].'"-]+)\}\}"#).expect("placeholder regex is valid");
}

/// Look a dotted path up in the given context.
///
/// Path segments address object keys; a `name[idx]` segment indexes into an
/// array under `name`. A missing segment resolves to `None`.
pub fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;

    for part in path.split('.') {
        if let Some((name, idx_str)) = part
            .strip_suffix(']')
            .and_then(|p| p.split_once('['))
        {
            let idx: usize = idx_str.parse().ok()?;
            current = current.get(name)?.get(idx)?;
        } else {
            current = current.get(part)?;
        }
    }

    Some(current)
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Replace every placeholder in a string. Unresolvable paths become "".
pub fn substitute_str(input: &str, context: &Value) -> String {
    PLACEHOLDER_RE
        .replace_all(input, |caps: &Captures<'_>| {
            let path = caps[1].trim();
            resolve_path(context, path)
                .map(value_to_string)
                .unwrap_or_default()
        })
        .into_owned()
}

/// Substitute placeholders throughout a JSON value, preserving its shape.
pub fn resolve_placeholders(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, context)),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_placeholders(v, context)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_placeholders(v, context)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "vars": { "url": "https://example.com/q/42", "timeout": 20 },
            "steps": { "page": { "fields": ["first", "second"] } }
        })
    }

    #[test]
    fn test_simple_substitution() {
        let out = substitute_str("go to {{vars.url}}", &context());
        assert_eq!(out, "go to https://example.com/q/42");
    }

    #[test]
    fn test_indexed_path() {
        let out = substitute_str("{{steps.page.fields[1]}}", &context());
        assert_eq!(out, "second");
    }

    #[test]
    fn test_unresolved_becomes_empty() {
        let out = substitute_str("x={{vars.missing}}!", &context());
        assert_eq!(out, "x=!");
    }

    #[test]
    fn test_non_string_value_rendered() {
        let out = substitute_str("wait {{vars.timeout}}s", &context());
        assert_eq!(out, "wait 20s");
    }

    #[test]
    fn test_tree_substitution_preserves_shape() {
        let step = json!({
            "use": "offscreen",
            "count": 3,
            "rules": { "fields": [{ "selector": "{{vars.url}}" }] }
        });
        let resolved = resolve_placeholders(&step, &context());
        assert_eq!(resolved["count"], json!(3));
        assert_eq!(
            resolved["rules"]["fields"][0]["selector"],
            json!("https://example.com/q/42")
        );
    }
}
