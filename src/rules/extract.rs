//! Field extraction from HTML documents
//!
//! Rule documents describe a tree of typed field rules. `PROPERTY` captures
//! the flattened text of the first node a selector matches, optionally
//! refined by a regex and a `\0`..`\N` group template. `OBJECT` groups child
//! rules under one key; `OBJECTS` repeats its children over every match of
//! the selector and drops duplicate items, keeping first-seen order.

use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

lazy_static! {
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").expect("whitespace regex is valid");
}

/// Rule kinds recognized in a rule document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleType {
    Property,
    Object,
    Objects,
}

/// One field rule from a rule document
#[derive(Debug, Clone, Deserialize)]
pub struct FieldRule {
    pub field_name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default)]
    pub regexp: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub child: Vec<FieldRule>,
}

fn parse_selector(rule: &FieldRule) -> Result<Selector> {
    let raw = rule
        .selector
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("rule '{}' has no selector", rule.field_name)))?;
    Selector::parse(raw)
        .map_err(|e| Error::Validation(format!("invalid selector '{raw}': {e}")))
}

/// Flatten an element to text: trimmed fragments joined by single spaces.
fn node_text(node: ElementRef<'_>) -> String {
    node.text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn normalize_whitespace(text: &str) -> String {
    WHITESPACE_RE.replace_all(text, " ").trim().to_string()
}

/// Refine captured text with an optional regex and group template.
fn apply_regexp_and_template(
    text: &str,
    regexp: Option<&str>,
    template: Option<&str>,
) -> Result<String> {
    let Some(pattern) = regexp else {
        return Ok(normalize_whitespace(text));
    };

    let re = RegexBuilder::new(pattern)
        .dot_matches_new_line(true)
        .build()
        .map_err(|e| Error::Validation(format!("invalid regexp '{pattern}': {e}")))?;

    let Some(caps) = re.captures(text) else {
        return Ok(String::new());
    };

    let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();

    let Some(template) = template else {
        return Ok(normalize_whitespace(whole));
    };

    let mut result = template.to_string();
    for i in 1..caps.len() {
        let group = caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        result = result.replace(&format!("\\{i}"), group);
    }
    result = result.replace("\\0", whole);
    Ok(normalize_whitespace(&result))
}

/// Apply one rule to a node.
pub fn extract_field(node: ElementRef<'_>, rule: &FieldRule) -> Result<Value> {
    match rule.rule_type {
        RuleType::Property => {
            let selector = parse_selector(rule)?;
            let Some(matched) = node.select(&selector).next() else {
                return Ok(Value::String(String::new()));
            };
            let text = node_text(matched);
            Ok(Value::String(apply_regexp_and_template(
                &text,
                rule.regexp.as_deref(),
                rule.template.as_deref(),
            )?))
        }
        RuleType::Object => {
            let mut result = Map::new();
            for child in &rule.child {
                result.insert(child.field_name.clone(), extract_field(node, child)?);
            }
            Ok(Value::Object(result))
        }
        RuleType::Objects => {
            let selector = parse_selector(rule)?;
            let mut unique: Vec<Value> = Vec::new();
            for item_node in node.select(&selector) {
                let mut obj = Map::new();
                for child in &rule.child {
                    obj.insert(child.field_name.clone(), extract_field(item_node, child)?);
                }
                let value = Value::Object(obj);
                if !unique.contains(&value) {
                    unique.push(value);
                }
            }
            Ok(Value::Array(unique))
        }
    }
}

/// Run a resolved `rules` block against an HTML document.
///
/// Returns `{"fields": {...}}` keyed by each rule's field name.
pub fn run_rules(html: &str, rules: &Value) -> Result<Value> {
    let field_rules: Vec<FieldRule> = match rules.get("fields") {
        Some(fields) => serde_json::from_value(fields.clone())?,
        None => Vec::new(),
    };

    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut fields = Map::new();
    for rule in &field_rules {
        fields.insert(rule.field_name.clone(), extract_field(root, rule)?);
    }

    let mut result = Map::new();
    result.insert("fields".to_string(), Value::Object(fields));
    Ok(Value::Object(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAGE: &str = r#"
        <html><body>
          <h1 class="title">  Rust   Questions </h1>
          <span class="date">posted 2024-05-01 10:00</span>
          <ul>
            <li class="answer"><p>first answer</p><em>alice</em></li>
            <li class="answer"><p>second answer</p><em>bob</em></li>
            <li class="answer"><p>first answer</p><em>alice</em></li>
          </ul>
        </body></html>
    "#;

    fn run(rules: Value) -> Value {
        run_rules(PAGE, &rules).unwrap()
    }

    #[test]
    fn test_property_text_flattening() {
        let out = run(json!({
            "fields": [
                { "field_name": "title", "type": "PROPERTY", "selector": "h1.title" }
            ]
        }));
        assert_eq!(out["fields"]["title"], json!("Rust Questions"));
    }

    #[test]
    fn test_property_missing_selector_match() {
        let out = run(json!({
            "fields": [
                { "field_name": "none", "type": "PROPERTY", "selector": ".absent" }
            ]
        }));
        assert_eq!(out["fields"]["none"], json!(""));
    }

    #[test]
    fn test_regexp_and_template() {
        let out = run(json!({
            "fields": [{
                "field_name": "createdAt",
                "type": "PROPERTY",
                "selector": "span.date",
                "regexp": r"posted (\d{4}-\d{2}-\d{2}) (\d{2}:\d{2})",
                "template": r"\1T\2"
            }]
        }));
        assert_eq!(out["fields"]["createdAt"], json!("2024-05-01T10:00"));
    }

    #[test]
    fn test_regexp_no_match_is_empty() {
        let out = run(json!({
            "fields": [{
                "field_name": "createdAt",
                "type": "PROPERTY",
                "selector": "span.date",
                "regexp": r"updated (\d+)"
            }]
        }));
        assert_eq!(out["fields"]["createdAt"], json!(""));
    }

    #[test]
    fn test_objects_dedup_keeps_first_seen_order() {
        let out = run(json!({
            "fields": [{
                "field_name": "answers",
                "type": "OBJECTS",
                "selector": "li.answer",
                "child": [
                    { "field_name": "text", "type": "PROPERTY", "selector": "p" },
                    { "field_name": "author", "type": "PROPERTY", "selector": "em" }
                ]
            }]
        }));
        let answers = out["fields"]["answers"].as_array().unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0]["text"], json!("first answer"));
        assert_eq!(answers[1]["author"], json!("bob"));
    }

    #[test]
    fn test_object_groups_children() {
        let out = run(json!({
            "fields": [{
                "field_name": "page",
                "type": "OBJECT",
                "child": [
                    { "field_name": "title", "type": "PROPERTY", "selector": "h1.title" }
                ]
            }]
        }));
        assert_eq!(out["fields"]["page"]["title"], json!("Rust Questions"));
    }

    #[test]
    fn test_invalid_selector_is_error() {
        let result = run_rules(
            PAGE,
            &json!({
                "fields": [
                    { "field_name": "x", "type": "PROPERTY", "selector": ":::" }
                ]
            }),
        );
        assert!(result.is_err());
    }
}
