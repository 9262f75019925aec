//! Turns the raw text captured under a header into a typed value.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

use crate::signature::{Field, FieldKind, FieldType};

static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+•]|\d+[.)])(?:\s+(.*))?$").expect("list item pattern")
});

/// Literal values the model uses to say "nothing here".
fn is_absent(text: &str) -> bool {
    text.is_empty() || text == "null" || text == "undefined"
}

/// Coerces raw field text. `Ok(None)` means the value is absent.
pub fn coerce_field(field: &Field, raw: &str) -> Result<Option<Value>, String> {
    let text = raw.trim();
    if is_absent(text) {
        return Ok(None);
    }
    match field.kind {
        FieldKind::Scalar => coerce_scalar(&field.field_type, text).map(Some),
        FieldKind::Array => coerce_array(&field.field_type, text).map(Some),
    }
}

fn coerce_array(field_type: &FieldType, text: &str) -> Result<Value, String> {
    let unfenced = strip_code_fence(text);
    if unfenced.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(unfenced) {
            return items
                .into_iter()
                .map(|item| coerce_json_item(field_type, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array);
        }
    }

    let items = parse_markdown_list(text)?;
    items
        .iter()
        .map(|item| coerce_scalar(field_type, item))
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn coerce_json_item(field_type: &FieldType, item: Value) -> Result<Value, String> {
    match (field_type, item) {
        (FieldType::Json, item) => Ok(item),
        (_, Value::String(s)) => coerce_scalar(field_type, s.trim()),
        (FieldType::Number, Value::Number(n)) => Ok(Value::Number(n)),
        (FieldType::Boolean, Value::Bool(b)) => Ok(Value::Bool(b)),
        (_, other) => Err(format!(
            "Expected {} items, got {other}",
            field_type.describe()
        )),
    }
}

/// Parses a markdown bullet or numbered list. Every non-blank line must be a
/// list item.
pub fn parse_markdown_list(text: &str) -> Result<Vec<String>, String> {
    let mut items = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let Some(caps) = LIST_ITEM.captures(line) else {
            return Err(if items.is_empty() {
                "Expected a markdown list (\"- item\" per line)".to_string()
            } else {
                "Invalid markdown list: mixed list and non-list content".to_string()
            });
        };
        items.push(caps.get(1).map_or("", |m| m.as_str()).trim().to_string());
    }
    if items.is_empty() {
        return Err("Expected a markdown list (\"- item\" per line)".to_string());
    }
    Ok(items)
}

/// Removes a surrounding ```` ``` ```` fence, with or without a language tag.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_suffix("```").unwrap_or(inner);
    // Drop the language tag line, if any.
    match inner.find('\n') {
        Some(pos) if !inner[..pos].trim().contains(char::is_whitespace) => inner[pos + 1..].trim(),
        _ => inner.trim(),
    }
}

pub fn coerce_scalar(field_type: &FieldType, text: &str) -> Result<Value, String> {
    match field_type {
        FieldType::String => Ok(Value::String(text.to_string())),
        FieldType::Number => parse_number(text),
        FieldType::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(format!("Expected true or false, got '{text}'")),
        },
        FieldType::Json => serde_json::from_str(strip_code_fence(text))
            .map_err(|e| format!("Invalid JSON: {e}")),
        FieldType::Date => {
            parse_date(text).map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
        }
        FieldType::DateTime => parse_datetime(text)
            .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Secs, true))),
        FieldType::Class(classes) => match_class(classes, text).map(Value::String),
        FieldType::Image | FieldType::Audio => Err(format!(
            "{} values cannot be generated",
            field_type.keyword()
        )),
    }
}

fn parse_number(text: &str) -> Result<Value, String> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Value::Number(n.into()));
    }
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| format!("Expected a number, got '{text}'"))
}

pub fn parse_date(text: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|_| format!("Expected a date in YYYY-MM-DD format, got '{text}'"))
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM[:SS]` read as UTC.
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("Expected a date time in YYYY-MM-DD HH:MM:SS format, got '{text}'"))
}

fn match_class(classes: &[String], text: &str) -> Result<String, String> {
    if let Some(exact) = classes.iter().find(|c| c.as_str() == text) {
        return Ok(exact.clone());
    }
    classes
        .iter()
        .find(|c| c.eq_ignore_ascii_case(text))
        .cloned()
        .ok_or_else(|| format!("Invalid class '{text}', expected one of: {}", classes.join(", ")))
}
