// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Model response parsing: JSON extraction and schema validation.
//!
//! Providers wrap structured output in prose and markdown fences more
//! often than not; extraction tries the fenced block first, then the whole
//! text, then the outermost braced span.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?si)```(?:json)?\s*\n?(.*?)\n?```").expect("constant regex pattern is valid")
});

/// Parse a model response. Without a schema the raw text is the result;
/// with a schema the text must yield JSON that validates.
pub fn parse_response(text: &str, schema: Option<&Value>) -> Result<Value, String> {
    let Some(schema) = schema else {
        return Ok(Value::String(text.to_string()));
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty response content".to_string());
    }
    let parsed =
        extract_json(trimmed).ok_or_else(|| "could not extract JSON from response".to_string())?;
    let errors = validate_schema(&parsed, schema);
    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(format!("schema validation failed: {}", errors.join("; ")))
    }
}

fn extract_json(text: &str) -> Option<Value> {
    if let Some(captures) = FENCED_JSON.captures(text) {
        if let Ok(value) = serde_json::from_str::<Value>(captures[1].trim()) {
            return Some(value);
        }
    }
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    // Outermost braced span: first '{' to successively earlier '}'
    let start = text.find('{')?;
    let mut end = text.len();
    while let Some(close) = text[..end].rfind('}') {
        if close < start {
            break;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..=close]) {
            return Some(value);
        }
        end = close;
    }
    None
}

/// Simplified JSON-schema check: root type, required properties, and
/// property types one level deep.
pub fn validate_schema(value: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(value, expected) {
            errors.push(format!("expected root type {expected}"));
            return errors;
        }
    }
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if value.get(name).is_none() {
                errors.push(format!("missing required property {name:?}"));
            }
        }
    }
    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (name, prop_schema) in properties {
            let (Some(prop), Some(expected)) =
                (value.get(name), prop_schema.get("type").and_then(Value::as_str))
            else {
                continue;
            };
            if !type_matches(prop, expected) {
                errors.push(format!("property {name:?} is not of type {expected}"));
            }
        }
    }
    errors
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

#[cfg(test)]
#[path = "parse_tests.rs"]
mod tests;
