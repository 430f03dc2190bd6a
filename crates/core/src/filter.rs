// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Store-filter documents parsed to a tagged-variant AST.
//!
//! Supports the operator subset `$eq $ne $in $nin $gt $gte $lt $lte $and
//! $or $not $exists $regex` plus bare `{field: value}` equality and dotted
//! field paths with numeric array indices. Unknown operators are a parse
//! error, never silently true.

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Filter parse failures, surfaced as configuration errors at agent
/// validation time.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("filter must be an object")]
    NotAnObject,
    #[error("unknown operator {0:?}")]
    UnknownOperator(String),
    #[error("operator {0:?} expects {1}")]
    Malformed(String, &'static str),
    #[error("invalid regex {0:?}: {1}")]
    BadRegex(String, String),
}

/// A compiled `$regex` predicate. Equality is on the source pattern so the
/// AST stays comparable.
#[derive(Debug, Clone)]
pub struct RegexPred {
    pattern: String,
    case_insensitive: bool,
    re: Regex,
}

impl PartialEq for RegexPred {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.case_insensitive == other.case_insensitive
    }
}

impl RegexPred {
    fn compile(pattern: &str, case_insensitive: bool) -> Result<Self, FilterError> {
        let source = if case_insensitive { format!("(?i){pattern}") } else { pattern.to_string() };
        let re = Regex::new(&source)
            .map_err(|e| FilterError::BadRegex(pattern.to_string(), e.to_string()))?;
        Ok(Self { pattern: pattern.to_string(), case_insensitive, re })
    }

    fn matches(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => self.re.is_match(s),
            _ => false,
        }
    }
}

/// Predicate applied to a single field's value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldPred {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    Regex(RegexPred),
}

/// Parsed filter expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Not(Box<FilterExpr>),
    Field { path: String, pred: FieldPred },
}

impl FilterExpr {
    /// Parse a store-filter document.
    pub fn parse(doc: &Value) -> Result<FilterExpr, FilterError> {
        let map = doc.as_object().ok_or(FilterError::NotAnObject)?;
        let mut clauses = Vec::with_capacity(map.len());
        for (key, value) in map {
            if let Some(op) = key.strip_prefix('$') {
                clauses.push(Self::parse_logical(op, value)?);
            } else {
                clauses.extend(Self::parse_field(key, value)?);
            }
        }
        Ok(Self::all(clauses))
    }

    fn all(mut clauses: Vec<FilterExpr>) -> FilterExpr {
        if clauses.len() == 1 {
            clauses.remove(0)
        } else {
            FilterExpr::And(clauses)
        }
    }

    fn parse_logical(op: &str, value: &Value) -> Result<FilterExpr, FilterError> {
        match op {
            "and" | "or" => {
                let items = value
                    .as_array()
                    .ok_or(FilterError::Malformed(format!("${op}"), "an array of filters"))?;
                let parsed: Vec<FilterExpr> =
                    items.iter().map(Self::parse).collect::<Result<_, _>>()?;
                if op == "and" {
                    Ok(FilterExpr::And(parsed))
                } else {
                    Ok(FilterExpr::Or(parsed))
                }
            }
            "not" => Ok(FilterExpr::Not(Box::new(Self::parse(value)?))),
            other => Err(FilterError::UnknownOperator(format!("${other}"))),
        }
    }

    fn parse_field(path: &str, value: &Value) -> Result<Vec<FilterExpr>, FilterError> {
        let preds = match value.as_object() {
            Some(map) if map.keys().any(|k| k.starts_with('$')) => {
                let mut preds = Vec::with_capacity(map.len());
                let options = map.get("$options").and_then(Value::as_str).unwrap_or("");
                for (op, operand) in map {
                    if op == "$options" {
                        continue;
                    }
                    preds.push(Self::parse_pred(op, operand, options)?);
                }
                preds
            }
            _ => vec![FieldPred::Eq(value.clone())],
        };
        Ok(preds
            .into_iter()
            .map(|pred| FilterExpr::Field { path: path.to_string(), pred })
            .collect())
    }

    fn parse_pred(op: &str, operand: &Value, options: &str) -> Result<FieldPred, FilterError> {
        let array = |op: &str| -> Result<Vec<Value>, FilterError> {
            operand
                .as_array()
                .cloned()
                .ok_or(FilterError::Malformed(op.to_string(), "an array"))
        };
        match op {
            "$eq" => Ok(FieldPred::Eq(operand.clone())),
            "$ne" => Ok(FieldPred::Ne(operand.clone())),
            "$in" => Ok(FieldPred::In(array(op)?)),
            "$nin" => Ok(FieldPred::Nin(array(op)?)),
            "$gt" => Ok(FieldPred::Gt(operand.clone())),
            "$gte" => Ok(FieldPred::Gte(operand.clone())),
            "$lt" => Ok(FieldPred::Lt(operand.clone())),
            "$lte" => Ok(FieldPred::Lte(operand.clone())),
            "$exists" => operand
                .as_bool()
                .map(FieldPred::Exists)
                .ok_or(FilterError::Malformed("$exists".to_string(), "a boolean")),
            "$regex" => {
                let pattern = operand
                    .as_str()
                    .ok_or(FilterError::Malformed("$regex".to_string(), "a string pattern"))?;
                Ok(FieldPred::Regex(RegexPred::compile(pattern, options.contains('i'))?))
            }
            other => Err(FilterError::UnknownOperator(other.to_string())),
        }
    }

    /// Evaluate the filter against a document.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            FilterExpr::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
            FilterExpr::Or(clauses) => clauses.iter().any(|c| c.matches(doc)),
            FilterExpr::Not(inner) => !inner.matches(doc),
            FilterExpr::Field { path, pred } => pred_matches(pred, lookup_path(doc, path)),
        }
    }

    /// True when every field path referenced is exactly `_id`.
    ///
    /// Deletes carry no post-image; only filters that constrain nothing but
    /// the id can still be evaluated against `{_id: ...}`.
    pub fn references_only_id(&self) -> bool {
        match self {
            FilterExpr::And(clauses) | FilterExpr::Or(clauses) => {
                clauses.iter().all(|c| c.references_only_id())
            }
            FilterExpr::Not(inner) => inner.references_only_id(),
            FilterExpr::Field { path, .. } => path == "_id",
        }
    }
}

/// Dotted-path lookup with numeric array indexing.
fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn pred_matches(pred: &FieldPred, actual: Option<&Value>) -> bool {
    match pred {
        FieldPred::Exists(expected) => actual.is_some() == *expected,
        FieldPred::Eq(expected) => actual.is_some_and(|a| values_equal(a, expected)),
        FieldPred::Ne(expected) => !actual.is_some_and(|a| values_equal(a, expected)),
        FieldPred::In(set) => actual.is_some_and(|a| set.iter().any(|v| values_equal(a, v))),
        FieldPred::Nin(set) => !actual.is_some_and(|a| set.iter().any(|v| values_equal(a, v))),
        FieldPred::Gt(bound) => ordered(actual, bound).is_some_and(|o| o == Ordering::Greater),
        FieldPred::Gte(bound) => ordered(actual, bound).is_some_and(|o| o != Ordering::Less),
        FieldPred::Lt(bound) => ordered(actual, bound).is_some_and(|o| o == Ordering::Less),
        FieldPred::Lte(bound) => ordered(actual, bound).is_some_and(|o| o != Ordering::Greater),
        FieldPred::Regex(re) => actual.is_some_and(|a| re.matches(a)),
    }
}

/// Equality with cross-width numeric coercion (`1 == 1.0`).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering comparison over numbers and strings; other type pairs do not
/// order and never satisfy range predicates.
fn ordered(actual: Option<&Value>, bound: &Value) -> Option<Ordering> {
    let actual = actual?;
    if let (Some(x), Some(y)) = (actual.as_f64(), bound.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (actual, bound) {
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
