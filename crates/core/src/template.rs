// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Restricted prompt template engine.
//!
//! Templates are literal text with `{{ expr }}` placeholders. Expressions
//! support dotted-path lookups into the render context, string and number
//! literals, binary arithmetic on numbers, and the postfix filters
//! `| tojson` and `| default(<literal>)`. No loops, no calls, no arbitrary
//! code. Undefined variables are render errors unless `default` is applied.

use serde_json::{Number, Value};
use thiserror::Error;

/// Template parse and render failures
#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("syntax error at byte {pos}: {msg}")]
    Syntax { pos: usize, msg: String },
    #[error("undefined variable {0:?}")]
    Undefined(String),
    #[error("type error: {0}")]
    Type(String),
}

fn syntax(pos: usize, msg: impl Into<String>) -> TemplateError {
    TemplateError::Syntax { pos, msg: msg.into() }
}

#[derive(Debug, Clone, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Filter {
    ToJson,
    Default(Value),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Path(Vec<String>),
    Literal(Value),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Pipe { inner: Box<Expr>, filter: Filter },
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Expr(Expr),
}

/// A parsed template, reusable across renders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse a template source string.
    pub fn parse(source: &str) -> Result<Template, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0usize;
        while let Some(open) = rest.find("{{") {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after_open = &rest[open + 2..];
            let close = after_open
                .find("}}")
                .ok_or_else(|| syntax(offset + open, "unterminated {{ placeholder"))?;
            let expr_src = &after_open[..close];
            let expr = ExprParser::parse(expr_src, offset + open + 2)?;
            segments.push(Segment::Expr(expr));
            offset += open + 2 + close + 2;
            rest = &after_open[close + 2..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        Ok(Template { segments })
    }

    /// Render against a context object. Strict: a path that resolves to
    /// nothing is an error unless caught by `default`.
    pub fn render(&self, context: &Value) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value = eval(expr, context)?;
                    out.push_str(&render_value(&value));
                }
            }
        }
        Ok(out)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn eval(expr: &Expr, context: &Value) -> Result<Value, TemplateError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => {
            let mut current = context;
            for part in segments {
                let next = match current {
                    Value::Object(map) => map.get(part),
                    Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                    _ => None,
                };
                current = next.ok_or_else(|| TemplateError::Undefined(segments.join(".")))?;
            }
            Ok(current.clone())
        }
        Expr::Binary { op, lhs, rhs } => {
            let a = number_of(&eval(lhs, context)?)?;
            let b = number_of(&eval(rhs, context)?)?;
            let result = match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => {
                    if b == 0.0 {
                        return Err(TemplateError::Type("division by zero".to_string()));
                    }
                    a / b
                }
            };
            Ok(number_value(result))
        }
        Expr::Pipe { inner, filter } => match filter {
            Filter::ToJson => {
                let value = eval(inner, context)?;
                Ok(Value::String(value.to_string()))
            }
            // default swallows undefined paths and nulls
            Filter::Default(fallback) => match eval(inner, context) {
                Ok(Value::Null) | Err(TemplateError::Undefined(_)) => Ok(fallback.clone()),
                other => other,
            },
        },
    }
}

fn number_of(value: &Value) -> Result<f64, TemplateError> {
    value
        .as_f64()
        .ok_or_else(|| TemplateError::Type(format!("expected a number, got {value}")))
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Recursive-descent parser for one placeholder expression.
struct ExprParser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    /// Byte offset of the expression within the whole template, for errors
    base: usize,
}

impl<'a> ExprParser<'a> {
    fn parse(src: &'a str, base: usize) -> Result<Expr, TemplateError> {
        let mut parser = ExprParser { src, bytes: src.as_bytes(), pos: 0, base };
        let expr = parser.pipeline()?;
        parser.skip_ws();
        if parser.pos < parser.bytes.len() {
            return Err(syntax(base + parser.pos, "unexpected trailing input"));
        }
        Ok(expr)
    }

    fn pipeline(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.sum()?;
        loop {
            self.skip_ws();
            if !self.eat(b'|') {
                return Ok(expr);
            }
            self.skip_ws();
            let name = self.ident()?;
            let filter = match name.as_str() {
                "tojson" => Filter::ToJson,
                "default" => {
                    self.skip_ws();
                    if !self.eat(b'(') {
                        return Err(syntax(self.base + self.pos, "default expects (<literal>)"));
                    }
                    self.skip_ws();
                    let value = self.literal()?;
                    self.skip_ws();
                    if !self.eat(b')') {
                        return Err(syntax(self.base + self.pos, "expected )"));
                    }
                    Filter::Default(value)
                }
                other => {
                    return Err(syntax(self.base + self.pos, format!("unknown filter {other:?}")))
                }
            };
            expr = Expr::Pipe { inner: Box::new(expr), filter };
        }
    }

    fn sum(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.product()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'+') => BinOp::Add,
                Some(b'-') => BinOp::Sub,
                _ => return Ok(expr),
            };
            self.pos += 1;
            let rhs = self.product()?;
            expr = Expr::Binary { op, lhs: Box::new(expr), rhs: Box::new(rhs) };
        }
    }

    fn product(&mut self) -> Result<Expr, TemplateError> {
        let mut expr = self.primary()?;
        loop {
            self.skip_ws();
            let op = match self.peek() {
                Some(b'*') => BinOp::Mul,
                Some(b'/') => BinOp::Div,
                _ => return Ok(expr),
            };
            self.pos += 1;
            let rhs = self.primary()?;
            expr = Expr::Binary { op, lhs: Box::new(expr), rhs: Box::new(rhs) };
        }
    }

    fn primary(&mut self) -> Result<Expr, TemplateError> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let expr = self.sum()?;
                self.skip_ws();
                if !self.eat(b')') {
                    return Err(syntax(self.base + self.pos, "expected )"));
                }
                Ok(expr)
            }
            Some(b'"') | Some(b'\'') => self.literal().map(Expr::Literal),
            Some(c) if c.is_ascii_digit() => self.literal().map(Expr::Literal),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => self.path(),
            _ => Err(syntax(self.base + self.pos, "expected a value")),
        }
    }

    fn path(&mut self) -> Result<Expr, TemplateError> {
        let mut segments = vec![self.ident()?];
        while self.peek() == Some(b'.') {
            self.pos += 1;
            segments.push(self.path_segment()?);
        }
        Ok(Expr::Path(segments))
    }

    /// Path segments after the first may be bare array indices.
    fn path_segment(&mut self) -> Result<String, TemplateError> {
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                Ok(self.src[start..self.pos].to_string())
            }
            _ => self.ident(),
        }
    }

    fn ident(&mut self) -> Result<String, TemplateError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(syntax(self.base + start, "expected an identifier"));
        }
        Ok(self.src[start..self.pos].to_string())
    }

    fn literal(&mut self) -> Result<Value, TemplateError> {
        self.skip_ws();
        match self.peek() {
            Some(quote @ (b'"' | b'\'')) => {
                self.pos += 1;
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == quote {
                        let text = self.src[start..self.pos].to_string();
                        self.pos += 1;
                        return Ok(Value::String(text));
                    }
                    self.pos += 1;
                }
                Err(syntax(self.base + start, "unterminated string literal"))
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit() || c == b'.') {
                    self.pos += 1;
                }
                let text = &self.src[start..self.pos];
                if text.contains('.') {
                    let n = text.parse::<f64>().map_err(|_| {
                        syntax(self.base + start, format!("bad number literal {text:?}"))
                    })?;
                    Ok(number_value(n))
                } else {
                    let n = text.parse::<i64>().map_err(|_| {
                        syntax(self.base + start, format!("bad number literal {text:?}"))
                    })?;
                    Ok(Value::Number(Number::from(n)))
                }
            }
            _ => Err(syntax(self.base + self.pos, "expected a literal")),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }
}

#[cfg(test)]
#[path = "template_tests.rs"]
mod tests;
