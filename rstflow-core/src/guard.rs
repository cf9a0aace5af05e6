//! Transition guards.
//!
//! A guard is a pure, synchronous predicate over the instance context and the
//! triggering event. Guards come in two flavours:
//!
//! - [`Guard::predicate`] wraps a Rust closure returning `bool`.
//! - [`Guard::expr`] parses a small expression language, used by definitions
//!   loaded from JSON/YAML documents.
//!
//! The expression language supports:
//!
//! - `ctx.field` / `event.field` - strict boolean test (see below)
//! - `ctx.field.nested` - nested field access
//! - `ctx.field == value` / `!=` - equality (strings, numbers, booleans, null)
//! - `ctx.field > value` / `>=` / `<` / `<=` - numeric comparison
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! A bare field reference must resolve to a JSON boolean. A missing or `null`
//! field reads as `false`; any other value is a guard contract violation and
//! aborts the dispatch.

use crate::error::CoreError;
use crate::event::{lookup_path, Context, Event};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Inputs visible to a guard.
#[derive(Debug, Clone, Copy)]
pub struct GuardScope<'a> {
    pub context: &'a Context,
    pub event: &'a Event,
}

/// A guard produced a value that is not a boolean.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardViolation {
    pub field: String,
    pub value: Value,
}

type Predicate = dyn Fn(&GuardScope<'_>) -> bool + Send + Sync;

/// A transition guard.
#[derive(Clone)]
pub enum Guard {
    /// Parsed guard expression.
    Expr(GuardExpr),
    /// Closure predicate.
    Predicate(Arc<Predicate>),
}

impl Guard {
    /// Parses a guard expression.
    pub fn expr(source: &str) -> Result<Self, CoreError> {
        GuardExpr::parse(source).map(Guard::Expr)
    }

    /// Wraps a closure predicate.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&GuardScope<'_>) -> bool + Send + Sync + 'static,
    {
        Guard::Predicate(Arc::new(f))
    }

    /// Evaluates the guard.
    pub fn check(&self, scope: &GuardScope<'_>) -> Result<bool, GuardViolation> {
        match self {
            Guard::Expr(expr) => expr.evaluate(scope),
            Guard::Predicate(f) => Ok(f(scope)),
        }
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::Expr(expr) => f.debug_tuple("Expr").field(expr).finish(),
            Guard::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Where a field reference is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRoot {
    Ctx,
    Event,
}

/// A field reference such as `ctx.order.total`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub root: FieldRoot,
    pub path: String,
}

impl FieldRef {
    fn resolve(&self, scope: &GuardScope<'_>) -> Value {
        match self.root {
            FieldRoot::Ctx => lookup_path(scope.context, &self.path),
            FieldRoot::Event => scope.event.field(&self.path),
        }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            FieldRoot::Ctx => write!(f, "ctx.{}", self.path),
            FieldRoot::Event => write!(f, "event.{}", self.path),
        }
    }
}

/// A parsed guard expression.
#[derive(Debug, Clone)]
pub enum GuardExpr {
    /// Field must be a boolean.
    Flag(FieldRef),
    Eq(FieldRef, Value),
    Ne(FieldRef, Value),
    Gt(FieldRef, f64),
    Ge(FieldRef, f64),
    Lt(FieldRef, f64),
    Le(FieldRef, f64),
    And(Box<GuardExpr>, Box<GuardExpr>),
    Or(Box<GuardExpr>, Box<GuardExpr>),
    Not(Box<GuardExpr>),
}

impl GuardExpr {
    /// Parses a guard expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CoreError::InvalidGuard {
                reason: "empty guard expression".to_string(),
            });
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < parser.input.len() {
            return Err(CoreError::InvalidGuard {
                reason: format!("unexpected input at '{}'", &parser.input[parser.pos..]),
            });
        }
        Ok(expr)
    }

    /// Evaluates the expression.
    pub fn evaluate(&self, scope: &GuardScope<'_>) -> Result<bool, GuardViolation> {
        let result = match self {
            GuardExpr::Flag(field) => match field.resolve(scope) {
                Value::Bool(b) => b,
                Value::Null => false,
                other => {
                    return Err(GuardViolation {
                        field: field.to_string(),
                        value: other,
                    })
                }
            },
            GuardExpr::Eq(field, expected) => values_equal(&field.resolve(scope), expected),
            GuardExpr::Ne(field, expected) => !values_equal(&field.resolve(scope), expected),
            GuardExpr::Gt(field, n) => compare(&field.resolve(scope), |v| v > *n),
            GuardExpr::Ge(field, n) => compare(&field.resolve(scope), |v| v >= *n),
            GuardExpr::Lt(field, n) => compare(&field.resolve(scope), |v| v < *n),
            GuardExpr::Le(field, n) => compare(&field.resolve(scope), |v| v <= *n),
            GuardExpr::And(left, right) => left.evaluate(scope)? && right.evaluate(scope)?,
            GuardExpr::Or(left, right) => left.evaluate(scope)? || right.evaluate(scope)?,
            GuardExpr::Not(inner) => !inner.evaluate(scope)?,
        };
        Ok(result)
    }
}

fn compare(value: &Value, op: impl Fn(f64) -> bool) -> bool {
    match value {
        Value::Number(n) => n.as_f64().map(op).unwrap_or(false),
        _ => false,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Number(a), Value::Number(b)) => a
            .as_f64()
            .zip(b.as_f64())
            .map(|(a, b)| (a - b).abs() < f64::EPSILON)
            .unwrap_or(false),
        (Value::String(a), Value::String(b)) => a == b,
        _ => false,
    }
}

/// Recursive descent parser for guard expressions.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<GuardExpr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = GuardExpr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<GuardExpr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = GuardExpr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(GuardExpr::Not(Box::new(inner)));
        }

        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<GuardExpr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('(') {
            self.pos += 1;
            let expr = self.parse_expr()?;
            self.skip_whitespace();
            if self.peek_char() != Some(')') {
                return Err(invalid("expected ')'"));
            }
            self.pos += 1;
            return Ok(expr);
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<GuardExpr, CoreError> {
        let field = self.parse_field()?;
        self.skip_whitespace();

        if self.peek_str("==") {
            self.pos += 2;
            return Ok(GuardExpr::Eq(field, self.parse_value()?));
        }
        if self.peek_str("!=") {
            self.pos += 2;
            return Ok(GuardExpr::Ne(field, self.parse_value()?));
        }
        if self.peek_str(">=") {
            self.pos += 2;
            return Ok(GuardExpr::Ge(field, self.parse_number()?));
        }
        if self.peek_str("<=") {
            self.pos += 2;
            return Ok(GuardExpr::Le(field, self.parse_number()?));
        }
        if self.peek_char() == Some('>') {
            self.pos += 1;
            return Ok(GuardExpr::Gt(field, self.parse_number()?));
        }
        if self.peek_char() == Some('<') {
            self.pos += 1;
            return Ok(GuardExpr::Lt(field, self.parse_number()?));
        }

        Ok(GuardExpr::Flag(field))
    }

    fn parse_field(&mut self) -> Result<FieldRef, CoreError> {
        self.skip_whitespace();

        let root = if self.peek_str("ctx.") {
            self.pos += 4;
            FieldRoot::Ctx
        } else if self.peek_str("event.") {
            self.pos += 6;
            FieldRoot::Event
        } else {
            return Err(invalid("field must start with 'ctx.' or 'event.'"));
        };

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }

        let path = &self.input[start..self.pos];
        if path.is_empty() || path.starts_with('.') || path.ends_with('.') {
            return Err(invalid("empty field name"));
        }

        Ok(FieldRef {
            root,
            path: path.to_string(),
        })
    }

    fn parse_value(&mut self) -> Result<Value, CoreError> {
        self.skip_whitespace();
        let rest = &self.input[self.pos..];

        if rest.starts_with("true") {
            self.pos += 4;
            return Ok(Value::Bool(true));
        }
        if rest.starts_with("false") {
            self.pos += 5;
            return Ok(Value::Bool(false));
        }
        if rest.starts_with("null") {
            self.pos += 4;
            return Ok(Value::Null);
        }
        if rest.starts_with('"') {
            return self.parse_string_value();
        }

        let num = self.parse_number()?;
        serde_json::Number::from_f64(num)
            .map(Value::Number)
            .ok_or_else(|| invalid(&format!("invalid number: {}", num)))
    }

    fn parse_string_value(&mut self) -> Result<Value, CoreError> {
        // opening quote
        self.pos += 1;

        let start = self.pos;
        while let Some(c) = self.peek_char() {
            match c {
                '"' => {
                    let s = &self.input[start..self.pos];
                    self.pos += 1;
                    return Ok(Value::String(s.to_string()));
                }
                '\\' => {
                    self.pos += 1;
                    if let Some(escaped) = self.peek_char() {
                        self.pos += escaped.len_utf8();
                    }
                }
                _ => self.pos += c.len_utf8(),
            }
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        self.skip_whitespace();
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }
        self.skip_digits();
        if self.peek_char() == Some('.') {
            self.pos += 1;
            self.skip_digits();
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| invalid(&format!("invalid number: '{}'", num_str)))
    }

    fn skip_digits(&mut self) {
        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}

fn invalid(reason: &str) -> CoreError {
    CoreError::InvalidGuard {
        reason: reason.to_string(),
    }
}
