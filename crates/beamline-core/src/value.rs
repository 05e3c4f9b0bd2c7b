//! Dynamic property values and their literal text form.
//!
//! Events, the key/value database and the control-system bus all carry
//! values whose Rust type is only known to the property that produced them.
//! [`Value`] is that common currency. Typed cells convert through the
//! [`PropertyValue`] trait.
//!
//! # Literal Format
//!
//! Values are stored in the settings database as literals:
//!
//! | Value | Literal |
//! |-------|---------|
//! | `Null` | `None` |
//! | `Bool(true)` | `True` |
//! | `Int(42)` | `42` |
//! | `Float(1.5)` / `Float(NaN)` | `1.5` / `nan` |
//! | `Str("a")` | `'a'` |
//! | `List([1, 2])` | `[1, 2]` |
//!
//! The parser also accepts double-quoted strings, lower-case `true`/`false`,
//! tuples `(1, 2)` and `inf`/`-inf`.
//!
//! # Equality
//!
//! `PartialEq` on `Value` is the change-detection equality: NaN equals NaN,
//! integers and floats compare numerically, and lists compare element-wise
//! (lists of different length are unequal).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{BeamlineError, Result};

/// A dynamically typed property value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value (`None`)
    #[default]
    Null,
    /// Boolean flag
    Bool(bool),
    /// Integer count or index
    Int(i64),
    /// Floating-point measurement; NaN means "unknown"
    Float(f64),
    /// Text
    Str(String),
    /// Sequence of values (arrays, tuples, filename sets)
    List(Vec<Value>),
}

impl Value {
    /// The "unknown" sentinel used for stale or failed reads.
    pub fn nan() -> Self {
        Value::Float(f64::NAN)
    }

    /// True if this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True if this is a NaN float.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Float(v) if v.is_nan())
    }

    /// Numeric view of the value (booleans count as 0/1).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Integer view of the value. Floats convert only when integral.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Boolean view of the value. NaN and non-numeric values have none.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Float(f) if !f.is_nan() => Some(*f != 0.0),
            _ => None,
        }
    }

    /// String view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// List view of the value.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Short name of the variant, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
        }
    }

    /// Canonical literal form, as written to the settings database.
    pub fn to_literal(&self) -> String {
        let mut out = String::new();
        write_literal(self, &mut out);
        out
    }

    /// Parse a literal produced by [`Value::to_literal`] (or written by hand).
    pub fn parse_literal(text: &str) -> Result<Value> {
        let mut parser = LiteralParser::new(text);
        let value = parser.parse_value()?;
        parser.skip_whitespace();
        if parser.pos < text.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => float_eq(*a, *b),
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                float_eq(*a as f64, *b)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
            }
            _ => false,
        }
    }
}

fn float_eq(a: f64, b: f64) -> bool {
    (a.is_nan() && b.is_nan()) || a == b
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_literal())
    }
}

fn write_literal(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Int(i) => out.push_str(&i.to_string()),
        Value::Float(v) => out.push_str(&float_literal(*v)),
        Value::Str(s) => {
            out.push('\'');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("\\'"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    c => out.push(c),
                }
            }
            out.push('\'');
        }
        Value::List(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_literal(item, out);
            }
            out.push(']');
        }
    }
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "nan".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "inf" } else { "-inf" }.to_string()
    } else if v != 0.0 && (v.abs() >= 1e16 || v.abs() < 1e-4) {
        format!("{v:e}")
    } else if v.fract() == 0.0 {
        format!("{v:.1}")
    } else {
        format!("{v}")
    }
}

// =============================================================================
// Literal Parser
// =============================================================================

struct LiteralParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn error(&self, message: &str) -> BeamlineError {
        BeamlineError::Parse {
            input: self.input.to_string(),
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_whitespace();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('[') => self.parse_list(']'),
            Some('(') => self.parse_list(')'),
            Some(q @ ('\'' | '"')) => self.parse_string(q),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() => self.parse_word(),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn take_token(&mut self) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.' | '_'))
        {
            self.bump();
        }
        &self.input[start..self.pos]
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        let token = self.take_token();
        let lowered = token.to_ascii_lowercase();
        match lowered.as_str() {
            "inf" | "+inf" => return Ok(Value::Float(f64::INFINITY)),
            "-inf" => return Ok(Value::Float(f64::NEG_INFINITY)),
            "nan" | "+nan" | "-nan" => return Ok(Value::nan()),
            _ => {}
        }
        let cleaned: String = token.chars().filter(|c| *c != '_').collect();
        let (negative, digits) = match cleaned.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, cleaned.strip_prefix('+').unwrap_or(&cleaned)),
        };
        if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            return i64::from_str_radix(hex, 16)
                .map(|v| Value::Int(if negative { -v } else { v }))
                .map_err(|_| {
                    self.pos = start;
                    self.error("malformed hexadecimal integer")
                });
        }
        let is_float = cleaned.contains(|c| matches!(c, '.' | 'e' | 'E'));
        if is_float {
            cleaned.parse::<f64>().map(Value::Float).map_err(|_| {
                self.pos = start;
                self.error("malformed float")
            })
        } else {
            cleaned.parse::<i64>().map(Value::Int).map_err(|_| {
                self.pos = start;
                self.error("malformed integer")
            })
        }
    }

    fn parse_word(&mut self) -> Result<Value> {
        let start = self.pos;
        let word = self.take_token();
        match word {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "null" => Ok(Value::Null),
            "nan" | "NaN" => Ok(Value::nan()),
            "inf" => Ok(Value::Float(f64::INFINITY)),
            _ => {
                self.pos = start;
                Err(self.error("unknown identifier"))
            }
        }
    }

    fn parse_string(&mut self, quote: char) -> Result<Value> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(Value::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('r') => out.push('\r'),
                    Some('t') => out.push('\t'),
                    Some('0') => out.push('\0'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_list(&mut self, close: char) -> Result<Value> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() == Some(close) {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.parse_value()?);
            self.skip_whitespace();
            match self.bump() {
                Some(',') => continue,
                Some(c) if c == close => return Ok(Value::List(items)),
                _ => return Err(self.error("expected ',' or end of sequence")),
            }
        }
    }
}

// =============================================================================
// Typed Conversions
// =============================================================================

/// Conversion between a typed property value and [`Value`].
///
/// `from_value` applies the same coercions a literal reader expects: an
/// integral float reads as an integer, an integer reads as a float, and a
/// number reads as a boolean.
pub trait PropertyValue: Clone + Send + Sync + 'static {
    /// Convert to the dynamic representation.
    fn to_value(&self) -> Value;

    /// Convert from the dynamic representation, if the types are compatible.
    fn from_value(value: &Value) -> Option<Self>;

    /// Name of the type for error messages.
    fn type_label() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl PropertyValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl PropertyValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl PropertyValue for i64 {
    fn to_value(&self) -> Value {
        Value::Int(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl PropertyValue for i32 {
    fn to_value(&self) -> Value {
        Value::Int(i64::from(*self))
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| i32::try_from(v).ok())
    }
}

impl PropertyValue for u64 {
    fn to_value(&self) -> Value {
        Value::Int(i64::try_from(*self).unwrap_or(i64::MAX))
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| u64::try_from(v).ok())
    }
}

impl PropertyValue for usize {
    fn to_value(&self) -> Value {
        Value::Int(i64::try_from(*self).unwrap_or(i64::MAX))
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|v| usize::try_from(v).ok())
    }
}

impl PropertyValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl PropertyValue for String {
    fn to_value(&self) -> Value {
        Value::Str(self.clone())
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }
}

impl<T: PropertyValue> PropertyValue for Vec<T> {
    fn to_value(&self) -> Value {
        Value::List(self.iter().map(PropertyValue::to_value).collect())
    }

    fn from_value(value: &Value) -> Option<Self> {
        value.as_list()?.iter().map(T::from_value).collect()
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_nan_aware_equality() {
        assert_eq!(Value::nan(), Value::nan());
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Float(1.0), Value::nan());
        assert_ne!(Value::from(vec![1, 2]), Value::from(vec![1, 2, 3]));
        assert_eq!(
            Value::List(vec![Value::nan(), Value::Int(1)]),
            Value::List(vec![Value::nan(), Value::Float(1.0)])
        );
        assert_ne!(Value::Bool(true), Value::Str("True".into()));
    }

    #[test]
    fn test_literal_forms() {
        assert_eq!(Value::Bool(true).to_literal(), "True");
        assert_eq!(Value::Int(-7).to_literal(), "-7");
        assert_eq!(Value::Float(2.0).to_literal(), "2.0");
        assert_eq!(Value::Float(0.25).to_literal(), "0.25");
        assert_eq!(Value::nan().to_literal(), "nan");
        assert_eq!(Value::Null.to_literal(), "None");
        assert_eq!(Value::from("it's").to_literal(), "'it\\'s'");
        assert_eq!(Value::from(vec![1.5, 2.5]).to_literal(), "[1.5, 2.5]");
    }

    #[test]
    fn test_parse_scalars() {
        assert_eq!(Value::parse_literal("True").unwrap(), Value::Bool(true));
        assert_eq!(Value::parse_literal(" 42 ").unwrap(), Value::Int(42));
        assert_eq!(Value::parse_literal("-1.5e3").unwrap(), Value::Float(-1500.0));
        assert_eq!(Value::parse_literal("0x1F").unwrap(), Value::Int(31));
        assert!(Value::parse_literal("nan").unwrap().is_nan());
        assert_eq!(
            Value::parse_literal("-inf").unwrap(),
            Value::Float(f64::NEG_INFINITY)
        );
        assert_eq!(
            Value::parse_literal("\"a\\nb\"").unwrap(),
            Value::Str("a\nb".into())
        );
    }

    #[test]
    fn test_parse_sequences() {
        let v = Value::parse_literal("[1, 'two', (3.0, None), []]").unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[1], Value::from("two"));
        assert_eq!(items[2], Value::List(vec![Value::Float(3.0), Value::Null]));
        assert_eq!(Value::parse_literal("[1, 2,]").unwrap(), Value::from(vec![1, 2]));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Value::parse_literal("").is_err());
        assert!(Value::parse_literal("[1, 2").is_err());
        assert!(Value::parse_literal("'open").is_err());
        assert!(Value::parse_literal("banana").is_err());
        assert!(Value::parse_literal("1 2").is_err());
        match Value::parse_literal("12abc") {
            Err(BeamlineError::Parse { position, .. }) => assert_eq!(position, 0),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_literal_reparses_to_same_value() {
        for value in [
            Value::Float(1e-7),
            Value::Float(3.0e20),
            Value::Float(-0.1),
            Value::from("tab\tquote'"),
            Value::List(vec![Value::Bool(false), Value::nan()]),
        ] {
            assert_eq!(Value::parse_literal(&value.to_literal()).unwrap(), value);
        }
    }

    #[test]
    fn test_typed_coercion() {
        assert_eq!(f64::from_value(&Value::Int(3)), Some(3.0));
        assert_eq!(i64::from_value(&Value::Float(4.0)), Some(4));
        assert_eq!(i64::from_value(&Value::Float(4.5)), None);
        assert_eq!(bool::from_value(&Value::Int(1)), Some(true));
        assert_eq!(String::from_value(&Value::Int(1)), None);
        assert_eq!(
            Vec::<i64>::from_value(&Value::from(vec![1, 2])),
            Some(vec![1, 2])
        );
        assert_eq!(usize::from_value(&Value::Int(-1)), None);
    }
}
