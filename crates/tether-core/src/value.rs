//! Values marshalled across the boundary.
//!
//! A `Value` is either plain data (the JSON data model) or a live handle
//! (`Function`, `Object`, `Promise`) that the serialization engine replaces
//! with a reference token before anything reaches the wire.

use crate::deferred::Deferred;
use crate::error::{Result, TetherError};
use crate::object::{Function, Object};
use std::collections::BTreeMap;

/// A dynamically typed value, plain or live.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Function(Function),
    Object(Object),
    Promise(Deferred),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Promise(_) => "promise",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Deferred> {
        match self {
            Value::Promise(d) => Some(d),
            _ => None,
        }
    }

    /// A number value, rejecting NaN and infinities.
    pub fn finite(n: f64) -> Result<Value> {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or(TetherError::TypeMismatch {
                expected: "finite number",
                actual: "non-finite number",
            })
    }

    /// Like `as_i64`, but a type mismatch is an error.
    pub fn expect_i64(&self) -> Result<i64> {
        self.as_i64().ok_or(TetherError::TypeMismatch {
            expected: "integer",
            actual: self.kind(),
        })
    }

    pub fn expect_f64(&self) -> Result<f64> {
        self.as_f64().ok_or(TetherError::TypeMismatch {
            expected: "number",
            actual: self.kind(),
        })
    }

    pub fn expect_str(&self) -> Result<&str> {
        self.as_str().ok_or(TetherError::TypeMismatch {
            expected: "string",
            actual: self.kind(),
        })
    }

    pub fn expect_function(&self) -> Result<&Function> {
        self.as_function().ok_or(TetherError::TypeMismatch {
            expected: "function",
            actual: self.kind(),
        })
    }

    pub fn expect_object(&self) -> Result<&Object> {
        self.as_object().ok_or(TetherError::TypeMismatch {
            expected: "object",
            actual: self.kind(),
        })
    }

    /// Await the value if it is a promise, otherwise return it as is.
    ///
    /// Lets callers treat sync and async proxy results uniformly.
    pub async fn settle(self) -> Result<Value> {
        match self {
            Value::Promise(d) => d.await,
            other => Ok(other),
        }
    }

    /// Convert plain data to JSON. Live handles are an error.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_>>()?,
            ),
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Function(_) | Value::Object(_) | Value::Promise(_) => {
                return Err(TetherError::TypeMismatch {
                    expected: "plain data",
                    actual: self.kind(),
                })
            }
        })
    }
}

/// Plain data compares structurally; live handles compare by identity.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            },
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Number(n.into())
    }
}

/// JSON has no NaN or infinities, so those become [`Value::Null`]. Use
/// [`Value::finite`] where that loss should be an error.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Deferred> for Value {
    fn from(d: Deferred) -> Self {
        Value::Promise(d)
    }
}
