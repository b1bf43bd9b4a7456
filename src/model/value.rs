//! Universal value type flowing through sockets.
//!
//! `Unresolved` marks "no value was produced" and is distinct from `Null`,
//! which is a legitimate value. Neither equals `Bool(false)`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::Value as Json;

use crate::focal::{Call, Callback};
use crate::function::FunctionWrapper;
use crate::llm::Agent;

/// Value carried by sockets, properties and function arguments.
///
/// Covers:
/// - Sentinel: Unresolved
/// - Scalars: Null, Bool, Int, Float, String
/// - Containers: List, Map
/// - Runtime handles: Function, Callback, Call, Agent, Error
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Unresolved,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),

    // Runtime handles
    Function(Arc<FunctionWrapper>),
    Callback(Arc<Callback>),
    Call(Arc<Call>),
    Agent(Arc<dyn Agent>),
    Error(ErrorInfo),
}

/// A caught error as seen by graph nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
}

impl From<&crate::Error> for ErrorInfo {
    fn from(err: &crate::Error) -> Self {
        Self { name: err.kind().to_string(), message: err.to_string() }
    }
}

// ============================================================================
// Type checking
// ============================================================================

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Unresolved => "unresolved",
            Value::Null => "none",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "str",
            Value::List(_) => "list",
            Value::Map(_) => "dict",
            Value::Function(_) => "function",
            Value::Callback(_) => "focal/callback",
            Value::Call(_) => "focal/call",
            Value::Agent(_) => "agent",
            Value::Error(_) => "error",
        }
    }

    pub fn is_unresolved(&self) -> bool { matches!(self, Value::Unresolved) }
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }
    pub fn is_numeric(&self) -> bool { matches!(self, Value::Int(_) | Value::Float(_)) }

    /// Truthiness used by switches and loop breaks.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Unresolved | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
            _ => true,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Resolved values pass through, `Unresolved` yields `fallback`.
    pub fn or(self, fallback: Value) -> Value {
        if self.is_unresolved() { fallback } else { self }
    }
}

// ============================================================================
// JSON projection
// ============================================================================

impl Value {
    /// Project into plain JSON. Runtime handles fall back to their string form.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Unresolved | Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::List(l) => Json::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => Json::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Value::Call(call) => serde_json::to_value(call.as_ref()).unwrap_or_else(|_| Json::String(self.to_string())),
            Value::Error(info) => serde_json::json!({"name": info.name, "message": info.message}),
            Value::Function(_) | Value::Callback(_) | Value::Agent(_) => Json::String(self.to_string()),
        }
    }

    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => Value::Map(map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))).collect()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

// ============================================================================
// Conversions (From impls)
// ============================================================================

impl From<bool> for Value { fn from(v: bool) -> Self { Value::Bool(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Value::Int(v as i64) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::Int(v) } }
impl From<usize> for Value { fn from(v: usize) -> Self { Value::Int(v as i64) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::Float(v) } }
impl From<String> for Value { fn from(v: String) -> Self { Value::String(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Value::String(v.to_owned()) } }
impl From<Json> for Value { fn from(v: Json) -> Self { Value::from_json(&v) } }
impl From<ErrorInfo> for Value { fn from(v: ErrorInfo) -> Self { Value::Error(v) } }
impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self { Value::Map(v) }
}
impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self { Value::List(v.into_iter().map(Into::into).collect()) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self { v.map(Into::into).unwrap_or(Value::Null) }
}

// ============================================================================
// Equality
// ============================================================================

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unresolved, Value::Unresolved) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Callback(a), Value::Callback(b)) => Arc::ptr_eq(a, b),
            (Value::Call(a), Value::Call(b)) => a == b,
            (Value::Agent(a), Value::Agent(b)) => Arc::ptr_eq(a, b),
            (Value::Error(a), Value::Error(b)) => a == b,
            _ => false,
        }
    }
}

// ============================================================================
// Display / Debug
// ============================================================================

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unresolved => write!(f, "<UNRESOLVED>"),
            Value::Null => write!(f, "None"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "\"{}\"", s.replace('"', "\\\"")),
            Value::List(l) => {
                write!(f, "[")?;
                for (i, v) in l.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "<function {}>", func.name()),
            Value::Callback(cb) => write!(f, "<callback {}>", cb.name),
            Value::Call(call) => write!(f, "<call {} called={}>", call.name, call.called),
            Value::Agent(agent) => write!(f, "<agent {}>", agent.agent_type()),
            Value::Error(info) => write!(f, "{}: {}", info.name, info.message),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unresolved => write!(f, "Unresolved"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Int(i) => write!(f, "Int({i})"),
            Value::Float(v) => write!(f, "Float({v})"),
            Value::String(s) => write!(f, "String({s:?})"),
            Value::List(l) => f.debug_tuple("List").field(l).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Call(call) => f.debug_tuple("Call").field(call).finish(),
            Value::Error(info) => f.debug_tuple("Error").field(info).finish(),
            other => write!(f, "{other}"),
        }
    }
}

/// Truncated display used for flattened node states.
pub fn repr(value: &Value, max: usize) -> String {
    let full = value.to_string();
    if full.chars().count() <= max {
        return full;
    }
    let head: String = full.chars().take(max.saturating_sub(3)).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from("hello"), Value::String("hello".into()));
        assert_eq!(Value::from(42), Value::Int(42));
        assert_eq!(Value::from(3.5), Value::Float(3.5));
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_unresolved_is_distinct() {
        assert_ne!(Value::Unresolved, Value::Null);
        assert_ne!(Value::Unresolved, Value::Bool(false));
        assert_ne!(Value::Null, Value::Bool(false));
        assert!(!Value::Unresolved.is_truthy());
        assert!(Value::Unresolved.is_unresolved());
        assert!(!Value::Null.is_unresolved());
    }

    #[test]
    fn test_truthiness() {
        assert!(Value::from("x").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn test_json_projection() {
        let json = serde_json::json!({"a": [1, 2.5, "x", null, true]});
        let value = Value::from_json(&json);
        assert_eq!(value.to_json(), json);
        assert_eq!(Value::Unresolved.to_json(), Json::Null);
    }

    #[test]
    fn test_repr_truncates() {
        let value = Value::from("a".repeat(300));
        let r = repr(&value, 20);
        assert_eq!(r.chars().count(), 20);
        assert!(r.ends_with("..."));
    }
}
