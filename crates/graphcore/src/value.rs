use serde::{Deserialize, Serialize};
use std::fmt;

/// Literal value produced by evaluating a parameter expression
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

/// Type a literal parameter expects its expression to evaluate to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::Bool => "bool",
            ValueType::Int => "int",
            ValueType::Float => "float",
            ValueType::Str => "string",
        };
        f.write_str(name)
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }

    /// Converts the value to `expected`.
    ///
    /// Integers widen to floats, floats narrow to integers only when they
    /// are integral and in range, and every non-null value renders as a
    /// string. `Null` passes through unchanged; whether it is acceptable is
    /// decided by the parameter's nullability.
    pub fn coerce(self, expected: ValueType) -> Option<Value> {
        match (self, expected) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Bool(b), ValueType::Bool) => Some(Value::Bool(b)),
            (Value::Int(n), ValueType::Int) => Some(Value::Int(n)),
            (Value::Int(n), ValueType::Float) => Some(Value::Float(n as f64)),
            (Value::Float(n), ValueType::Float) => Some(Value::Float(n)),
            (Value::Float(n), ValueType::Int) => {
                if n.is_finite() && n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 {
                    Some(Value::Int(n as i64))
                } else {
                    None
                }
            }
            (Value::Str(s), ValueType::Str) => Some(Value::Str(s)),
            (other, ValueType::Str) => Some(Value::Str(other.to_string())),
            _ => None,
        }
    }

    /// Renders the value as an expression that evaluates back to it.
    /// Non-finite floats have no such form and render as their display text.
    pub fn to_expression(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            // The literal 9223372036854775808 does not fit an i64.
            Value::Int(i64::MIN) => format!("({} - 1)", i64::MIN + 1),
            Value::Int(n) => n.to_string(),
            Value::Float(n) => format!("{:?}", n),
            Value::Str(s) => {
                let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\"", escaped)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
