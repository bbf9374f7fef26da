use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use derive_more::From;
use serde::{Serialize, Serializer};

use crate::cmd::CommandDefinition;
use crate::evr::EvrDefinition;

/// A native value read from or written to a packet, command, or table.
///
/// Integers are carried as `i128` so every primitive from `I8` to `U64` fits without loss.
#[derive(Debug, Clone, From)]
pub enum Value {
    Int(i128),
    Float(f64),
    Str(String),
    Bool(bool),
    Time(DateTime<Utc>),
    List(Vec<Value>),
    /// Decoded `CMD16` value.
    Command(Arc<CommandDefinition>),
    /// Decoded `EVR16` value.
    Evr(Arc<EvrDefinition>),
}

macro_rules! from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i128::from(v))
                }
            }
        )*
    };
}

from_int!(i8, u8, i16, u16, i32, u32, i64, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i128)
    }
}

impl Value {
    /// Short name of the value's kind, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Time(_) => "time",
            Value::List(_) => "list",
            Value::Command(_) => "command",
            Value::Evr(_) => "evr",
        }
    }

    /// Integer view of a numeric value. Floats are truncated toward zero.
    #[must_use]
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(i128::from(*v)),
            Value::Float(v) if v.is_finite() => Some(v.trunc() as i128),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(f64::from(u8::from(*v))),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_time(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(t),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Bool(_))
    }

    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::List(l) => !l.is_empty(),
            Value::Time(_) | Value::Command(_) | Value::Evr(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Command(a), Value::Command(b)) => a.opcode() == b.opcode(),
            (Value::Evr(a), Value::Evr(b)) => a.code() == b.code(),
            (Value::Float(_), _) | (_, Value::Float(_)) => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => match (self.as_i128(), other.as_i128()) {
                (Some(a), Some(b)) if self.is_numeric() && other.is_numeric() => a == b,
                _ => false,
            },
        }
    }
}

/// Renders a timestamp as RFC 3339 text with microsecond precision.
pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::Bool(true) => write!(f, "True"),
            Value::Bool(false) => write!(f, "False"),
            Value::Time(t) => write!(f, "{}", format_time(t)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Command(c) => write!(f, "{}", c.name()),
            Value::Evr(e) => write!(f, "{}", e.name()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Int(v) => match i64::try_from(*v) {
                Ok(v) => serializer.serialize_i64(v),
                Err(_) => serializer.serialize_i128(*v),
            },
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Time(t) => serializer.serialize_str(&format_time(t)),
            Value::List(items) => items.serialize(serializer),
            Value::Command(c) => serializer.serialize_str(c.name()),
            Value::Evr(e) => serializer.serialize_str(e.name()),
        }
    }
}

impl TryFrom<&serde_json::Value> for Value {
    type Error = crate::Error;

    fn try_from(value: &serde_json::Value) -> crate::Result<Self> {
        match value {
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i128::from(i)))
                } else if let Some(u) = n.as_u64() {
                    Ok(Value::Int(i128::from(u)))
                } else {
                    Ok(Value::Float(n.as_f64().unwrap_or(f64::NAN)))
                }
            }
            serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
            serde_json::Value::Array(items) => Ok(Value::List(
                items
                    .iter()
                    .map(Value::try_from)
                    .collect::<crate::Result<Vec<_>>>()?,
            )),
            other => Err(crate::Error::Schema(format!(
                "cannot convert {other} to a value"
            ))),
        }
    }
}
