use std::borrow::Cow;
use std::collections::BTreeMap;

use crate::error::Error;

/// Basic built-in value type.
/// Value is the data carried by a [crate::state::State].
/// Serialization to bytes is not done by the value itself, but by a state type
/// (see [crate::state_types]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Value {
    None,
    Bool(bool),
    I64(i64),
    F64(f64),
    Text(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Default for Value {
    fn default() -> Self {
        Value::None
    }
}

impl Value {
    pub fn none() -> Self {
        Value::None
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn new(txt: &str) -> Self {
        Value::Text(txt.to_owned())
    }

    /// Type identifier of the state type handling this value
    pub fn identifier(&self) -> Cow<'static, str> {
        match self {
            Value::Text(_) => "text".into(),
            Value::Object(_) => "dictionary".into(),
            Value::Bytes(_) => "bytes".into(),
            _ => "generic".into(),
        }
    }

    /// Name of the variant, for messages and data characteristics
    pub fn type_name(&self) -> Cow<'static, str> {
        match self {
            Value::None => "none".into(),
            Value::Bool(_) => "bool".into(),
            Value::I64(_) => "i64".into(),
            Value::F64(_) => "f64".into(),
            Value::Text(_) => "text".into(),
            Value::Array(_) => "array".into(),
            Value::Object(_) => "object".into(),
            Value::Bytes(_) => "bytes".into(),
        }
    }

    pub fn try_into_string(&self) -> Result<String, Error> {
        match self {
            Value::Bool(b) => Ok(format!("{b}")),
            Value::I64(n) => Ok(format!("{n}")),
            Value::F64(n) => Ok(format!("{n}")),
            Value::Text(t) => Ok(t.to_owned()),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(b).to_string()),
            _ => Err(Error::conversion_error(self.type_name(), "string")),
        }
    }

    pub fn try_into_i64(&self) -> Result<i64, Error> {
        match self {
            Value::I64(n) => Ok(*n),
            Value::Bool(b) => Ok(if *b { 1 } else { 0 }),
            Value::F64(x) if x.fract() == 0.0 => Ok(*x as i64),
            Value::Text(t) => t
                .trim()
                .parse::<i64>()
                .map_err(|_| Error::conversion_error(t, "i64")),
            _ => Err(Error::conversion_error(self.type_name(), "i64")),
        }
    }

    pub fn try_into_f64(&self) -> Result<f64, Error> {
        match self {
            Value::I64(n) => Ok(*n as f64),
            Value::F64(x) => Ok(*x),
            Value::Text(t) => t
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::conversion_error(t, "f64")),
            _ => Err(Error::conversion_error(self.type_name(), "f64")),
        }
    }

    pub fn try_into_bool(&self) -> Result<bool, Error> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::I64(x) => Ok(*x != 0),
            Value::Text(t) => Ok(parse_bool(t)),
            _ => Err(Error::conversion_error(self.type_name(), "bool")),
        }
    }

    /// Raw bytes of a bytes or text value
    pub fn try_as_bytes(&self) -> Result<&[u8], Error> {
        match self {
            Value::Bytes(b) => Ok(b),
            Value::Text(t) => Ok(t.as_bytes()),
            _ => Err(Error::conversion_error(self.type_name(), "bytes")),
        }
    }

    pub fn try_into_json_value(&self) -> Result<serde_json::Value, Error> {
        match self {
            Value::None => Ok(serde_json::Value::Null),
            Value::Bool(flag) => Ok((*flag).into()),
            Value::I64(n) => Ok((*n).into()),
            Value::F64(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::conversion_error(n, "JSON number")),
            Value::Text(t) => Ok(serde_json::Value::String(t.clone())),
            Value::Array(items) => items
                .iter()
                .map(Value::try_into_json_value)
                .collect::<Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Value::Object(fields) => fields
                .iter()
                .map(|(name, item)| -> Result<_, Error> {
                    Ok((name.clone(), item.try_into_json_value()?))
                })
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(serde_json::Value::Object),
            Value::Bytes(_) => Err(Error::conversion_error(self.type_name(), "JSON value")),
        }
    }

    pub fn from_json_value(value: &serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => Value::None,
            Json::Bool(flag) => Value::Bool(*flag),
            Json::Number(n) => n
                .as_i64()
                .map(Value::I64)
                .unwrap_or_else(|| Value::F64(n.as_f64().unwrap_or(f64::NAN))),
            Json::String(text) => Value::Text(text.clone()),
            Json::Array(items) => Value::Array(items.iter().map(Value::from_json_value).collect()),
            Json::Object(o) => Value::Object(
                o.iter()
                    .map(|(k, v)| (k.to_owned(), Value::from_json_value(v)))
                    .collect(),
            ),
        }
    }
}

/// Boolean parsing used for textual arguments:
/// `y`, `yes`, `t` and `true` in any letter case are true, anything else is false.
pub fn parse_bool(text: &str) -> bool {
    matches!(text.to_lowercase().as_str(), "y" | "yes" | "t" | "true")
}

/// `TryFrom<Value>` through one of the `try_into_*` conversions
macro_rules! try_from_value {
    ($($target:ty => $convert:ident),+ $(,)?) => {
        $(
            impl TryFrom<Value> for $target {
                type Error = Error;
                fn try_from(value: Value) -> Result<Self, Error> {
                    value.$convert()
                }
            }
        )+
    };
}

try_from_value!(i64 => try_into_i64, f64 => try_into_f64, bool => try_into_bool);

impl TryFrom<&Value> for i64 {
    type Error = Error;
    fn try_from(value: &Value) -> Result<Self, Error> {
        value.try_into_i64()
    }
}

impl TryFrom<Value> for String {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self, Error> {
        if let Value::Text(text) = value {
            return Ok(text);
        }
        value.try_into_string()
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;
    fn try_from(value: Value) -> Result<Self, Error> {
        match value {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Text(text) => Ok(text.into_bytes()),
            other => Err(Error::conversion_error(other.type_name(), "bytes")),
        }
    }
}

/// `From<T> for Value` wrapping into the given variant
macro_rules! value_from {
    ($($source:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$source> for Value {
                fn from(value: $source) -> Value {
                    Value::$variant(value.into())
                }
            }
        )+
    };
}

value_from!(
    i32 => I64,
    i64 => I64,
    f64 => F64,
    bool => Bool,
    String => Text,
    &str => Text,
    Vec<u8> => Bytes,
    Vec<Value> => Array,
    BTreeMap<String, Value> => Object,
);

impl From<()> for Value {
    fn from(_: ()) -> Value {
        Value::None
    }
}
