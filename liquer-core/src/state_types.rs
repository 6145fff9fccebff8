//! State types define how values are serialized, which media type they have
//! and how they are identified across platforms.
//!
//! A state type is registered in [StateTypesRegistry] under its identifier and
//! under any number of type names. Lookup of an unknown name returns the
//! default state type, which does not support serialization - states of such
//! types can be evaluated, but they are never cached or served.
//!
//! The serialization format is selected by a file extension passed to
//! [StateType::as_bytes] or [StateType::from_bytes]; `None` selects the default.

#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use base64::Engine;

use crate::error::Error;
use crate::media_type::file_extension_to_media_type;
use crate::metadata::DataCharacteristics;
use crate::value::Value;

pub trait StateType: Send + Sync {
    /// Cross-platform identifier of the state type
    fn identifier(&self) -> &str;

    /// Default extension, determines the default serialization format
    fn default_extension(&self) -> &str;

    fn default_filename(&self) -> String {
        format!("data.{}", self.default_extension())
    }

    fn default_mimetype(&self) -> String {
        file_extension_to_media_type(self.default_extension()).to_owned()
    }

    fn is_type_of(&self, value: &Value) -> bool;

    /// Serialize value in a format given by the extension.
    /// Returns the bytes and the media type of the serialized form.
    fn as_bytes(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String), Error>;

    fn from_bytes(&self, bytes: &[u8], extension: Option<&str>) -> Result<Value, Error>;

    /// Copy by a round-trip through the default format
    fn copy(&self, value: &Value) -> Result<Value, Error> {
        let (bytes, _) = self.as_bytes(value, None)?;
        self.from_bytes(&bytes, None)
    }

    fn data_characteristics(&self, value: &Value) -> DataCharacteristics {
        DataCharacteristics {
            description: describe(value),
            type_identifier: self.identifier().to_owned(),
            extra: BTreeMap::new(),
        }
    }

    /// Serialization is supported for the value in the default format
    fn supports_serialization(&self) -> bool {
        true
    }

    /// Volatile values (e.g. iterators over live data) are never cached
    fn is_volatile(&self, _value: &Value) -> bool {
        false
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::None => "none".to_owned(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::I64(n) => format!("integer {}", n),
        Value::F64(x) => format!("float {}", x),
        Value::Text(t) => format!("text ({} characters)", t.chars().count()),
        Value::Array(a) => format!("array of {} items", a.len()),
        Value::Object(o) => format!("dictionary with {} keys", o.len()),
        Value::Bytes(b) => format!("bytes ({} bytes)", b.len()),
    }
}

fn unsupported_format(identifier: &str, extension: &str) -> Error {
    Error::serialization_error(identifier, &format!("unsupported format '{}'", extension))
}

fn json_error(identifier: &str, e: impl std::fmt::Display) -> Error {
    Error::serialization_error(identifier, &e.to_string())
}

fn to_json_bytes(identifier: &str, value: &Value) -> Result<Vec<u8>, Error> {
    let json = value.try_into_json_value()?;
    serde_json::to_vec(&json).map_err(|e| json_error(identifier, e))
}

fn to_yaml_bytes(identifier: &str, value: &Value) -> Result<Vec<u8>, Error> {
    let json = value.try_into_json_value()?;
    serde_yaml::to_string(&json)
        .map(|s| s.into_bytes())
        .map_err(|e| json_error(identifier, e))
}

fn from_json_bytes(identifier: &str, bytes: &[u8]) -> Result<Value, Error> {
    let json: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| json_error(identifier, e))?;
    Ok(Value::from_json_value(&json))
}

fn from_yaml_bytes(identifier: &str, bytes: &[u8]) -> Result<Value, Error> {
    let json: serde_json::Value =
        serde_yaml::from_slice(bytes).map_err(|e| json_error(identifier, e))?;
    Ok(Value::from_json_value(&json))
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// JSON-serializable values
pub struct GenericStateType;

impl StateType for GenericStateType {
    fn identifier(&self) -> &str {
        "generic"
    }

    fn default_extension(&self) -> &str {
        "json"
    }

    fn is_type_of(&self, value: &Value) -> bool {
        !matches!(value, Value::Bytes(_))
    }

    fn as_bytes(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String), Error> {
        let extension = extension.unwrap_or(self.default_extension());
        let bytes = match extension {
            "json" | "txt" => to_json_bytes(self.identifier(), value)?,
            "yaml" | "yml" => to_yaml_bytes(self.identifier(), value)?,
            "html" | "htm" => match value {
                Value::Text(t) => t.as_bytes().to_vec(),
                _ => {
                    let json = to_json_bytes(self.identifier(), value)?;
                    format!("<pre>{}</pre>", html_escape(&String::from_utf8_lossy(&json)))
                        .into_bytes()
                }
            },
            _ => return Err(unsupported_format(self.identifier(), extension)),
        };
        Ok((bytes, file_extension_to_media_type(extension).to_owned()))
    }

    fn from_bytes(&self, bytes: &[u8], extension: Option<&str>) -> Result<Value, Error> {
        let extension = extension.unwrap_or(self.default_extension());
        match extension {
            "json" | "txt" => from_json_bytes(self.identifier(), bytes),
            "yaml" | "yml" => from_yaml_bytes(self.identifier(), bytes),
            _ => Err(unsupported_format(self.identifier(), extension)),
        }
    }

    fn copy(&self, value: &Value) -> Result<Value, Error> {
        Ok(value.clone())
    }
}

const DJSON_TYPE_IDENTIFIER: &str = "type_identifier";
const DJSON_EXTENSION: &str = "extension";
const DJSON_DATA: &str = "data_base64";

/// Structured dictionaries.
/// Besides JSON and YAML it supports `djson`, where values that can't be represented
/// in JSON (bytes) are embedded as base64 envelopes carrying their type identifier and extension.
pub struct DictionaryStateType;

impl DictionaryStateType {
    fn to_djson(value: &Value) -> serde_json::Value {
        match value {
            Value::Bytes(b) => {
                let mut envelope = serde_json::Map::new();
                envelope.insert(DJSON_TYPE_IDENTIFIER.to_owned(), "bytes".into());
                envelope.insert(DJSON_EXTENSION.to_owned(), "b".into());
                envelope.insert(
                    DJSON_DATA.to_owned(),
                    base64::engine::general_purpose::STANDARD.encode(b).into(),
                );
                serde_json::Value::Object(envelope)
            }
            Value::Array(a) => serde_json::Value::Array(a.iter().map(Self::to_djson).collect()),
            Value::Object(o) => serde_json::Value::Object(
                o.iter()
                    .map(|(k, v)| (k.clone(), Self::to_djson(v)))
                    .collect(),
            ),
            Value::F64(x) => serde_json::Number::from_f64(*x)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            other => other.try_into_json_value().unwrap_or(serde_json::Value::Null),
        }
    }

    fn from_djson(json: &serde_json::Value) -> Result<Value, Error> {
        match json {
            serde_json::Value::Object(o) => {
                if o.len() == 3 {
                    if let (Some(serde_json::Value::String(ti)), Some(_), Some(serde_json::Value::String(data))) =
                        (o.get(DJSON_TYPE_IDENTIFIER), o.get(DJSON_EXTENSION), o.get(DJSON_DATA))
                    {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(data)
                            .map_err(|e| json_error("dictionary", e))?;
                        return match ti.as_str() {
                            "text" => Ok(Value::Text(String::from_utf8_lossy(&bytes).to_string())),
                            _ => Ok(Value::Bytes(bytes)),
                        };
                    }
                }
                let mut map = BTreeMap::new();
                for (k, v) in o.iter() {
                    map.insert(k.clone(), Self::from_djson(v)?);
                }
                Ok(Value::Object(map))
            }
            serde_json::Value::Array(a) => Ok(Value::Array(
                a.iter().map(Self::from_djson).collect::<Result<Vec<_>, _>>()?,
            )),
            other => Ok(Value::from_json_value(other)),
        }
    }
}

impl StateType for DictionaryStateType {
    fn identifier(&self) -> &str {
        "dictionary"
    }

    fn default_extension(&self) -> &str {
        "json"
    }

    fn is_type_of(&self, value: &Value) -> bool {
        matches!(value, Value::Object(_))
    }

    fn as_bytes(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String), Error> {
        let extension = extension.unwrap_or(self.default_extension());
        let bytes = match extension {
            "json" => to_json_bytes(self.identifier(), value)?,
            "djson" => serde_json::to_vec(&Self::to_djson(value))
                .map_err(|e| json_error(self.identifier(), e))?,
            "yaml" | "yml" => to_yaml_bytes(self.identifier(), value)?,
            "html" | "htm" => {
                let json = to_json_bytes(self.identifier(), value)?;
                format!("<pre>{}</pre>", html_escape(&String::from_utf8_lossy(&json))).into_bytes()
            }
            _ => return Err(unsupported_format(self.identifier(), extension)),
        };
        Ok((bytes, file_extension_to_media_type(extension).to_owned()))
    }

    fn from_bytes(&self, bytes: &[u8], extension: Option<&str>) -> Result<Value, Error> {
        let extension = extension.unwrap_or(self.default_extension());
        match extension {
            "json" => from_json_bytes(self.identifier(), bytes),
            "djson" => {
                let json: serde_json::Value =
                    serde_json::from_slice(bytes).map_err(|e| json_error(self.identifier(), e))?;
                Self::from_djson(&json)
            }
            "yaml" | "yml" => from_yaml_bytes(self.identifier(), bytes),
            _ => Err(unsupported_format(self.identifier(), extension)),
        }
    }

    fn copy(&self, value: &Value) -> Result<Value, Error> {
        Ok(value.clone())
    }
}

/// Raw binary data
pub struct BytesStateType;

impl StateType for BytesStateType {
    fn identifier(&self) -> &str {
        "bytes"
    }

    fn default_extension(&self) -> &str {
        "b"
    }

    fn is_type_of(&self, value: &Value) -> bool {
        matches!(value, Value::Bytes(_))
    }

    fn as_bytes(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String), Error> {
        let bytes = value.try_as_bytes()?.to_vec();
        let extension = extension.unwrap_or(self.default_extension());
        Ok((bytes, file_extension_to_media_type(extension).to_owned()))
    }

    fn from_bytes(&self, bytes: &[u8], _extension: Option<&str>) -> Result<Value, Error> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

/// UTF-8 text. The same implementation serves other textual identifiers (e.g. `template`).
pub struct TextStateType {
    identifier: String,
}

impl TextStateType {
    pub fn new() -> Self {
        TextStateType {
            identifier: "text".to_owned(),
        }
    }
    pub fn with_identifier(identifier: &str) -> Self {
        TextStateType {
            identifier: identifier.to_owned(),
        }
    }
}

impl StateType for TextStateType {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn default_extension(&self) -> &str {
        "txt"
    }

    fn is_type_of(&self, value: &Value) -> bool {
        matches!(value, Value::Text(_))
    }

    fn as_bytes(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String), Error> {
        let text = value.try_into_string()?;
        let extension = extension.unwrap_or(self.default_extension());
        let media_type = match file_extension_to_media_type(extension) {
            "application/octet-stream" => "text/plain",
            m => m,
        };
        Ok((text.into_bytes(), media_type.to_owned()))
    }

    fn from_bytes(&self, bytes: &[u8], _extension: Option<&str>) -> Result<Value, Error> {
        String::from_utf8(bytes.to_vec())
            .map(Value::Text)
            .map_err(|e| Error::serialization_error(&self.identifier, &e.to_string()))
    }

    fn copy(&self, value: &Value) -> Result<Value, Error> {
        Ok(value.clone())
    }
}

/// Fallback for unknown type identifiers; serialization is not supported
pub struct UnsupportedStateType;

impl StateType for UnsupportedStateType {
    fn identifier(&self) -> &str {
        "unsupported"
    }

    fn default_extension(&self) -> &str {
        "b"
    }

    fn is_type_of(&self, _value: &Value) -> bool {
        false
    }

    fn as_bytes(&self, _value: &Value, _extension: Option<&str>) -> Result<(Vec<u8>, String), Error> {
        Err(Error::serialization_error(
            self.identifier(),
            "serialization is not supported",
        ))
    }

    fn from_bytes(&self, _bytes: &[u8], _extension: Option<&str>) -> Result<Value, Error> {
        Err(Error::serialization_error(
            self.identifier(),
            "deserialization is not supported",
        ))
    }

    fn copy(&self, value: &Value) -> Result<Value, Error> {
        Ok(value.clone())
    }

    fn supports_serialization(&self) -> bool {
        false
    }
}

/// Registry of state types, addressable both by type name and identifier
#[derive(Clone)]
pub struct StateTypesRegistry {
    types: HashMap<String, Arc<dyn StateType>>,
    default_state_type: Arc<dyn StateType>,
}

impl StateTypesRegistry {
    /// Empty registry, only containing the default (unsupported) type
    pub fn empty() -> Self {
        StateTypesRegistry {
            types: HashMap::new(),
            default_state_type: Arc::new(UnsupportedStateType),
        }
    }

    /// Registry with the built-in state types
    pub fn new() -> Self {
        let mut registry = Self::empty();
        let generic: Arc<dyn StateType> = Arc::new(GenericStateType);
        for name in ["none", "bool", "i64", "f64", "array"] {
            registry.register(name, generic.clone());
        }
        registry.register("object", Arc::new(DictionaryStateType));
        registry.register("text", Arc::new(TextStateType::new()));
        registry.register("bytes", Arc::new(BytesStateType));
        registry.register("template", Arc::new(TextStateType::with_identifier("template")));
        registry
    }

    /// Register a state type under a type name and its identifier
    pub fn register(&mut self, type_name: &str, state_type: Arc<dyn StateType>) -> &mut Self {
        self.types
            .insert(state_type.identifier().to_owned(), state_type.clone());
        self.types.insert(type_name.to_owned(), state_type);
        self
    }

    /// Lookup by type name or identifier; unknown names give the default state type
    pub fn get(&self, name: &str) -> Arc<dyn StateType> {
        self.types
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_state_type.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn get_for_value(&self, value: &Value) -> Arc<dyn StateType> {
        self.get(&value.type_name())
    }

    pub fn type_identifier_of(&self, value: &Value) -> String {
        self.get_for_value(value).identifier().to_owned()
    }

    /// Serialize the value, returns bytes, media type and type identifier
    pub fn encode(&self, value: &Value, extension: Option<&str>) -> Result<(Vec<u8>, String, String), Error> {
        let t = self.get_for_value(value);
        let (bytes, mime) = t.as_bytes(value, extension)?;
        Ok((bytes, mime, t.identifier().to_owned()))
    }

    pub fn decode(&self, bytes: &[u8], type_identifier: &str, extension: Option<&str>) -> Result<Value, Error> {
        self.get(type_identifier).from_bytes(bytes, extension)
    }

    pub fn copy(&self, value: &Value) -> Result<Value, Error> {
        self.get_for_value(value).copy(value)
    }

    /// Data characteristics with the type identifier always filled in
    pub fn data_characteristics(&self, value: &Value) -> DataCharacteristics {
        let t = self.get_for_value(value);
        let mut dc = t.data_characteristics(value);
        if dc.type_identifier.is_empty() {
            dc.type_identifier = t.identifier().to_owned();
        }
        dc
    }
}

impl Default for StateTypesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup() {
        let registry = StateTypesRegistry::new();
        assert_eq!(registry.get("generic").identifier(), "generic");
        assert_eq!(registry.get("i64").identifier(), "generic");
        assert_eq!(registry.get("object").identifier(), "dictionary");
        assert_eq!(registry.get("no-such-type").identifier(), "unsupported");
        assert!(!registry.get("no-such-type").supports_serialization());
        assert_eq!(registry.type_identifier_of(&Value::from("x")), "text");
    }

    #[test]
    fn generic_formats() -> Result<(), Error> {
        let registry = StateTypesRegistry::new();
        let (b, mime, ti) = registry.encode(&Value::I64(42), None)?;
        assert_eq!(b, b"42");
        assert_eq!(mime, "application/json");
        assert_eq!(ti, "generic");
        let (b, mime, _) = registry.encode(&Value::I64(42), Some("txt"))?;
        assert_eq!(b, b"42");
        assert_eq!(mime, "text/plain");
        let (b, _, _) = registry.encode(&Value::Array(vec![Value::I64(1)]), Some("html"))?;
        assert_eq!(b, b"<pre>[1]</pre>");
        assert!(registry.encode(&Value::I64(1), Some("csv")).is_err());
        let v = registry.decode(b"[1,2]", "generic", None)?;
        assert_eq!(v, Value::Array(vec![Value::I64(1), Value::I64(2)]));
        Ok(())
    }

    #[test]
    fn djson_embeds_bytes() -> Result<(), Error> {
        let registry = StateTypesRegistry::new();
        let mut map = BTreeMap::new();
        map.insert("name".to_owned(), Value::from("x"));
        map.insert("blob".to_owned(), Value::Bytes(vec![0, 1, 2, 255]));
        let value = Value::Object(map);
        assert!(registry.encode(&value, Some("json")).is_err());
        let (b, _, ti) = registry.encode(&value, Some("djson"))?;
        assert_eq!(ti, "dictionary");
        let text = String::from_utf8(b.clone()).unwrap();
        assert!(text.contains("\"type_identifier\":\"bytes\""));
        let decoded = registry.decode(&b, "dictionary", Some("djson"))?;
        assert_eq!(decoded, value);
        Ok(())
    }

    #[test]
    fn text_and_bytes() -> Result<(), Error> {
        let registry = StateTypesRegistry::new();
        let (b, mime, _) = registry.encode(&Value::from("hello"), Some("html"))?;
        assert_eq!(b, b"hello");
        assert_eq!(mime, "text/html");
        let v = registry.decode(b"hello", "text", None)?;
        assert_eq!(v, Value::from("hello"));
        let (b, mime, ti) = registry.encode(&Value::Bytes(vec![1, 2]), None)?;
        assert_eq!(b, vec![1, 2]);
        assert_eq!(mime, "application/octet-stream");
        assert_eq!(ti, "bytes");
        Ok(())
    }

    #[test]
    fn characteristics() {
        let registry = StateTypesRegistry::new();
        let dc = registry.data_characteristics(&Value::I64(5));
        assert_eq!(dc.type_identifier, "generic");
        assert_eq!(dc.description, "integer 5");
    }
}
