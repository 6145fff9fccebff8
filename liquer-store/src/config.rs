//! Declarative store configuration.
//!
//! A [StoreRouterConfig] lists stores together with the key prefix they are mounted at.
//! A store with an empty prefix becomes the default store receiving all keys
//! outside of the mounted prefixes.
//!
//! ```yaml
//! stores:
//!   - type: memory
//!   - type: filesystem
//!     prefix: data
//!     config:
//!       path: ${HOME}/liquer-data
//!       read_only: true
//!   - type: filesystem
//!     prefix: reports
//!     config:
//!       path: ./reports
//!       recipes: true
//! ```

use std::collections::BTreeMap;
use std::sync::OnceLock;

use liquer_core::error::{Error, ErrorType};
use liquer_core::parse::parse_key;
use liquer_core::query::Key;
use regex::Regex;
use serde_json::Value as JsonValue;

/// Failures while reading a store configuration
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreConfigError {
    #[error("environment variable '{0}' is not set")]
    MissingVariable(String),
    #[error("missing option '{option}' for store type '{store_type}'")]
    MissingOption { store_type: String, option: String },
    #[error("option '{option}' of store type '{store_type}' must be {expected}")]
    InvalidOption {
        store_type: String,
        option: String,
        expected: &'static str,
    },
    #[error("unknown store type '{0}'")]
    UnknownStoreType(String),
    #[error("can't read {format} configuration: {message}")]
    Format {
        format: &'static str,
        message: String,
    },
}

impl From<StoreConfigError> for Error {
    fn from(e: StoreConfigError) -> Self {
        let error_type = match e {
            StoreConfigError::Format { .. } => ErrorType::ParseError,
            _ => ErrorType::ConfigurationError,
        };
        Error::new(error_type, e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct StoreRouterConfig {
    /// Stores in mount order
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// `memory`, `filesystem` (or `file`) or `remote`
    #[serde(rename = "type")]
    pub store_type: String,
    /// Mount point; empty for the default store
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub config: BTreeMap<String, JsonValue>,
    /// Metadata attached to the mount; not interpreted by the builder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, JsonValue>>,
}

impl StoreRouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_store(&mut self, store: StoreConfig) -> &mut Self {
        self.stores.push(store);
        self
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        serde_yaml::from_str(yaml).map_err(|e| {
            StoreConfigError::Format {
                format: "YAML",
                message: e.to_string(),
            }
            .into()
        })
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| {
            StoreConfigError::Format {
                format: "JSON",
                message: e.to_string(),
            }
            .into()
        })
    }

    #[cfg(feature = "toml")]
    pub fn from_toml(text: &str) -> Result<Self, Error> {
        toml::from_str(text).map_err(|e| {
            StoreConfigError::Format {
                format: "TOML",
                message: e.to_string(),
            }
            .into()
        })
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::general_error(format!("Can't write store configuration: {}", e)))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::general_error(format!("Can't write store configuration: {}", e)))
    }

    /// Replace `${VAR}` in all string options; every referenced variable must be set
    pub fn expand_env_vars(&mut self) -> Result<(), Error> {
        for store in self.stores.iter_mut() {
            store.expand_env_vars()?;
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn new(store_type: &str) -> Self {
        StoreConfig {
            store_type: store_type.to_owned(),
            prefix: String::new(),
            config: BTreeMap::new(),
            metadata: None,
        }
    }

    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_owned();
        self
    }

    pub fn with_config<V: Into<JsonValue>>(mut self, option: &str, value: V) -> Self {
        self.config.insert(option.to_owned(), value.into());
        self
    }

    pub fn key_prefix(&self) -> Result<Key, Error> {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            Ok(Key::new())
        } else {
            parse_key(prefix)
        }
    }

    pub fn get_string(&self, option: &str) -> Option<String> {
        match self.config.get(option)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn require_string(&self, option: &str) -> Result<String, Error> {
        self.get_string(option).ok_or_else(|| {
            StoreConfigError::MissingOption {
                store_type: self.store_type.clone(),
                option: option.to_owned(),
            }
            .into()
        })
    }

    /// Boolean option; strings `true`/`yes`/`1` are accepted as well
    pub fn get_flag(&self, option: &str) -> Result<bool, Error> {
        match self.config.get(option) {
            None | Some(JsonValue::Null) => Ok(false),
            Some(JsonValue::Bool(b)) => Ok(*b),
            Some(JsonValue::String(s)) => Ok(matches!(s.to_lowercase().as_str(), "true" | "yes" | "1")),
            Some(_) => Err(StoreConfigError::InvalidOption {
                store_type: self.store_type.clone(),
                option: option.to_owned(),
                expected: "a boolean",
            }
            .into()),
        }
    }

    pub fn expand_env_vars(&mut self) -> Result<(), Error> {
        self.prefix = expand_env_vars(&self.prefix)?;
        for value in self.config.values_mut() {
            if let JsonValue::String(s) = value {
                *s = expand_env_vars(s)?;
            }
        }
        Ok(())
    }
}

fn variable_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*)\}").ok()).as_ref()
}

/// Expand `${VAR}` references; unlike the setup configuration, a missing variable is an error.
///
/// ```
/// use liquer_store::config::expand_env_vars;
/// std::env::set_var("LIQUER_DOC_VAR", "hello");
/// assert_eq!(expand_env_vars("x_${LIQUER_DOC_VAR}_y").unwrap(), "x_hello_y");
/// ```
pub fn expand_env_vars(input: &str) -> Result<String, Error> {
    let re = match variable_regex() {
        Some(re) => re,
        None => return Ok(input.to_owned()),
    };
    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (whole, name) = match (caps.get(0), caps.get(1)) {
            (Some(whole), Some(name)) => (whole, name.as_str()),
            _ => continue,
        };
        let value = std::env::var(name)
            .map_err(|_| StoreConfigError::MissingVariable(name.to_owned()))?;
        result.push_str(&input[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&input[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_variables() -> Result<(), Error> {
        std::env::set_var("LIQUER_STORE_TEST_A", "aaa");
        std::env::set_var("LIQUER_STORE_TEST_B", "bbb");
        assert_eq!(
            expand_env_vars("${LIQUER_STORE_TEST_A}/${LIQUER_STORE_TEST_B}")?,
            "aaa/bbb"
        );
        assert_eq!(expand_env_vars("plain text")?, "plain text");
        let err = expand_env_vars("${LIQUER_STORE_TEST_NOT_SET}").unwrap_err();
        assert_eq!(err.error_type, ErrorType::ConfigurationError);
        Ok(())
    }

    #[test]
    fn router_config_from_yaml() -> Result<(), Error> {
        let config = StoreRouterConfig::from_yaml(
            r#"
stores:
  - type: memory
  - type: filesystem
    prefix: data
    config:
      path: ./data
      read_only: true
"#,
        )?;
        assert_eq!(config.stores.len(), 2);
        assert!(config.stores[0].key_prefix()?.is_empty());
        let data = &config.stores[1];
        assert_eq!(data.store_type, "filesystem");
        assert_eq!(data.key_prefix()?.encode(), "data");
        assert_eq!(data.get_string("path"), Some("./data".to_owned()));
        assert!(data.get_flag("read_only")?);
        assert!(!data.get_flag("recipes")?);
        Ok(())
    }

    #[test]
    fn router_config_from_json() -> Result<(), Error> {
        let config = StoreRouterConfig::from_json(
            r#"{"stores": [{"type": "remote", "prefix": "far/away", "config": {"url": "http://localhost:5000/liquer/api"}}]}"#,
        )?;
        assert_eq!(config.stores[0].key_prefix()?.len(), 2);
        assert!(config.stores[0].require_string("path").is_err());
        assert!(StoreRouterConfig::from_json("{").is_err());
        Ok(())
    }

    #[test]
    fn builder_style() -> Result<(), Error> {
        let mut config = StoreRouterConfig::new();
        config.add_store(
            StoreConfig::new("filesystem")
                .with_prefix("local")
                .with_config("path", "/tmp")
                .with_config("read_only", "yes"),
        );
        assert!(config.stores[0].get_flag("read_only")?);
        let yaml = config.to_yaml()?;
        assert_eq!(StoreRouterConfig::from_yaml(&yaml)?, config);
        Ok(())
    }

    #[cfg(feature = "toml")]
    #[test]
    fn router_config_from_toml() -> Result<(), Error> {
        let config = StoreRouterConfig::from_toml(
            r#"
[[stores]]
type = "memory"
prefix = "tmp"
"#,
        )?;
        assert_eq!(config.stores[0].prefix, "tmp");
        Ok(())
    }
}
