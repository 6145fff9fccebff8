//! Configuration of a liquer installation.
//!
//! The configuration is a YAML document with all options under the `setup` key:
//! ```yaml
//! setup:
//!   preset: default
//!   modules: [core, text]
//!   cache: file
//!   cache_path: ${HOME}/.liquer/cache
//!   recipe_folders: [data]
//!   port: 5000
//! ```
//! String values may reference environment variables as `${VAR}`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use regex::{Captures, Regex};
use serde_json::Value as JsonValue;

use crate::cache::{Cache, FileCache, MemoryCache, NoCache};
use crate::error::{Error, ErrorType};
use crate::state_types::StateTypesRegistry;

fn default_preset() -> String {
    "default".to_owned()
}

fn default_cache() -> String {
    "off".to_owned()
}

fn default_cache_path() -> String {
    "cache".to_owned()
}

fn default_concurrency() -> String {
    "off".to_owned()
}

fn default_server_type() -> String {
    "axum".to_owned()
}

fn default_url_prefix() -> String {
    "/liquer".to_owned()
}

fn default_port() -> u16 {
    5000
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

fn default_index_query() -> String {
    "index.html".to_owned()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetupConfig {
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default)]
    pub modules: Vec<String>,
    /// `off`, `memory`, `file` or `sqlite`
    #[serde(default = "default_cache")]
    pub cache: String,
    #[serde(default = "default_cache_path")]
    pub cache_path: String,
    /// `off`, `local` or `central`
    #[serde(default = "default_concurrency")]
    pub cache_concurrency: String,
    #[serde(default)]
    pub recipe_folders: Vec<String>,
    #[serde(default = "default_server_type")]
    pub server_type: String,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_index_query")]
    pub index_query: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Default for SetupConfig {
    fn default() -> Self {
        SetupConfig {
            preset: default_preset(),
            modules: Vec::new(),
            cache: default_cache(),
            cache_path: default_cache_path(),
            cache_concurrency: default_concurrency(),
            recipe_folders: Vec::new(),
            server_type: default_server_type(),
            url_prefix: default_url_prefix(),
            port: default_port(),
            host: default_host(),
            index_query: default_index_query(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub setup: SetupConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the configuration and expand environment variables
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let mut config: Config = serde_yaml::from_str(yaml).map_err(|e| {
            Error::new(
                ErrorType::ParseError,
                format!("Failed to parse YAML configuration: {}", e),
            )
        })?;
        config.expand_env_vars();
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_error(format!(
                "Can't read configuration file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&text)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self).map_err(|e| {
            Error::new(
                ErrorType::General,
                format!("Failed to serialize configuration to YAML: {}", e),
            )
        })
    }

    pub fn expand_env_vars(&mut self) {
        let setup = &mut self.setup;
        for text in [
            &mut setup.preset,
            &mut setup.cache,
            &mut setup.cache_path,
            &mut setup.cache_concurrency,
            &mut setup.server_type,
            &mut setup.url_prefix,
            &mut setup.host,
            &mut setup.index_query,
        ] {
            *text = expand_env_vars(text);
        }
        for text in setup
            .modules
            .iter_mut()
            .chain(setup.recipe_folders.iter_mut())
        {
            *text = expand_env_vars(text);
        }
        for value in setup.extra.values_mut().chain(self.extra.values_mut()) {
            expand_json(value);
        }
    }

    /// Cache selected by `setup.cache`
    pub fn create_cache(&self, state_types: Arc<StateTypesRegistry>) -> Result<Arc<dyn Cache>, Error> {
        let setup = &self.setup;
        match setup.cache.as_str() {
            "off" | "none" | "" => Ok(Arc::new(NoCache::new())),
            "memory" => Ok(Arc::new(MemoryCache::new())),
            "file" => {
                std::fs::create_dir_all(&setup.cache_path).map_err(|e| {
                    Error::configuration_error(format!(
                        "Can't create cache directory {}: {}",
                        setup.cache_path, e
                    ))
                })?;
                Ok(Arc::new(
                    FileCache::new(&setup.cache_path).with_state_types(state_types),
                ))
            }
            #[cfg(feature = "sql_cache")]
            "sqlite" => {
                let connection = rusqlite::Connection::open(&setup.cache_path).map_err(|e| {
                    Error::configuration_error(format!(
                        "Can't open SQL cache {}: {}",
                        setup.cache_path, e
                    ))
                })?;
                Ok(Arc::new(crate::cache::SqlCache::new(connection)?))
            }
            other => Err(Error::configuration_error(format!(
                "Unknown cache '{}'",
                other
            ))),
        }
    }
}

fn env_var_regex() -> Option<&'static Regex> {
    static RE: std::sync::OnceLock<Option<Regex>> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").ok())
        .as_ref()
}

/// Expand `${VAR}` references from the environment.
/// Unknown variables are left in place.
pub fn expand_env_vars(input: &str) -> String {
    let re = match env_var_regex() {
        Some(re) => re,
        None => return input.to_owned(),
    };
    re.replace_all(input, |caps: &Captures| {
            let name = &caps[1];
            match std::env::var(name) {
                Ok(value) => value,
                Err(_) => {
                    tracing::warn!(variable = name, "environment variable not set");
                    caps[0].to_owned()
                }
            }
        })
        .into_owned()
}

fn expand_json(value: &mut JsonValue) {
    match value {
        JsonValue::String(s) => *s = expand_env_vars(s),
        JsonValue::Array(a) => a.iter_mut().for_each(expand_json),
        JsonValue::Object(o) => o.values_mut().for_each(expand_json),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() -> Result<(), Error> {
        let config = Config::from_yaml("{}")?;
        assert_eq!(config.setup.preset, "default");
        assert_eq!(config.setup.url_prefix, "/liquer");
        assert_eq!(config.setup.port, 5000);
        assert_eq!(config.setup.cache, "off");
        Ok(())
    }

    #[test]
    fn setup_section() -> Result<(), Error> {
        std::env::set_var("LIQUER_TEST_CACHE_DIR", "/tmp/lq");
        let config = Config::from_yaml(
            r#"
setup:
  preset: memory
  modules: [core, text]
  cache: file
  cache_path: ${LIQUER_TEST_CACHE_DIR}/cache
  recipe_folders: [data, "${LIQUER_TEST_UNSET_VARIABLE}"]
  port: 8080
  custom: ${LIQUER_TEST_CACHE_DIR}
other:
  x: 1
"#,
        )?;
        let setup = &config.setup;
        assert_eq!(setup.preset, "memory");
        assert_eq!(setup.modules, vec!["core".to_owned(), "text".to_owned()]);
        assert_eq!(setup.cache_path, "/tmp/lq/cache");
        assert_eq!(setup.recipe_folders[1], "${LIQUER_TEST_UNSET_VARIABLE}");
        assert_eq!(setup.port, 8080);
        assert_eq!(setup.extra.get("custom"), Some(&JsonValue::from("/tmp/lq")));
        assert!(config.extra.contains_key("other"));
        Ok(())
    }

    #[test]
    fn unknown_cache() -> Result<(), Error> {
        let mut config = Config::new();
        config.setup.cache = "redis".to_owned();
        assert!(config.create_cache(Arc::new(StateTypesRegistry::new())).is_err());
        config.setup.cache = "memory".to_owned();
        assert_eq!(
            config
                .create_cache(Arc::new(StateTypesRegistry::new()))?
                .cache_name(),
            "memory cache"
        );
        Ok(())
    }
}
