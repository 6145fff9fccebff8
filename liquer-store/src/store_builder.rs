//! Construction of a [MountPointStore] from a [StoreRouterConfig].

use std::sync::Arc;

use liquer_core::context::Environment;
use liquer_core::error::Error;
use liquer_core::query::Key;
use liquer_core::recipes::RecipeSpecStore;
use liquer_core::store::{FileStore, MemoryStore, MountPointStore, ReadOnlyStore, Store};

use crate::config::{StoreConfig, StoreConfigError, StoreRouterConfig};
use crate::remote::{HttpTransport, RemoteStore};

pub struct StoreRouterBuilder {
    config: StoreRouterConfig,
    envref: Option<Arc<Environment>>,
    transport: Option<Arc<dyn HttpTransport>>,
    expand_env_vars: bool,
}

impl StoreRouterBuilder {
    pub fn new(config: StoreRouterConfig) -> Self {
        StoreRouterBuilder {
            config,
            envref: None,
            transport: None,
            expand_env_vars: true,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        Ok(Self::new(StoreRouterConfig::from_yaml(yaml)?))
    }

    pub fn from_json(json: &str) -> Result<Self, Error> {
        Ok(Self::new(StoreRouterConfig::from_json(json)?))
    }

    /// Environment evaluating recipes of stores with the `recipes` option
    pub fn with_environment(mut self, envref: Arc<Environment>) -> Self {
        self.envref = Some(envref);
        self
    }

    /// Transport used by `remote` stores
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Keep `${VAR}` references unexpanded
    pub fn without_env_expansion(mut self) -> Self {
        self.expand_env_vars = false;
        self
    }

    pub fn build(mut self) -> Result<Arc<MountPointStore>, Error> {
        if self.expand_env_vars {
            self.config.expand_env_vars()?;
        }
        let mut default_store = None;
        let mut mounts = Vec::new();
        for store_config in self.config.stores.iter() {
            let store = create_store(store_config, self.envref.as_ref(), self.transport.as_ref())?;
            let prefix = store_config.key_prefix()?;
            if prefix.is_empty() {
                if default_store.is_some() {
                    return Err(Error::configuration_error(
                        "Only one store can be mounted without a prefix".to_owned(),
                    ));
                }
                default_store = Some(store);
            } else {
                mounts.push((prefix, store));
            }
        }
        let router = MountPointStore::new(default_store);
        for (prefix, store) in mounts {
            tracing::info!(prefix = %prefix, store = %store.store_name(), "store mounted");
            router.mount(&prefix, store)?;
        }
        Ok(router)
    }
}

/// Create a single store; the prefix is applied by the router, not by the store
pub fn create_store(
    config: &StoreConfig,
    envref: Option<&Arc<Environment>>,
    transport: Option<&Arc<dyn HttpTransport>>,
) -> Result<Arc<dyn Store>, Error> {
    let mut store: Arc<dyn Store> = match config.store_type.as_str() {
        "memory" => Arc::new(MemoryStore::default()),
        "filesystem" | "file" => {
            let path = config.require_string("path")?;
            std::fs::create_dir_all(&path).map_err(|e| {
                Error::configuration_error(format!("Can't create store directory {}: {}", path, e))
            })?;
            Arc::new(FileStore::new(&path, &Key::new()))
        }
        "remote" => {
            let url = config.require_string("url")?;
            let transport = match transport {
                Some(transport) => transport.clone(),
                None => default_transport(config)?,
            };
            Arc::new(RemoteStore::new(&url, transport))
        }
        other => return Err(StoreConfigError::UnknownStoreType(other.to_owned()).into()),
    };
    if config.get_flag("recipes")? {
        let envref = envref.ok_or_else(|| {
            Error::configuration_error(format!(
                "Store '{}' with recipes needs an environment",
                config.prefix
            ))
        })?;
        store = RecipeSpecStore::new(store, envref);
    }
    if config.get_flag("read_only")? {
        store = ReadOnlyStore::new(store);
    }
    Ok(store)
}

#[cfg(feature = "http")]
fn default_transport(_config: &StoreConfig) -> Result<Arc<dyn HttpTransport>, Error> {
    Ok(Arc::new(crate::remote::UreqTransport::new()))
}

#[cfg(not(feature = "http"))]
fn default_transport(config: &StoreConfig) -> Result<Arc<dyn HttpTransport>, Error> {
    Err(StoreConfigError::MissingOption {
        store_type: config.store_type.clone(),
        option: "transport".to_owned(),
    }
    .into())
}

pub fn create_router_from_yaml(yaml: &str) -> Result<Arc<MountPointStore>, Error> {
    StoreRouterBuilder::from_yaml(yaml)?.build()
}

pub fn create_router_from_json(json: &str) -> Result<Arc<MountPointStore>, Error> {
    StoreRouterBuilder::from_json(json)?.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquer_core::command_metadata::{ArgumentInfo, CommandMetadata};
    use liquer_core::error::ErrorType;
    use liquer_core::metadata::{Metadata, Status};
    use liquer_core::parse::parse_key;
    use liquer_core::value::Value;

    #[test]
    fn memory_stores_are_mounted() -> Result<(), Error> {
        let router = create_router_from_yaml(
            r#"
stores:
  - type: memory
  - type: memory
    prefix: tmp
"#,
        )?;
        assert_eq!(router.mount_points(), vec![parse_key("tmp")?]);
        router.set(&parse_key("tmp/x.txt")?, b"x", &Metadata::new())?;
        router.set(&parse_key("y.txt")?, b"y", &Metadata::new())?;
        let names = router.listdir(&Key::new())?;
        assert!(names.contains(&"tmp".to_owned()));
        assert!(names.contains(&"y.txt".to_owned()));
        Ok(())
    }

    #[test]
    fn read_only_filesystem() -> Result<(), Error> {
        let dir = tempfile::tempdir().map_err(|e| Error::general_error(e.to_string()))?;
        std::fs::write(dir.path().join("hello.txt"), "hello")
            .map_err(|e| Error::general_error(e.to_string()))?;
        let config = StoreConfig::new("filesystem")
            .with_prefix("data")
            .with_config("path", dir.path().to_string_lossy().to_string())
            .with_config("read_only", true);
        let mut router_config = StoreRouterConfig::new();
        router_config.add_store(config);
        let router = StoreRouterBuilder::new(router_config).build()?;
        let key = parse_key("data/hello.txt")?;
        assert_eq!(router.get_bytes(&key)?, b"hello".to_vec());
        let err = router.set(&key, b"changed", &Metadata::new()).unwrap_err();
        assert_eq!(err.error_type, ErrorType::ReadOnly);
        Ok(())
    }

    #[test]
    fn recipes_need_an_environment() -> Result<(), Error> {
        let config = StoreConfig::new("memory").with_config("recipes", true);
        assert!(create_store(&config, None, None).is_err());

        let env = Environment::new();
        let mut value = CommandMetadata::first("value");
        value.with_argument(ArgumentInfo::integer_argument("x"));
        env.register_command(value, |_, args, _| Ok(Value::I64(args.get(0, "x")?)))?;
        let store = create_store(&config, Some(&env), None)?;
        store.set(
            &parse_key("recipes.yaml")?,
            b"RECIPES:\n  - value-3/three.json\n",
            &Metadata::new(),
        )?;
        let key = parse_key("three.json")?;
        assert_eq!(store.get_metadata(&key)?.status, Status::Recipe);
        assert_eq!(store.get_bytes(&key)?, b"3".to_vec());
        Ok(())
    }

    #[test]
    fn configuration_errors() {
        assert!(create_store(&StoreConfig::new("unknown"), None, None).is_err());
        assert!(create_store(&StoreConfig::new("filesystem"), None, None).is_err());
        assert!(create_router_from_json(r#"{"stores": [{"type": "memory"}, {"type": "memory"}]}"#).is_err());
    }
}
