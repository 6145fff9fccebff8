//! Built-in presets and command packs selected by the configuration.
//!
//! `setup.preset` chooses how the store and cache are set up,
//! `setup.modules` chooses which command packs are registered.

use std::path::Path;
use std::sync::Arc;

use liquer_core::command_metadata::{ArgumentInfo, CommandMetadata};
use liquer_core::commands::Command;
use liquer_core::config::Config;
use liquer_core::context::Environment;
use liquer_core::error::Error;
use liquer_core::pool::{Pool, PoolMode};
use liquer_core::value::Value;
use liquer_store::{StoreConfig, StoreRouterBuilder, StoreRouterConfig};

pub const MODULES: [&str; 2] = ["core", "text"];

/// Commands of a built-in module
pub fn module_commands(module: &str) -> Result<Vec<Command>, Error> {
    match module {
        "core" => Ok(core_commands()),
        "text" => Ok(text_commands()),
        other => Err(Error::configuration_error(format!(
            "Unknown module '{}', available modules: {}",
            other,
            MODULES.join(", ")
        ))),
    }
}

pub fn register_module(env: &Environment, module: &str) -> Result<(), Error> {
    for command in module_commands(module)? {
        env.register_command_object(command)?;
    }
    tracing::debug!(%module, "module registered");
    Ok(())
}

fn core_commands() -> Vec<Command> {
    let mut value = CommandMetadata::first("value");
    value
        .with_module("core")
        .with_doc("Integer value")
        .with_argument(ArgumentInfo::integer_argument("x"));

    let mut add = CommandMetadata::new("add");
    add.with_module("core")
        .with_doc("Add a number to the input")
        .with_argument(ArgumentInfo::integer_argument("y").with_default(1));

    let mut text = CommandMetadata::first("text");
    text.with_module("core")
        .with_doc("Text given as the argument")
        .with_argument(ArgumentInfo::string_argument("t"));

    let mut filename = CommandMetadata::new("filename");
    filename
        .with_module("core")
        .with_doc("Pass the input through under a new filename")
        .with_argument(ArgumentInfo::string_argument("name"));

    let mut fail = CommandMetadata::first("fail");
    fail.with_module("core")
        .with_doc("Always fails")
        .with_argument(ArgumentInfo::string_argument("message").with_default("Failed on purpose"));

    vec![
        Command::new(value, |_, args, _| Ok(Value::I64(args.get(0, "x")?))),
        Command::new(add, |state, args, _| {
            Ok(Value::I64(
                state.get()?.try_into_i64()? + args.get::<i64>(0, "y")?,
            ))
        }),
        Command::new(text, |_, args, _| Ok(Value::from(args.get::<String>(0, "t")?))),
        Command::new(filename, |state, args, context| {
            let name: String = args.get(0, "name")?;
            context.set_filename(&name);
            Ok(state.get()?.clone())
        }),
        Command::new(fail, |_, args, _| {
            Err(Error::execution_error(args.get::<String>(0, "message")?))
        }),
    ]
}

fn text_commands() -> Vec<Command> {
    let mut upper = CommandMetadata::new("upper");
    upper.with_module("text").with_doc("Upper case");
    let mut lower = CommandMetadata::new("lower");
    lower.with_module("text").with_doc("Lower case");
    let mut length = CommandMetadata::new("length");
    length.with_module("text").with_doc("Number of characters");
    let mut expand = CommandMetadata::new("expand");
    expand
        .with_module("text")
        .with_doc("Expand $query$ placeholders in the input text");

    vec![
        Command::new(upper, |state, _, _| {
            Ok(Value::from(state.get()?.try_into_string()?.to_uppercase()))
        }),
        Command::new(lower, |state, _, _| {
            Ok(Value::from(state.get()?.try_into_string()?.to_lowercase()))
        }),
        Command::new(length, |state, _, _| {
            Ok(Value::I64(state.get()?.try_into_string()?.chars().count() as i64))
        }),
        Command::new(expand, |state, _, context| {
            let template = state.get()?.try_into_string()?;
            Ok(Value::from(context.evaluate_template(&template)?))
        }),
    ]
}

/// Store configuration of a preset, used when the configuration has no `stores` section
fn preset_stores(config: &Config) -> Result<StoreRouterConfig, Error> {
    let mut stores = StoreRouterConfig::new();
    match config.setup.preset.as_str() {
        "default" | "memory" => {
            stores.add_store(StoreConfig::new("memory"));
        }
        "file" => {
            stores.add_store(StoreConfig::new("filesystem").with_config("path", "."));
        }
        other => {
            return Err(Error::configuration_error(format!(
                "Unknown preset '{}'",
                other
            )))
        }
    }
    for folder in config.setup.recipe_folders.iter() {
        let name = Path::new(folder)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| folder.clone());
        stores.add_store(
            StoreConfig::new("filesystem")
                .with_prefix(&name)
                .with_config("path", folder.as_str())
                .with_config("recipes", true),
        );
    }
    Ok(stores)
}

/// Set up an environment according to the configuration
pub fn create_environment(config: &Config) -> Result<Arc<Environment>, Error> {
    let mut config = config.clone();
    match config.setup.preset.as_str() {
        "memory" if config.setup.cache == "off" => config.setup.cache = "memory".to_owned(),
        "file" if config.setup.cache == "off" => config.setup.cache = "file".to_owned(),
        _ => {}
    }

    let env = Environment::new();
    if config.setup.modules.is_empty() {
        register_module(&env, "core")?;
    } else {
        for module in config.setup.modules.iter() {
            register_module(&env, module)?;
        }
    }

    let cache = config.create_cache(env.get_state_types())?;
    env.with_cache(cache);

    let stores = match config.extra.get("stores") {
        Some(stores) => serde_json::from_value::<StoreRouterConfig>(serde_json::json!({
            "stores": stores
        }))
        .map_err(|e| Error::configuration_error(format!("Invalid stores configuration: {}", e)))?,
        None => preset_stores(&config)?,
    };
    let store = StoreRouterBuilder::new(stores)
        .with_environment(env.clone())
        .build()?;
    env.with_store(store);

    tracing::info!(
        preset = %config.setup.preset,
        cache = %env.get_cache().cache_name(),
        "environment created"
    );
    Ok(env)
}

/// Pool according to `setup.cache_concurrency`; `off` means no pool
pub fn create_pool(config: &Config, envref: Arc<Environment>) -> Result<Option<Pool>, Error> {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    match config.setup.cache_concurrency.as_str() {
        "off" | "" => Ok(None),
        "central" => Ok(Some(Pool::new(envref, workers, PoolMode::Central)?)),
        "local" => {
            let config = config.clone();
            let state_types = envref.get_state_types();
            let factory = Arc::new(move || config.create_cache(state_types.clone()));
            Ok(Some(Pool::new(envref, workers, PoolMode::Local(factory))?))
        }
        other => Err(Error::configuration_error(format!(
            "Unknown cache concurrency '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquer_core::error::ErrorType;
    use liquer_core::metadata::Status;

    fn config(yaml: &str) -> Result<Config, Error> {
        Config::from_yaml(yaml)
    }

    #[test]
    fn default_environment_has_core_commands() -> Result<(), Error> {
        let env = create_environment(&Config::new())?;
        let state = env.evaluate("value-1/add-2/add")?;
        assert_eq!(*state.get()?, Value::I64(4));
        assert!(env.evaluate("text-hello/upper")?.is_error());
        Ok(())
    }

    #[test]
    fn text_module() -> Result<(), Error> {
        let env = create_environment(&config("setup:\n  modules: [core, text]\n")?)?;
        let state = env.evaluate("text-hello/upper")?;
        assert_eq!(state.get()?.try_into_string()?, "HELLO");
        let state = env.evaluate("text-Hello/length")?;
        assert_eq!(*state.get()?, Value::I64(5));
        Ok(())
    }

    #[test]
    fn unknown_names_are_rejected() -> Result<(), Error> {
        let err = create_environment(&config("setup:\n  modules: [plotting]\n")?).err().unwrap();
        assert_eq!(err.error_type, ErrorType::ConfigurationError);
        let err = create_environment(&config("setup:\n  preset: cloud\n")?).err().unwrap();
        assert_eq!(err.error_type, ErrorType::ConfigurationError);
        assert!(create_pool(&config("setup:\n  cache_concurrency: distributed\n")?, Environment::new()).is_err());
        Ok(())
    }

    #[test]
    fn memory_preset_caches() -> Result<(), Error> {
        let env = create_environment(&config("setup:\n  preset: memory\n")?)?;
        env.evaluate("value-5")?;
        assert!(env.get_cache().contains("value-5"));
        Ok(())
    }

    #[test]
    fn recipe_folders_are_mounted() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let folder = dir.path().join("reports");
        std::fs::create_dir_all(&folder)?;
        std::fs::write(folder.join("recipes.yaml"), "RECIPES:\n  - value-7/seven.json\n")?;
        let mut config = Config::new();
        config.setup.recipe_folders = vec![folder.to_string_lossy().to_string()];
        let env = create_environment(&config)?;
        let store = env.get_store();
        let key = liquer_core::parse::parse_key("reports/seven.json")?;
        assert_eq!(store.get_metadata(&key)?.status, Status::Recipe);
        assert_eq!(store.get_bytes(&key)?, b"7".to_vec());
        Ok(())
    }

    #[test]
    fn stores_section_overrides_preset() -> Result<(), Error> {
        let env = create_environment(&config(
            "setup:\n  preset: memory\nstores:\n  - type: memory\n  - type: memory\n    prefix: tmp\n",
        )?)?;
        let store = env.get_store();
        let key = liquer_core::parse::parse_key("tmp/a.txt")?;
        store.set(&key, b"a", &liquer_core::metadata::Metadata::new())?;
        assert!(store.contains(&key)?);
        Ok(())
    }

    #[test]
    fn central_pool() -> Result<(), Error> {
        let config = config("setup:\n  cache: memory\n  cache_concurrency: central\n")?;
        let env = create_environment(&config)?;
        let pool = create_pool(&config, env.clone())?;
        let pool = pool.ok_or_else(|| Error::general_error("no pool".to_owned()))?;
        assert_eq!(*pool.evaluate("value-2/add")?.get()?, Value::I64(3));
        Ok(())
    }
}
