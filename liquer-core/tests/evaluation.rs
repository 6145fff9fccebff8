use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use liquer_core::cache::{Cache, MemoryCache};
use liquer_core::command_metadata::{ArgumentInfo, CommandMetadata};
use liquer_core::context::Environment;
use liquer_core::error::{Error, ErrorType};
use liquer_core::metadata::{LogEntryKind, Metadata, Status};
use liquer_core::parse::parse_key;
use liquer_core::query::Key;
use liquer_core::recipes::RecipeSpecStore;
use liquer_core::store::{MemoryStore, MountPointStore, Store};
use liquer_core::value::Value;

fn arithmetic() -> Result<Arc<Environment>, Error> {
    let env = Environment::new();
    let mut value = CommandMetadata::first("value");
    value.with_argument(ArgumentInfo::integer_argument("x"));
    env.register_command(value, |_, args, _| Ok(Value::I64(args.get(0, "x")?)))?;
    let mut add = CommandMetadata::new("add");
    add.with_argument(ArgumentInfo::integer_argument("y").with_default(1));
    env.register_command(add, |state, args, _| {
        Ok(Value::I64(
            state.get()?.try_into_i64()? + args.get::<i64>(0, "y")?,
        ))
    })?;
    Ok(env)
}

#[test]
fn link_parameter_is_relative_to_the_parent() -> Result<(), Error> {
    let env = arithmetic()?;
    let state = env.evaluate("value-1/add-~X~add-2~E")?;
    assert_eq!(*state.get()?, Value::I64(4));
    assert_eq!(state.metadata.commands.len(), 2);
    let link = &state.metadata.argument_queries[0];
    assert_eq!(link.resolved, "value-1/add-2");
    assert!(!link.position.is_unknown());
    Ok(())
}

#[test]
fn second_evaluation_is_a_cache_hit() -> Result<(), Error> {
    let env = Environment::new();
    let cache = Arc::new(MemoryCache::new());
    env.with_cache(cache.clone());
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    env.register_command(CommandMetadata::first("a"), move |_, _, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::I64(123))
    })?;
    assert_eq!(*env.evaluate("a")?.get()?, Value::I64(123));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(*env.evaluate("a")?.get()?, Value::I64(123));
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(cache.contains("a"));
    let cached = cache.get("a").ok_or_else(Error::not_available)?;
    assert_eq!(*cached.get()?, Value::I64(123));
    Ok(())
}

#[test]
fn failure_becomes_an_error_state() -> Result<(), Error> {
    let env = Environment::new();
    let cache = Arc::new(MemoryCache::new());
    env.with_cache(cache.clone());
    env.register_command(CommandMetadata::first("fail"), |_, _, _| {
        Err(Error::execution_error("Failed on purpose".to_owned()))
    })?;
    let state = env.evaluate("fail")?;
    assert!(state.is_error());
    assert_eq!(state.status(), Status::Error);
    let error = state.get().unwrap_err();
    assert_eq!(error.error_type, ErrorType::ExecutionError);
    assert!(!error.traceback.is_empty());
    assert!(state
        .metadata
        .log
        .iter()
        .any(|entry| entry.kind == LogEntryKind::Error && entry.traceback.is_some()));
    assert!(cache.get("fail").is_none());
    let metadata = cache.get_metadata("fail").ok_or_else(Error::not_available)?;
    assert!(metadata.is_error);
    Ok(())
}

#[test]
fn resource_feeds_a_pipeline() -> Result<(), Error> {
    let env = Environment::new();
    let store = Arc::new(MemoryStore::default());
    store.set(&parse_key("a/b")?, b"hello", &Metadata::new())?;
    env.with_store(store);
    env.register_command(CommandMetadata::new("world"), |state, _, _| {
        let bytes = state.get()?.try_as_bytes()?.to_vec();
        let text = String::from_utf8(bytes)
            .map_err(|e| Error::conversion_error_with_message("bytes", "text", &e.to_string()))?;
        Ok(Value::from(format!("{} world", text)))
    })?;
    let state = env.evaluate("-R/a/b/-/world")?;
    assert_eq!(*state.get()?, Value::new("hello world"));
    assert_eq!(state.status(), Status::Ready);
    let resource = state
        .metadata
        .resource_metadata
        .as_ref()
        .ok_or_else(Error::not_available)?;
    assert_eq!(resource.key.as_deref(), Some("a/b"));
    Ok(())
}

#[test]
fn recipe_is_materialized_on_read() -> Result<(), Error> {
    let env = arithmetic()?;
    let substore = Arc::new(MemoryStore::default());
    substore.set(
        &parse_key("dir/recipes.yaml")?,
        br#"{"RECIPES": [{"query": "value-41/add", "filename": "out.txt"}]}"#,
        &Metadata::new(),
    )?;
    let store = RecipeSpecStore::new(substore.clone(), &env);
    env.with_store(store.clone());
    let out = parse_key("dir/out.txt")?;
    assert_eq!(store.get_metadata(&out)?.status, Status::Recipe);
    assert_eq!(store.get_bytes(&out)?, b"42".to_vec());
    assert_eq!(store.get_metadata(&out)?.status, Status::Ready);
    let status = substore.get_bytes(&parse_key("dir/recipes_status.txt")?)?;
    assert!(String::from_utf8_lossy(&status).contains("out.txt"));
    Ok(())
}

#[test]
fn mount_points_route_by_prefix() -> Result<(), Error> {
    let default_store = Arc::new(MemoryStore::default());
    let mounted = Arc::new(MemoryStore::default());
    let store = MountPointStore::new(Some(default_store.clone()));
    store.mount(&parse_key("a")?, mounted.clone())?;
    store.set(&parse_key("a/x")?, b"1", &Metadata::new())?;
    store.set(&parse_key("c/y")?, b"2", &Metadata::new())?;

    assert_eq!(mounted.get_bytes(&parse_key("x")?)?, b"1".to_vec());
    assert!(!default_store.contains(&parse_key("a/x")?)?);
    assert_eq!(default_store.get_bytes(&parse_key("c/y")?)?, b"2".to_vec());

    let names = store.listdir(&Key::new())?;
    assert!(names.contains(&"a".to_owned()));
    assert!(names.contains(&"c".to_owned()));
    let keys = store.keys()?;
    assert!(keys.contains(&parse_key("a/x")?));

    store.umount(&parse_key("a")?)?;
    assert!(!store.contains(&parse_key("a/x")?)?);
    assert_eq!(store.get_bytes(&parse_key("c/y")?)?, b"2".to_vec());
    Ok(())
}

#[test]
fn changed_command_version_collides_with_cache() -> Result<(), Error> {
    let env = arithmetic()?;
    env.with_cache(Arc::new(MemoryCache::new()));
    env.evaluate("value-1/add")?;
    let mut add = CommandMetadata::new("add");
    add.with_argument(ArgumentInfo::integer_argument("y").with_default(1))
        .modify_command()
        .with_version("another implementation");
    env.register_command(add, |_, _, _| Ok(Value::I64(0)))?;
    let err = env.evaluate("value-1/add").unwrap_err();
    assert_eq!(err.error_type, ErrorType::VersionCollision);
    Ok(())
}

#[test]
fn boolean_parameters_accept_only_yes_words() -> Result<(), Error> {
    let env = Environment::new();
    let mut flag = CommandMetadata::first("flag");
    flag.with_argument(ArgumentInfo::boolean_argument("b"));
    env.register_command(flag, |_, args, _| Ok(Value::Bool(args.get(0, "b")?)))?;
    assert_eq!(*env.evaluate("flag-yes")?.get()?, Value::Bool(true));
    assert_eq!(*env.evaluate("flag-T")?.get()?, Value::Bool(true));
    assert_eq!(*env.evaluate("flag-1")?.get()?, Value::Bool(false));
    assert_eq!(*env.evaluate("flag-off")?.get()?, Value::Bool(false));
    Ok(())
}
