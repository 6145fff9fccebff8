#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value as JsonValue;

use crate::context::Environment;
use crate::error::Error;
use crate::metadata::{Metadata, Status};
use crate::parse::{parse_key, parse_query};
use crate::query::{Key, ResourceName};
use crate::store::{forward_event, key_name, link_parent, ParentLink, Store, StoreEvent};

/// File with recipe definitions, searched in the whole tree of the substore
pub const RECIPES_FILE: &str = "recipes.yaml";
/// Directory name meaning "the directory of the recipes file"
pub const LOCAL_RECIPES: &str = "RECIPES";
/// Per-directory summary of recipe states
pub const STATUS_FILE: &str = "recipes_status.txt";

fn default_recipe_type() -> String {
    "query".to_owned()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Resolved definition of a recipe.
/// Fields not known to the recipe kind are kept in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RecipeDefinition {
    #[serde(rename = "type", default = "default_recipe_type")]
    pub recipe_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub original_query: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provides: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipe_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipes_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub recipes_directory: String,
    #[serde(rename = "CWD", default, skip_serializing_if = "String::is_empty")]
    pub cwd: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub volatile: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl RecipeDefinition {
    /// Definition of a query recipe
    pub fn query(query: &str, filename: &str) -> Self {
        RecipeDefinition {
            recipe_type: default_recipe_type(),
            query: query.to_owned(),
            original_query: query.to_owned(),
            filename: filename.to_owned(),
            provides: vec![filename.to_owned()],
            ..Default::default()
        }
    }

    /// Version of the definition: MD5 of its JSON with sorted keys
    pub fn version(&self) -> String {
        let text = serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default();
        format!("md5:{:x}", md5::compute(text.as_bytes()))
    }
}

/// Recipe declares how to produce a resource at a store key
pub trait Recipe: Send + Sync {
    fn definition(&self) -> &RecipeDefinition;

    fn recipe_type(&self) -> String {
        self.definition().recipe_type.clone()
    }

    fn recipe_name(&self) -> String {
        self.definition().recipe_name.clone()
    }

    /// Names of the files created by the recipe
    fn provides(&self) -> Vec<String> {
        self.definition().provides.clone()
    }

    fn title(&self) -> String {
        self.definition().title.clone()
    }

    fn description(&self) -> String {
        self.definition().description.clone()
    }

    fn version(&self) -> String {
        self.definition().version()
    }

    fn is_volatile(&self) -> bool {
        self.definition().volatile
    }

    /// Metadata describing the resource before it is made
    fn metadata(&self, key: &Key) -> Metadata {
        let definition = self.definition();
        let mut metadata = Metadata::new();
        metadata.with_key(&key.encode());
        metadata.title = definition.title.clone();
        metadata.description = definition.description.clone();
        metadata
            .extra
            .insert("recipes_key".to_owned(), definition.recipes_key.clone().into());
        metadata.extra.insert(
            "recipes_directory".to_owned(),
            definition.recipes_directory.clone().into(),
        );
        metadata
            .extra
            .insert("recipe_name".to_owned(), definition.recipe_name.clone().into());
        metadata
            .extra
            .insert("has_recipe".to_owned(), JsonValue::Bool(true));
        if !definition.query.is_empty() {
            metadata.with_query(&definition.query);
        }
        metadata.set_status(Status::Recipe);
        metadata
    }

    /// Create the resource and write it under `key` into `store`
    fn make(&self, key: &Key, store: &dyn Store, envref: &Arc<Environment>) -> Result<(), Error>;
}

/// Recipe evaluating a query
pub struct QueryRecipe {
    definition: RecipeDefinition,
}

impl QueryRecipe {
    pub fn new(definition: RecipeDefinition) -> Result<Self, Error> {
        if definition.recipe_type != "query" {
            return Err(Error::general_error(format!(
                "Query recipe received a definition of type '{}'",
                definition.recipe_type
            )));
        }
        parse_query(&definition.query)?;
        Ok(QueryRecipe { definition })
    }
}

impl Recipe for QueryRecipe {
    fn definition(&self) -> &RecipeDefinition {
        &self.definition
    }

    fn make(&self, key: &Key, store: &dyn Store, envref: &Arc<Environment>) -> Result<(), Error> {
        let query = &self.definition.query;
        tracing::info!(%key, %query, "making recipe");
        let state = envref.evaluate(query)?;
        if state.is_error() {
            state.metadata.error_result()?;
            return Err(Error::execution_error(state.metadata.message.clone()).with_key(key));
        }
        let extension = key.extension();
        let state_types = envref.get_state_types();
        let (bytes, mimetype, type_identifier) =
            match state_types.encode(&state.data, extension.as_deref()) {
                Ok(encoded) => encoded,
                Err(_) => state_types.encode(&state.data, None)?,
            };
        let mut metadata = state.metadata.clone();
        metadata.mimetype = Some(mimetype);
        metadata.with_type_identifier(&type_identifier);
        metadata.set_status(Status::Ready);
        store.set(key, &bytes, &metadata)
    }
}

pub type RecipeFactory =
    Arc<dyn Fn(RecipeDefinition) -> Result<Arc<dyn Recipe>, Error> + Send + Sync>;

/// Registry of recipe kinds
#[derive(Clone)]
pub struct RecipeRegistry {
    factories: HashMap<String, RecipeFactory>,
}

impl Default for RecipeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RecipeRegistry {
    /// Registry with the query recipe
    pub fn new() -> Self {
        let mut registry = RecipeRegistry {
            factories: HashMap::new(),
        };
        registry.register("query", |definition| {
            Ok(Arc::new(QueryRecipe::new(definition)?) as Arc<dyn Recipe>)
        });
        registry
    }

    pub fn register<F>(&mut self, recipe_type: &str, factory: F) -> &mut Self
    where
        F: Fn(RecipeDefinition) -> Result<Arc<dyn Recipe>, Error> + Send + Sync + 'static,
    {
        self.factories
            .insert(recipe_type.to_owned(), Arc::new(factory));
        self
    }

    pub fn contains(&self, recipe_type: &str) -> bool {
        self.factories.contains_key(recipe_type)
    }

    pub fn from_definition(&self, definition: RecipeDefinition) -> Result<Arc<dyn Recipe>, Error> {
        let factory = self.factories.get(&definition.recipe_type).ok_or_else(|| {
            Error::not_supported(format!(
                "Unsupported recipe type '{}'",
                definition.recipe_type
            ))
        })?;
        factory(definition)
    }

    /// Turn a raw definition from a recipes file into a resolved definition.
    /// A string is a query; queries are made absolute against the directory.
    pub fn resolve_definition(
        &self,
        raw: &JsonValue,
        directory: &Key,
    ) -> Result<RecipeDefinition, Error> {
        match raw {
            JsonValue::String(text) => {
                let query = parse_query(text)?.to_absolute(directory);
                let filename = query
                    .filename()
                    .map(|f| f.name)
                    .unwrap_or_else(|| "data.json".to_owned());
                let mut definition = RecipeDefinition::query(&query.encode(), &filename);
                definition.original_query = text.clone();
                definition.title = filename;
                definition.cwd = directory.encode();
                Ok(definition)
            }
            JsonValue::Object(_) => {
                let mut definition: RecipeDefinition = serde_json::from_value(raw.clone())
                    .map_err(|e| Error::general_error(format!("Invalid recipe definition: {}", e)))?;
                if definition.recipe_type == "query" {
                    if definition.query.is_empty() {
                        return Err(Error::general_error(
                            "Query recipe without a query".to_owned(),
                        ));
                    }
                    let query = parse_query(&definition.query)?.to_absolute(directory);
                    definition.original_query = definition.query.clone();
                    if definition.filename.is_empty() {
                        definition.filename = query
                            .filename()
                            .map(|f| f.name)
                            .unwrap_or_else(|| "data.json".to_owned());
                    }
                    if definition.title.is_empty() {
                        definition.title = definition.filename.clone();
                    }
                    if definition.description.is_empty() {
                        definition.description =
                            format!("Generated from query: {}", definition.original_query);
                    }
                    definition.query = query.encode();
                    definition.cwd = directory.encode();
                } else if !self.contains(&definition.recipe_type) {
                    return Err(Error::not_supported(format!(
                        "Unsupported recipe type '{}'",
                        definition.recipe_type
                    )));
                }
                if definition.provides.is_empty() && !definition.filename.is_empty() {
                    definition.provides = vec![definition.filename.clone()];
                }
                Ok(definition)
            }
            _ => Err(Error::general_error(format!(
                "Unsupported recipe definition: {}",
                raw
            ))),
        }
    }
}

type RecipeMap = HashMap<Key, Arc<dyn Recipe>>;

/// Keys with an element starting with a dot are invisible to recipe stores
pub fn is_ignored(key: &Key) -> bool {
    key.iter().any(|name| name.name.starts_with('.'))
}

fn concat_keys(a: &Key, b: &Key) -> Key {
    let mut names = a.0.clone();
    names.extend(b.0.iter().cloned());
    Key(names)
}

fn format_time(timestamp: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(timestamp)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Store exposing resources declared in `recipes.yaml` files of the substore.
///
/// A `recipes.yaml` is a map from a directory (relative to the file) to a list of recipe definitions.
/// Resources are made lazily on the first read of their data; until then their metadata
/// has the status `recipe`. Every directory containing recipes gets a `recipes_status.txt` summary,
/// regenerated when anything in the directory changes.
/// Changes of the substore, including made resources and status files, are forwarded
/// to the store wrapping the recipe store.
pub struct RecipeSpecStore {
    substore: Arc<dyn Store>,
    envref: Weak<Environment>,
    recipes: Mutex<Option<Arc<RecipeMap>>>,
    parent: ParentLink,
}

impl RecipeSpecStore {
    pub fn new(substore: Arc<dyn Store>, envref: &Arc<Environment>) -> Arc<Self> {
        let store = Arc::new_cyclic(|me| {
            link_parent(me, substore.as_ref());
            RecipeSpecStore {
                substore,
                envref: Arc::downgrade(envref),
                recipes: Mutex::new(None),
                parent: ParentLink::default(),
            }
        });
        store.update_all_status_files();
        store
    }

    pub fn substore(&self) -> &Arc<dyn Store> {
        &self.substore
    }

    fn environment(&self) -> Result<Arc<Environment>, Error> {
        self.envref.upgrade().ok_or_else(|| {
            Error::general_error("Environment of the recipe store is gone".to_owned())
        })
    }

    /// Drop the recipe map, it is reloaded on the next access
    pub fn invalidate(&self) {
        if let Ok(mut recipes) = self.recipes.lock() {
            *recipes = None;
        }
    }

    /// Reload the recipes and regenerate all status files
    pub fn sync(&self) {
        self.invalidate();
        self.update_all_status_files();
    }

    pub fn recipes(&self) -> Arc<RecipeMap> {
        if let Ok(recipes) = self.recipes.lock() {
            if let Some(map) = recipes.as_ref() {
                return map.clone();
            }
        }
        let map = Arc::new(self.load_recipes());
        if let Ok(mut recipes) = self.recipes.lock() {
            *recipes = Some(map.clone());
        }
        map
    }

    /// Keys of all recipes, sorted
    pub fn recipe_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.recipes().keys().cloned().collect();
        keys.sort_by_key(|k| k.encode());
        keys
    }

    pub fn recipe(&self, key: &Key) -> Option<Arc<dyn Recipe>> {
        self.recipes().get(key).cloned()
    }

    fn load_recipes(&self) -> RecipeMap {
        let mut map = RecipeMap::new();
        let registry = match self.environment() {
            Ok(envref) => envref.get_recipe_registry(),
            Err(_) => Arc::new(RecipeRegistry::new()),
        };
        let keys = match self.substore.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(store = %self.substore.store_name(), error = %e, "can't list recipe files");
                return map;
            }
        };
        for recipes_key in keys.into_iter() {
            if key_name(&recipes_key) != RECIPES_FILE || is_ignored(&recipes_key) {
                continue;
            }
            if self.substore.is_dir(&recipes_key).unwrap_or(true) {
                continue;
            }
            if let Err(e) = self.load_recipes_file(&recipes_key, &registry, &mut map) {
                tracing::warn!(key = %recipes_key, error = %e, "invalid recipes file");
            }
        }
        map
    }

    fn load_recipes_file(
        &self,
        recipes_key: &Key,
        registry: &RecipeRegistry,
        map: &mut RecipeMap,
    ) -> Result<(), Error> {
        let bytes = self.substore.get_bytes(recipes_key)?;
        let spec: BTreeMap<String, Vec<JsonValue>> = serde_yaml::from_slice(&bytes)
            .map_err(|e| Error::key_read_error(recipes_key, &self.store_name(), &e))?;
        let parent = recipes_key.parent();
        for (directory, items) in spec.iter() {
            let directory_key = if directory == LOCAL_RECIPES {
                parent.clone()
            } else {
                concat_keys(&parent, &parse_key(directory)?)
            };
            for (index, raw) in items.iter().enumerate() {
                let mut definition = match registry.resolve_definition(raw, &directory_key) {
                    Ok(definition) => definition,
                    Err(e) => {
                        tracing::warn!(key = %recipes_key, %directory, index, error = %e, "recipe skipped");
                        continue;
                    }
                };
                let filename = definition.filename.clone();
                definition.recipes_key = recipes_key.encode();
                definition.recipes_directory = directory.clone();
                definition.recipe_name = format!(
                    "{}/-Ryaml/{}/{}#{}",
                    recipes_key.encode(),
                    directory,
                    index,
                    filename
                );
                match registry.from_definition(definition) {
                    Ok(recipe) => {
                        for name in recipe.provides() {
                            let key = directory_key.join(&name);
                            if !is_ignored(&key) {
                                map.insert(key, recipe.clone());
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(key = %recipes_key, %directory, index, error = %e, "recipe skipped")
                    }
                }
            }
        }
        Ok(())
    }

    /// Metadata of a recipe which has not been made yet
    pub fn recipe_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        let recipe = self.recipe(key).ok_or_else(|| Error::key_not_found(key))?;
        Ok(recipe.metadata(key))
    }

    /// Make the resource by its recipe and store it in the substore
    pub fn make(&self, key: &Key) -> Result<(), Error> {
        if is_ignored(key) {
            return Err(Error::key_not_supported(key, &self.store_name()));
        }
        let recipe = self.recipe(key).ok_or_else(|| Error::key_not_found(key))?;
        let envref = self.environment()?;
        let result = recipe.make(key, self.substore.as_ref(), &envref);

        let mut metadata = match (&result, self.substore.get_metadata(key)) {
            (Ok(_), Ok(metadata)) => metadata,
            _ => recipe.metadata(key),
        };
        let recipe_metadata = recipe.metadata(key);
        if metadata.title.is_empty() {
            metadata.title = recipe_metadata.title.clone();
        }
        if metadata.description.is_empty() {
            metadata.description = recipe_metadata.description.clone();
        }
        for (name, value) in recipe_metadata.extra.iter() {
            metadata.extra.insert(name.clone(), value.clone());
        }
        metadata
            .dependencies
            .add_recipe_dependency(&recipe.recipe_name(), &recipe.version(), false)?;
        match &result {
            Ok(_) => {
                if matches!(metadata.status, Status::None | Status::Recipe) {
                    metadata.set_status(Status::Ready);
                }
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "recipe failed");
                metadata.with_error(e);
            }
        }
        self.substore.set_metadata(key, &metadata)?;
        result
    }

    fn status_line(&self, key: &Key, name: &str) -> String {
        let metadata = match self.get_metadata(key) {
            Ok(metadata) => metadata,
            Err(_) => return format!("{:<14} {:<30} {}\n", "MISSING", name, "Missing metadata"),
        };
        let time = metadata
            .created
            .as_deref()
            .or(metadata.updated.as_deref())
            .map(format_time)
            .unwrap_or_default();
        let status = metadata.status.as_str();
        let mut message = metadata.message.trim().to_owned();
        if metadata.status == Status::Ready {
            if let Some(dc) = &metadata.data_characteristics {
                if !dc.description.is_empty() {
                    message = dc.description.clone();
                }
            }
        }
        let mut text = if message.contains('\n') {
            format!(
                "{:<20} {:<14} {:<32}|\n{}\n{}\n{}\n\n",
                time,
                status,
                name,
                "=".repeat(61),
                message,
                "=".repeat(61)
            )
        } else {
            format!("{:<20} {:<14} {:<32}| {}\n", time, status, name, message)
        };
        let last_error = metadata
            .log
            .iter()
            .chain(metadata.child_log.iter())
            .filter(|entry| entry.is_error())
            .last();
        if let Some(entry) = last_error {
            text.push_str(&format!(
                "    {} {}",
                entry.origin.as_deref().unwrap_or(""),
                entry.message
            ));
            if let Some(traceback) = &entry.traceback {
                text.push('\n');
                text.push_str(traceback);
            }
            text.push('\n');
        }
        text
    }

    /// Summary of the files in a directory
    pub fn status_text(&self, directory: &Key) -> Result<String, Error> {
        let mut text = String::new();
        for name in self.listdir(directory)? {
            if name == STATUS_FILE {
                continue;
            }
            let key = directory.join(&name);
            if self.is_dir(&key)? {
                continue;
            }
            text.push_str(&self.status_line(&key, &name));
        }
        Ok(text)
    }

    fn create_status(&self, key: &Key) {
        if key_name(key) == STATUS_FILE {
            return;
        }
        let directory = match self.is_dir(key) {
            Ok(true) => key.clone(),
            _ => key.parent(),
        };
        let text = match self.status_text(&directory) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(%directory, error = %e, "status not created");
                return;
            }
        };
        let mut metadata = Metadata::new();
        metadata.with_type_identifier("text");
        metadata.set_status(Status::SideEffect);
        metadata.title = format!("Status of '{}'", directory.encode());
        metadata.description = "This file is generated automatically by the recipe store".to_owned();
        let status_key = directory.join(STATUS_FILE);
        if let Err(e) = self.substore.set(&status_key, text.as_bytes(), &metadata) {
            tracing::warn!(key = %status_key, error = %e, "status not written");
        }
    }

    /// Regenerate the status of every directory containing recipes
    pub fn update_all_status_files(&self) {
        let directories: BTreeMap<String, Key> = self
            .recipes()
            .keys()
            .map(|k| (k.parent().encode(), k.parent()))
            .collect();
        for directory in directories.values() {
            self.create_status(directory);
        }
    }

    /// A changed recipes file reloads the recipes, any other change refreshes the directory status
    fn on_substore_change(&self, event: &StoreEvent) {
        forward_event(self, event);
        let key = event.key();
        if key_name(key) == RECIPES_FILE {
            self.sync();
        } else {
            self.create_status(key);
        }
    }

    fn is_recipe_dir(&self, key: &Key) -> bool {
        self.recipes()
            .keys()
            .any(|k| k.len() > key.len() && k.has_key_prefix(key))
    }
}

impl Store for RecipeSpecStore {
    fn store_name(&self) -> String {
        format!("Recipe store on {}", self.substore.store_name())
    }

    fn key_prefix(&self) -> Key {
        self.substore.key_prefix()
    }

    crate::parent_link_accessors!();

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        if is_ignored(key) {
            return Err(Error::key_not_found(key));
        }
        if self.substore.contains(key)? && !self.substore.is_dir(key)? {
            if let Ok(bytes) = self.substore.get_bytes(key) {
                return Ok(bytes);
            }
        }
        if self.recipe(key).is_some() {
            self.make(key)?;
        }
        self.substore.get_bytes(key)
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        if is_ignored(key) {
            return Err(Error::key_not_found(key));
        }
        if let Ok(metadata) = self.substore.get_metadata(key) {
            return Ok(metadata);
        }
        if self.is_dir(key)? {
            return Ok(self.finalize_metadata(self.default_metadata(key, true), key, true, None, false));
        }
        let metadata = self.recipe_metadata(key)?;
        Ok(self.finalize_metadata(metadata, key, false, None, false))
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        if is_ignored(key) {
            return Err(Error::key_not_supported(key, &self.store_name()));
        }
        self.substore.set(key, data, metadata)
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        if is_ignored(key) {
            return Err(Error::key_not_supported(key, &self.store_name()));
        }
        self.substore.set_metadata(key, metadata)
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.substore.remove(key)
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.substore.removedir(key)
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        if is_ignored(key) {
            return Ok(false);
        }
        Ok(self.substore.contains(key)?
            || self.recipes().contains_key(key)
            || self.is_recipe_dir(key))
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        if is_ignored(key) {
            return Ok(false);
        }
        Ok(self.substore.is_dir(key)? || self.is_recipe_dir(key))
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        let mut keys: HashMap<String, Key> = HashMap::new();
        for key in self.substore.keys()? {
            if !is_ignored(&key) {
                keys.insert(key.encode(), key);
            }
        }
        for key in self.recipes().keys() {
            for i in 1..key.len() {
                let directory = Key(key.0[..i].to_vec());
                keys.insert(directory.encode(), directory);
            }
            keys.insert(key.encode(), key.clone());
        }
        let mut keys: Vec<(String, Key)> = keys.into_iter().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        let in_substore = self.substore.is_dir(key)?;
        let mut names: BTreeSet<String> = BTreeSet::new();
        if in_substore {
            names.extend(self.substore.listdir(key)?);
        }
        let mut in_recipes = false;
        for recipe_key in self.recipes().keys() {
            if recipe_key.len() > key.len() && recipe_key.has_key_prefix(key) {
                in_recipes = true;
                names.insert(recipe_key[key.len()].name.clone());
            }
        }
        if !in_substore && !in_recipes {
            return self.substore.listdir(key);
        }
        Ok(names.into_iter().filter(|name| !name.starts_with('.')).collect())
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.substore.makedir(key)
    }

    fn is_supported(&self, key: &Key) -> bool {
        !is_ignored(key) && self.substore.is_supported(key)
    }

    fn on_data_changed(&self, key: &Key) {
        self.on_substore_change(&StoreEvent::DataChanged(key.clone()));
    }

    fn on_metadata_changed(&self, key: &Key) {
        self.on_substore_change(&StoreEvent::MetadataChanged(key.clone()));
    }

    fn on_removed(&self, key: &Key) {
        self.on_substore_change(&StoreEvent::Removed(key.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_metadata::{ArgumentInfo, CommandMetadata};
    use crate::store::{MemoryStore, MountPointStore, ObservableStore};
    use crate::value::Value;

    fn environment() -> Result<Arc<Environment>, Error> {
        let env = Environment::new();
        let mut value = CommandMetadata::first("value");
        value.with_argument(ArgumentInfo::integer_argument("x"));
        env.register_command(value, |_, args, _| Ok(Value::I64(args.get(0, "x")?)))?;
        let mut fail = CommandMetadata::first("fail");
        fail.with_doc("always fails");
        env.register_command(fail, |_, _, _| {
            Err(Error::execution_error("Failed on purpose".to_owned()))
        })?;
        Ok(env)
    }

    fn recipe_store(yaml: &str) -> Result<(Arc<Environment>, Arc<RecipeSpecStore>), Error> {
        let env = environment()?;
        let substore = Arc::new(MemoryStore::default());
        substore.set(&parse_key("dir/recipes.yaml")?, yaml.as_bytes(), &Metadata::new())?;
        let store = RecipeSpecStore::new(substore, &env);
        env.with_store(store.clone());
        Ok((env, store))
    }

    #[test]
    fn resolve_string_definition() -> Result<(), Error> {
        let registry = RecipeRegistry::new();
        let definition =
            registry.resolve_definition(&JsonValue::from("value-1/x.json"), &parse_key("a")?)?;
        assert_eq!(definition.recipe_type, "query");
        assert_eq!(definition.filename, "x.json");
        assert_eq!(definition.provides, vec!["x.json".to_owned()]);
        let definition = registry.resolve_definition(&JsonValue::from("value-1"), &Key::new())?;
        assert_eq!(definition.filename, "data.json");
        Ok(())
    }

    #[test]
    fn version_is_stable() -> Result<(), Error> {
        let a = RecipeDefinition::query("value-1", "a.json");
        let b = RecipeDefinition::query("value-1", "a.json");
        let c = RecipeDefinition::query("value-2", "a.json");
        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert!(a.version().starts_with("md5:"));
        Ok(())
    }

    #[test]
    fn virtual_entries_and_lazy_make() -> Result<(), Error> {
        let (_env, store) = recipe_store("RECIPES:\n  - query: value-5\n    filename: five.json\nsub:\n  - value-7/seven.json\n")?;
        let five = parse_key("dir/five.json")?;
        let seven = parse_key("dir/sub/seven.json")?;
        assert!(store.contains(&five)?);
        assert!(store.is_dir(&parse_key("dir/sub")?)?);
        let metadata = store.get_metadata(&five)?;
        assert_eq!(metadata.status, Status::Recipe);
        assert_eq!(metadata.extra.get("has_recipe"), Some(&JsonValue::Bool(true)));
        assert_eq!(
            metadata.extra.get("recipe_name"),
            Some(&JsonValue::from("dir/recipes.yaml/-Ryaml/RECIPES/0#five.json"))
        );
        assert!(store.listdir(&parse_key("dir")?)?.contains(&"five.json".to_owned()));

        assert_eq!(store.get_bytes(&seven)?, b"7".to_vec());
        let metadata = store.get_metadata(&seven)?;
        assert_eq!(metadata.status, Status::Ready);
        assert!(metadata.dependencies.recipe.version.is_some());
        Ok(())
    }

    #[test]
    fn failing_recipe_and_status_file() -> Result<(), Error> {
        let (_env, store) = recipe_store("RECIPES:\n  - query: fail\n    filename: broken.json\n")?;
        let broken = parse_key("dir/broken.json")?;
        assert!(store.get_bytes(&broken).is_err());
        let metadata = store.get_metadata(&broken)?;
        assert_eq!(metadata.status, Status::Error);
        let (bytes, metadata) = store.get(&parse_key("dir/recipes_status.txt")?)?;
        assert_eq!(metadata.status, Status::SideEffect);
        assert_eq!(metadata.title, "Status of 'dir'");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains("broken.json"));
        assert!(text.contains("error"));
        Ok(())
    }

    #[test]
    fn hidden_keys_are_ignored() -> Result<(), Error> {
        let (_env, store) = recipe_store("RECIPES:\n  - query: value-1\n    filename: .hidden.json\n")?;
        assert!(!store.contains(&parse_key("dir/.hidden.json")?)?);
        assert!(store.recipe_keys().is_empty());
        Ok(())
    }

    fn recorded_events(store: &ObservableStore) -> Result<Arc<Mutex<Vec<StoreEvent>>>, Error> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.add_listener(Arc::new(move |e: &StoreEvent| sink.lock().unwrap().push(e.clone())))?;
        Ok(events)
    }

    #[test]
    fn made_resources_are_reported_to_wrapping_stores() -> Result<(), Error> {
        let (_env, store) = recipe_store("RECIPES:\n  - value-4/four.txt\n")?;
        let observable = ObservableStore::new(store.clone());
        let events = recorded_events(&observable)?;
        assert_eq!(observable.get_bytes(&parse_key("dir/four.txt")?)?, b"4".to_vec());
        {
            let events = events.lock().unwrap();
            assert!(events.contains(&StoreEvent::DataChanged(parse_key("dir/four.txt")?)));
            assert!(events.contains(&StoreEvent::MetadataChanged(parse_key("dir/four.txt")?)));
            assert!(events.contains(&StoreEvent::DataChanged(parse_key("dir/recipes_status.txt")?)));
        }

        let (_env, store) = recipe_store("RECIPES:\n  - value-6/six.txt\n")?;
        let router = MountPointStore::new(None);
        router.mount(&parse_key("r")?, store)?;
        let observable = ObservableStore::new(router);
        let events = recorded_events(&observable)?;
        assert_eq!(observable.get_bytes(&parse_key("r/dir/six.txt")?)?, b"6".to_vec());
        let events = events.lock().unwrap();
        assert!(events.contains(&StoreEvent::DataChanged(parse_key("r/dir/six.txt")?)));
        assert!(events.contains(&StoreEvent::DataChanged(parse_key("r/dir/recipes_status.txt")?)));
        Ok(())
    }

    #[test]
    fn edited_recipes_file_is_reloaded() -> Result<(), Error> {
        let (_env, store) = recipe_store("RECIPES:\n  - value-4/four.txt\n")?;
        let recipes_key = parse_key("dir/recipes.yaml")?;
        let status_key = parse_key("dir/recipes_status.txt")?;
        assert!(store.contains(&parse_key("dir/four.txt")?)?);

        store.set(&recipes_key, b"RECIPES:\n  - value-5/five.txt\n", &Metadata::new())?;
        assert!(!store.contains(&parse_key("dir/four.txt")?)?);
        let status = String::from_utf8_lossy(&store.get_bytes(&status_key)?).to_string();
        assert!(status.contains("five.txt"));
        assert!(!status.contains("four.txt"));
        assert_eq!(store.get_bytes(&parse_key("dir/five.txt")?)?, b"5".to_vec());

        store
            .substore()
            .set(&recipes_key, b"RECIPES:\n  - value-6/six.txt\n", &Metadata::new())?;
        assert!(store.contains(&parse_key("dir/six.txt")?)?);
        let status = String::from_utf8_lossy(&store.get_bytes(&status_key)?).to_string();
        assert!(status.contains("six.txt"));
        Ok(())
    }
}
