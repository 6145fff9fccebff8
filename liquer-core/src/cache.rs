#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::metadata::{Metadata, Status};
use crate::state::State;
use crate::state_types::StateTypesRegistry;
use crate::value::Value;

/// Cache is meant to temporarily store results of queries.
/// Unlike the Store, the Cache is not a permanent storage;
/// its primary use is to accelerate the evaluation of queries and to make
/// short-lived results available via the web API.
///
/// The key is the canonical encoding of the query, taken from `metadata.query`.
/// Besides complete states, a cache can hold metadata-only entries
/// (e.g. for failed evaluations); [Cache::get] never returns those.
///
/// Backends synchronize internally, so all methods take `&self`.
pub trait Cache: Send + Sync {
    /// Name used in log messages
    fn cache_name(&self) -> String {
        "cache".to_owned()
    }

    /// Remove all entries
    fn clean(&self) -> Result<(), Error>;

    /// Get a state with data; metadata-only entries give None
    fn get(&self, query: &str) -> Option<State>;

    fn get_metadata(&self, query: &str) -> Option<Metadata>;

    /// Store a state. Returns false when the cache declined it.
    fn store(&self, state: &State) -> Result<bool, Error>;

    /// Store metadata only, data stored under the same key (if any) is dropped
    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error>;

    /// Remove an entry, returns true if something was removed
    fn remove(&self, query: &str) -> Result<bool, Error>;

    fn contains(&self, query: &str) -> bool;

    fn keys(&self) -> Vec<String>;
}

impl<C: Cache + ?Sized> Cache for Arc<C> {
    fn cache_name(&self) -> String {
        (**self).cache_name()
    }
    fn clean(&self) -> Result<(), Error> {
        (**self).clean()
    }
    fn get(&self, query: &str) -> Option<State> {
        (**self).get(query)
    }
    fn get_metadata(&self, query: &str) -> Option<Metadata> {
        (**self).get_metadata(query)
    }
    fn store(&self, state: &State) -> Result<bool, Error> {
        (**self).store(state)
    }
    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
        (**self).store_metadata(metadata)
    }
    fn remove(&self, query: &str) -> Result<bool, Error> {
        (**self).remove(query)
    }
    fn contains(&self, query: &str) -> bool {
        (**self).contains(query)
    }
    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }
}

/// Cache key of an entry described by metadata
pub fn cache_key(metadata: &Metadata) -> Result<String, Error> {
    match &metadata.query {
        Some(query) => Ok(query.clone()),
        None => Err(Error::general_error(
            "Metadata without a query can't be cached".to_owned(),
        )),
    }
}

/// Serialize the data of a state with the default format of its state type.
/// Returns None when the state type does not support serialization.
pub(crate) fn serialize_state(
    state_types: &StateTypesRegistry,
    state: &State,
) -> Result<Option<(Vec<u8>, Metadata)>, Error> {
    let state_type = match &state.metadata.type_identifier {
        Some(identifier) if state_types.contains(identifier) => state_types.get(identifier),
        _ => state_types.get_for_value(&state.data),
    };
    if !state_type.supports_serialization() {
        return Ok(None);
    }
    let (bytes, _mime) = state_type.as_bytes(&state.data, None)?;
    let mut metadata = state.metadata.clone();
    metadata.with_type_identifier(state_type.identifier());
    Ok(Some((bytes, metadata)))
}

pub(crate) fn deserialize_state(
    state_types: &StateTypesRegistry,
    bytes: &[u8],
    metadata: Metadata,
) -> Result<State, Error> {
    let value = state_types.decode(bytes, &metadata.type_identifier(), None)?;
    Ok(State::from_value_and_metadata(value, metadata))
}

fn has_data(metadata: &Metadata) -> bool {
    !metadata.is_error && metadata.status != Status::Error
}

/// Trivial cache, stores nothing
#[derive(Debug, Clone, Default)]
pub struct NoCache;

impl NoCache {
    pub fn new() -> Self {
        NoCache
    }
}

impl Cache for NoCache {
    fn cache_name(&self) -> String {
        "no cache".to_owned()
    }
    fn clean(&self) -> Result<(), Error> {
        Ok(())
    }
    fn get(&self, _query: &str) -> Option<State> {
        None
    }
    fn get_metadata(&self, _query: &str) -> Option<Metadata> {
        None
    }
    fn store(&self, _state: &State) -> Result<bool, Error> {
        Ok(false)
    }
    fn store_metadata(&self, _metadata: &Metadata) -> Result<bool, Error> {
        Ok(false)
    }
    fn remove(&self, _query: &str) -> Result<bool, Error> {
        Ok(false)
    }
    fn contains(&self, _query: &str) -> bool {
        false
    }
    fn keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// In-process cache. Entries are copies, so later changes of a stored state are not visible.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, (Metadata, Option<Value>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, (Metadata, Option<Value>)>>, Error> {
        self.entries
            .lock()
            .map_err(|e| Error::lock_error("memory cache", e))
    }
}

impl Cache for MemoryCache {
    fn cache_name(&self) -> String {
        "memory cache".to_owned()
    }

    fn clean(&self) -> Result<(), Error> {
        self.lock()?.clear();
        Ok(())
    }

    fn get(&self, query: &str) -> Option<State> {
        let entries = self.lock().ok()?;
        match entries.get(query) {
            Some((metadata, Some(value))) if has_data(metadata) => Some(
                State::from_value_and_metadata(value.clone(), metadata.clone()),
            ),
            _ => None,
        }
    }

    fn get_metadata(&self, query: &str) -> Option<Metadata> {
        let entries = self.lock().ok()?;
        entries.get(query).map(|(metadata, _)| metadata.clone())
    }

    fn store(&self, state: &State) -> Result<bool, Error> {
        let key = cache_key(&state.metadata)?;
        tracing::debug!(query = %key, "memory cache store");
        self.lock()?.insert(
            key,
            (state.metadata.clone(), Some(state.data.as_ref().clone())),
        );
        Ok(true)
    }

    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
        let key = cache_key(metadata)?;
        let mut entries = self.lock()?;
        match entries.get_mut(&key) {
            Some((old, data)) => {
                *old = metadata.clone();
                if !has_data(metadata) {
                    *data = None;
                }
            }
            None => {
                entries.insert(key, (metadata.clone(), None));
            }
        }
        Ok(true)
    }

    fn remove(&self, query: &str) -> Result<bool, Error> {
        Ok(self.lock()?.remove(query).is_some())
    }

    fn contains(&self, query: &str) -> bool {
        self.lock().map(|e| e.contains_key(query)).unwrap_or(false)
    }

    fn keys(&self) -> Vec<String> {
        self.lock()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Cache storing entries in a flat directory.
/// Each entry consists of `state_<md5>.json` with the metadata and
/// `data_<md5>.<ext>` with the data serialized by the default format of its state type.
/// Files can be obfuscated by XOR with a key stream.
pub struct FileCache {
    path: PathBuf,
    state_types: Arc<StateTypesRegistry>,
    xor_key: Option<Vec<u8>>,
}

impl FileCache {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileCache {
            path: path.as_ref().to_path_buf(),
            state_types: Arc::new(StateTypesRegistry::new()),
            xor_key: None,
        }
    }

    pub fn with_state_types(mut self, state_types: Arc<StateTypesRegistry>) -> Self {
        self.state_types = state_types;
        self
    }

    /// Obfuscate stored files with a repeated key stream
    pub fn with_xor_key(mut self, key: &[u8]) -> Self {
        if !key.is_empty() {
            self.xor_key = Some(key.to_vec());
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn digest(query: &str) -> String {
        format!("{:x}", md5::compute(query.as_bytes()))
    }

    fn metadata_path(&self, query: &str) -> PathBuf {
        self.path.join(format!("state_{}.json", Self::digest(query)))
    }

    fn data_path(&self, query: &str, extension: &str) -> PathBuf {
        self.path
            .join(format!("data_{}.{}", Self::digest(query), extension))
    }

    fn xor(&self, bytes: Vec<u8>) -> Vec<u8> {
        match &self.xor_key {
            Some(key) => bytes
                .into_iter()
                .zip(key.iter().cycle())
                .map(|(b, k)| b ^ k)
                .collect(),
            None => bytes,
        }
    }

    fn write(&self, path: &Path, bytes: Vec<u8>) -> Result<(), Error> {
        fs::create_dir_all(&self.path).map_err(|e| {
            Error::general_error(format!("Can't create cache directory {}", self.path.display()))
                .with_cause(e)
        })?;
        fs::write(path, self.xor(bytes)).map_err(|e| {
            Error::general_error(format!("Can't write cache file {}", path.display()))
                .with_cause(e)
        })
    }

    fn read(&self, path: &Path) -> Option<Vec<u8>> {
        fs::read(path).ok().map(|bytes| self.xor(bytes))
    }

    fn read_metadata_file(&self, path: &Path) -> Option<Metadata> {
        let bytes = self.read(path)?;
        match serde_json::from_slice::<Metadata>(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache metadata");
                None
            }
        }
    }

    fn data_extension(&self, metadata: &Metadata) -> String {
        self.state_types
            .get(&metadata.type_identifier())
            .default_extension()
            .to_owned()
    }

    fn remove_data_files(&self, query: &str) -> bool {
        let prefix = format!("data_{}.", Self::digest(query));
        let mut removed = false;
        if let Ok(dir) = fs::read_dir(&self.path) {
            for entry in dir.flatten() {
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    removed |= fs::remove_file(entry.path()).is_ok();
                }
            }
        }
        removed
    }
}

impl Cache for FileCache {
    fn cache_name(&self) -> String {
        format!("file cache in {}", self.path.display())
    }

    fn clean(&self) -> Result<(), Error> {
        let dir = match fs::read_dir(&self.path) {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };
        for entry in dir.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with("state_") || name.starts_with("data_") {
                fs::remove_file(entry.path()).map_err(|e| {
                    Error::general_error(format!("Can't remove cache file {}", name)).with_cause(e)
                })?;
            }
        }
        Ok(())
    }

    fn get(&self, query: &str) -> Option<State> {
        let metadata = self.read_metadata_file(&self.metadata_path(query))?;
        if !has_data(&metadata) {
            return None;
        }
        let extension = self.data_extension(&metadata);
        let bytes = self.read(&self.data_path(query, &extension))?;
        match deserialize_state(&self.state_types, &bytes, metadata) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(%query, error = %e, "cache entry can't be decoded");
                None
            }
        }
    }

    fn get_metadata(&self, query: &str) -> Option<Metadata> {
        self.read_metadata_file(&self.metadata_path(query))
    }

    fn store(&self, state: &State) -> Result<bool, Error> {
        let key = cache_key(&state.metadata)?;
        let (bytes, metadata) = match serialize_state(&self.state_types, state)? {
            Some(x) => x,
            None => return Ok(false),
        };
        let extension = self.data_extension(&metadata);
        self.remove_data_files(&key);
        self.write(&self.data_path(&key, &extension), bytes)?;
        self.write(&self.metadata_path(&key), metadata.to_json()?.into_bytes())?;
        tracing::debug!(query = %key, "file cache store");
        Ok(true)
    }

    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
        let key = cache_key(metadata)?;
        if !has_data(metadata) {
            self.remove_data_files(&key);
        }
        self.write(&self.metadata_path(&key), metadata.to_json()?.into_bytes())?;
        Ok(true)
    }

    fn remove(&self, query: &str) -> Result<bool, Error> {
        let removed_data = self.remove_data_files(query);
        let path = self.metadata_path(query);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                Error::general_error(format!("Can't remove cache file {}", path.display()))
                    .with_cause(e)
            })?;
            return Ok(true);
        }
        Ok(removed_data)
    }

    fn contains(&self, query: &str) -> bool {
        self.metadata_path(query).exists()
    }

    fn keys(&self) -> Vec<String> {
        let mut keys = Vec::new();
        if let Ok(dir) = fs::read_dir(&self.path) {
            for entry in dir.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("state_") && name.ends_with(".json") {
                    if let Some(query) = self
                        .read_metadata_file(&entry.path())
                        .and_then(|m| m.query)
                    {
                        keys.push(query);
                    }
                }
            }
        }
        keys.sort();
        keys
    }
}

/// Read-through combination of two caches.
/// Reads try the first cache, then the second one;
/// writes go to the first cache accepting the state.
pub struct CacheCombine<A: Cache, B: Cache> {
    first: A,
    second: B,
}

impl<A: Cache, B: Cache> CacheCombine<A, B> {
    pub fn new(first: A, second: B) -> Self {
        CacheCombine { first, second }
    }
}

impl<A: Cache, B: Cache> Cache for CacheCombine<A, B> {
    fn cache_name(&self) -> String {
        format!("{} + {}", self.first.cache_name(), self.second.cache_name())
    }
    fn clean(&self) -> Result<(), Error> {
        self.first.clean()?;
        self.second.clean()
    }
    fn get(&self, query: &str) -> Option<State> {
        self.first.get(query).or_else(|| self.second.get(query))
    }
    fn get_metadata(&self, query: &str) -> Option<Metadata> {
        self.first
            .get_metadata(query)
            .or_else(|| self.second.get_metadata(query))
    }
    fn store(&self, state: &State) -> Result<bool, Error> {
        if self.first.store(state)? {
            return Ok(true);
        }
        self.second.store(state)
    }
    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
        if self.first.store_metadata(metadata)? {
            return Ok(true);
        }
        self.second.store_metadata(metadata)
    }
    fn remove(&self, query: &str) -> Result<bool, Error> {
        let r1 = self.first.remove(query)?;
        let r2 = self.second.remove(query)?;
        Ok(r1 || r2)
    }
    fn contains(&self, query: &str) -> bool {
        self.first.contains(query) || self.second.contains(query)
    }
    fn keys(&self) -> Vec<String> {
        let keys: BTreeSet<String> = self
            .first
            .keys()
            .into_iter()
            .chain(self.second.keys())
            .collect();
        keys.into_iter().collect()
    }
}

/// Cache proxy storing only states whose metadata pass a condition
pub struct ConditionalCache<C: Cache, F: Fn(&Metadata) -> bool + Send + Sync> {
    cache: C,
    condition: F,
    description: String,
}

impl<C: Cache, F: Fn(&Metadata) -> bool + Send + Sync> ConditionalCache<C, F> {
    pub fn new(cache: C, condition: F, description: &str) -> Self {
        ConditionalCache {
            cache,
            condition,
            description: description.to_owned(),
        }
    }
}

impl<C: Cache, F: Fn(&Metadata) -> bool + Send + Sync> Cache for ConditionalCache<C, F> {
    fn cache_name(&self) -> String {
        format!("{} {}", self.cache.cache_name(), self.description)
    }
    fn clean(&self) -> Result<(), Error> {
        self.cache.clean()
    }
    fn get(&self, query: &str) -> Option<State> {
        self.cache.get(query)
    }
    fn get_metadata(&self, query: &str) -> Option<Metadata> {
        self.cache.get_metadata(query)
    }
    fn store(&self, state: &State) -> Result<bool, Error> {
        if (self.condition)(&state.metadata) {
            self.cache.store(state)
        } else {
            Ok(false)
        }
    }
    fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
        if (self.condition)(metadata) {
            self.cache.store_metadata(metadata)
        } else {
            Ok(false)
        }
    }
    fn remove(&self, query: &str) -> Result<bool, Error> {
        self.cache.remove(query)
    }
    fn contains(&self, query: &str) -> bool {
        self.cache.contains(query)
    }
    fn keys(&self) -> Vec<String> {
        self.cache.keys()
    }
}

pub type IfHasAttributes<C> = ConditionalCache<C, Box<dyn Fn(&Metadata) -> bool + Send + Sync>>;
pub type IfHasNotAttributes<C> = IfHasAttributes<C>;
pub type IfAttributeEqual<C> = IfHasAttributes<C>;
pub type IfAttributeNotEqual<C> = IfHasAttributes<C>;

/// Builder methods composing caches
pub trait CacheExt: Cache + Sized {
    /// Combination: `self` first, then `other`
    fn combine<B: Cache>(self, other: B) -> CacheCombine<Self, B> {
        CacheCombine::new(self, other)
    }

    /// Store only states having all the attributes
    fn if_has_attributes(self, attributes: &[&str]) -> IfHasAttributes<Self> {
        let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        let description = format!("if has attributes {}", attributes.join(", "));
        ConditionalCache::new(
            self,
            Box::new(move |m: &Metadata| attributes.iter().all(|a| m.has_attribute(a))),
            &description,
        )
    }

    /// Store only states having none of the attributes
    fn if_has_not_attributes(self, attributes: &[&str]) -> IfHasNotAttributes<Self> {
        let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        let description = format!("if has not attributes {}", attributes.join(", "));
        ConditionalCache::new(
            self,
            Box::new(move |m: &Metadata| !attributes.iter().any(|a| m.has_attribute(a))),
            &description,
        )
    }

    /// Store only states with the attribute equal to the value
    fn if_attribute_equal<V: Into<serde_json::Value>>(self, attribute: &str, value: V) -> IfAttributeEqual<Self> {
        let attribute = attribute.to_owned();
        let value: serde_json::Value = value.into();
        let description = format!("if {} == {}", attribute, value);
        ConditionalCache::new(
            self,
            Box::new(move |m: &Metadata| m.get_attribute(&attribute) == Some(&value)),
            &description,
        )
    }

    /// Store only states with the attribute missing or different from the value
    fn if_attribute_not_equal<V: Into<serde_json::Value>>(
        self,
        attribute: &str,
        value: V,
    ) -> IfAttributeNotEqual<Self> {
        let attribute = attribute.to_owned();
        let value: serde_json::Value = value.into();
        let description = format!("if {} != {}", attribute, value);
        ConditionalCache::new(
            self,
            Box::new(move |m: &Metadata| m.get_attribute(&attribute) != Some(&value)),
            &description,
        )
    }
}

impl<C: Cache + Sized> CacheExt for C {}

#[cfg(feature = "sql_cache")]
pub use self::sql::SqlCache;

#[cfg(feature = "sql_cache")]
mod sql {
    use std::sync::{Arc, Mutex};

    use base64::Engine;
    use rusqlite::{params, Connection, OptionalExtension};

    use super::{cache_key, deserialize_state, has_data, serialize_state, Cache};
    use crate::error::Error;
    use crate::metadata::Metadata;
    use crate::state::State;
    use crate::state_types::StateTypesRegistry;

    fn sql_error(e: rusqlite::Error) -> Error {
        Error::general_error("SQL cache error".to_owned()).with_cause(e)
    }

    /// Cache in an SQLite table `(query, metadata, data)`.
    /// The string variant keeps data base64-encoded in a TEXT column,
    /// for databases without BLOB support.
    /// Key list is cached and invalidated by every write.
    pub struct SqlCache {
        connection: Mutex<Connection>,
        table: String,
        base64_data: bool,
        delete_before_insert: bool,
        state_types: Arc<StateTypesRegistry>,
        keys: Mutex<Option<Vec<String>>>,
    }

    impl SqlCache {
        pub const DEFAULT_TABLE: &'static str = "liquer_cache";

        pub fn new(connection: Connection) -> Result<Self, Error> {
            Self::with_table(connection, Self::DEFAULT_TABLE, false)
        }

        /// Variant storing data as base64 text
        pub fn new_string_cache(connection: Connection) -> Result<Self, Error> {
            Self::with_table(connection, Self::DEFAULT_TABLE, true)
        }

        pub fn open_in_memory() -> Result<Self, Error> {
            Self::new(Connection::open_in_memory().map_err(sql_error)?)
        }

        pub fn with_table(connection: Connection, table: &str, base64_data: bool) -> Result<Self, Error> {
            if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::configuration_error(format!(
                    "Invalid SQL cache table name '{}'",
                    table
                )));
            }
            let data_type = if base64_data { "TEXT" } else { "BLOB" };
            connection
                .execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (query VARCHAR(2000), metadata TEXT, data {data_type});\n\
                     CREATE INDEX IF NOT EXISTS {table}_query_idx ON {table}(query);"
                ))
                .map_err(sql_error)?;
            Ok(SqlCache {
                connection: Mutex::new(connection),
                table: table.to_owned(),
                base64_data,
                delete_before_insert: true,
                state_types: Arc::new(StateTypesRegistry::new()),
                keys: Mutex::new(None),
            })
        }

        pub fn with_state_types(mut self, state_types: Arc<StateTypesRegistry>) -> Self {
            self.state_types = state_types;
            self
        }

        /// Without delete-before-insert, rows accumulate and the latest one wins
        pub fn with_delete_before_insert(mut self, flag: bool) -> Self {
            self.delete_before_insert = flag;
            self
        }

        fn invalidate_keys(&self) {
            if let Ok(mut keys) = self.keys.lock() {
                *keys = None;
            }
        }

        fn encode_data(&self, bytes: Vec<u8>) -> rusqlite::types::Value {
            if self.base64_data {
                rusqlite::types::Value::Text(base64::engine::general_purpose::STANDARD.encode(bytes))
            } else {
                rusqlite::types::Value::Blob(bytes)
            }
        }

        fn decode_data(&self, data: rusqlite::types::Value) -> Option<Vec<u8>> {
            match data {
                rusqlite::types::Value::Blob(b) => Some(b),
                rusqlite::types::Value::Text(t) if self.base64_data => {
                    base64::engine::general_purpose::STANDARD.decode(t).ok()
                }
                rusqlite::types::Value::Text(t) => Some(t.into_bytes()),
                _ => None,
            }
        }

        fn write(&self, query: &str, metadata: &Metadata, data: Option<Vec<u8>>) -> Result<(), Error> {
            let metadata_json = metadata.to_json()?;
            let data = match data {
                Some(bytes) => self.encode_data(bytes),
                None => rusqlite::types::Value::Null,
            };
            let mut connection = self
                .connection
                .lock()
                .map_err(|e| Error::lock_error("SQL cache", e))?;
            let tx = connection.transaction().map_err(sql_error)?;
            if self.delete_before_insert {
                tx.execute(
                    &format!("DELETE FROM {} WHERE query = ?1", self.table),
                    params![query],
                )
                .map_err(sql_error)?;
            }
            tx.execute(
                &format!(
                    "INSERT INTO {} (query, metadata, data) VALUES (?1, ?2, ?3)",
                    self.table
                ),
                params![query, metadata_json, data],
            )
            .map_err(sql_error)?;
            tx.commit().map_err(sql_error)?;
            drop(connection);
            self.invalidate_keys();
            Ok(())
        }

        fn read_row(&self, query: &str) -> Option<(String, rusqlite::types::Value)> {
            let connection = self.connection.lock().ok()?;
            connection
                .query_row(
                    &format!(
                        "SELECT metadata, data FROM {} WHERE query = ?1 ORDER BY rowid DESC LIMIT 1",
                        self.table
                    ),
                    params![query],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, rusqlite::types::Value>(1)?)),
                )
                .optional()
                .ok()
                .flatten()
        }
    }

    impl Cache for SqlCache {
        fn cache_name(&self) -> String {
            format!("SQL cache ({})", self.table)
        }

        fn clean(&self) -> Result<(), Error> {
            let connection = self
                .connection
                .lock()
                .map_err(|e| Error::lock_error("SQL cache", e))?;
            connection
                .execute(&format!("DELETE FROM {}", self.table), [])
                .map_err(sql_error)?;
            drop(connection);
            self.invalidate_keys();
            Ok(())
        }

        fn get(&self, query: &str) -> Option<State> {
            let (metadata_json, data) = self.read_row(query)?;
            let metadata = Metadata::from_json(&metadata_json).ok()?;
            if !has_data(&metadata) {
                return None;
            }
            let bytes = self.decode_data(data)?;
            deserialize_state(&self.state_types, &bytes, metadata).ok()
        }

        fn get_metadata(&self, query: &str) -> Option<Metadata> {
            let (metadata_json, _) = self.read_row(query)?;
            Metadata::from_json(&metadata_json).ok()
        }

        fn store(&self, state: &State) -> Result<bool, Error> {
            let key = cache_key(&state.metadata)?;
            match serialize_state(&self.state_types, state)? {
                Some((bytes, metadata)) => {
                    self.write(&key, &metadata, Some(bytes))?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        fn store_metadata(&self, metadata: &Metadata) -> Result<bool, Error> {
            let key = cache_key(metadata)?;
            let data = if has_data(metadata) {
                self.read_row(&key)
                    .and_then(|(_, data)| self.decode_data(data))
            } else {
                None
            };
            self.write(&key, metadata, data)?;
            Ok(true)
        }

        fn remove(&self, query: &str) -> Result<bool, Error> {
            let connection = self
                .connection
                .lock()
                .map_err(|e| Error::lock_error("SQL cache", e))?;
            let n = connection
                .execute(
                    &format!("DELETE FROM {} WHERE query = ?1", self.table),
                    params![query],
                )
                .map_err(sql_error)?;
            drop(connection);
            self.invalidate_keys();
            Ok(n > 0)
        }

        fn contains(&self, query: &str) -> bool {
            self.keys().iter().any(|k| k == query)
        }

        fn keys(&self) -> Vec<String> {
            if let Ok(keys) = self.keys.lock() {
                if let Some(keys) = keys.as_ref() {
                    return keys.clone();
                }
            }
            let loaded: Vec<String> = match self.connection.lock() {
                Ok(connection) => {
                    let sql = format!("SELECT DISTINCT query FROM {} ORDER BY query", self.table);
                    match connection.prepare(&sql) {
                        Ok(mut stmt) => stmt
                            .query_map([], |row| row.get::<_, String>(0))
                            .map(|rows| rows.flatten().collect())
                            .unwrap_or_default(),
                        Err(e) => {
                            tracing::warn!(error = %e, "SQL cache keys query failed");
                            Vec::new()
                        }
                    }
                }
                Err(_) => Vec::new(),
            };
            if let Ok(mut keys) = self.keys.lock() {
                *keys = Some(loaded.clone());
            }
            loaded
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    fn state(query: &str, value: Value) -> State {
        let mut metadata = Metadata::new();
        metadata.with_query(query);
        metadata.set_status(Status::Ready);
        State::from_value_and_metadata(value, metadata)
    }

    #[test]
    fn test_no_cache() -> Result<(), Error> {
        let cache = NoCache::new();
        assert!(!cache.store(&state("a", Value::I64(1)))?);
        assert!(cache.get_metadata("a").is_none());
        assert!(!cache.contains("a"));
        Ok(())
    }

    #[test]
    fn test_memory_cache() -> Result<(), Error> {
        let cache = MemoryCache::new();
        assert!(!cache.contains("a/b"));
        assert!(cache.store(&state("a/b", Value::from("hello")))?);
        assert!(cache.contains("a/b"));
        assert_eq!(*cache.get("a/b").unwrap().data, Value::from("hello"));
        assert_eq!(cache.keys(), vec!["a/b".to_owned()]);
        assert!(cache.remove("a/b")?);
        assert!(!cache.contains("a/b"));
        Ok(())
    }

    #[test]
    fn metadata_only_entry_has_no_state() -> Result<(), Error> {
        let cache = MemoryCache::new();
        cache.store(&state("x", Value::I64(1)))?;
        let mut metadata = Metadata::from_error(Error::execution_error("failed".to_owned()));
        metadata.with_query("x");
        cache.store_metadata(&metadata)?;
        assert!(cache.contains("x"));
        assert!(cache.get("x").is_none());
        assert!(cache.get_metadata("x").unwrap().is_error);
        Ok(())
    }

    #[test]
    fn test_memory_cache_threaded() -> Result<(), Error> {
        let cache = Arc::new(MemoryCache::new());
        let c1 = cache.clone();
        let t1 = thread::spawn(move || {
            c1.store(&state("key", Value::from("hello1"))).unwrap();
            assert!(c1.get_metadata("key").is_some());
        });
        let c2 = cache.clone();
        let t2 = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            c2.store(&state("key", Value::from("hello2"))).unwrap();
        });
        t1.join().unwrap();
        assert!(cache.contains("key"));
        t2.join().unwrap();
        let data = cache.get("key").unwrap().data;
        assert!(*data == Value::from("hello1") || *data == Value::from("hello2"));
        Ok(())
    }

    #[test]
    fn file_cache_layout() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = FileCache::new(dir.path());
        cache.store(&state("abc/def", Value::I64(123)))?;
        let digest = format!("{:x}", md5::compute(b"abc/def"));
        assert!(dir.path().join(format!("state_{}.json", digest)).exists());
        assert!(dir.path().join(format!("data_{}.json", digest)).exists());
        let s = cache.get("abc/def").unwrap();
        assert_eq!(*s.data, Value::I64(123));
        assert_eq!(s.type_identifier(), "generic");
        assert_eq!(cache.keys(), vec!["abc/def".to_owned()]);
        cache.clean()?;
        assert!(!cache.contains("abc/def"));
        Ok(())
    }

    #[test]
    fn file_cache_xor() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let cache = FileCache::new(dir.path()).with_xor_key(b"secret");
        cache.store(&state("t", Value::from("plain text")))?;
        let digest = format!("{:x}", md5::compute(b"t"));
        let raw = fs::read(dir.path().join(format!("data_{}.txt", digest)))?;
        assert_ne!(raw, b"plain text".to_vec());
        assert_eq!(*cache.get("t").unwrap().data, Value::from("plain text"));
        Ok(())
    }

    #[test]
    fn combined_cache() -> Result<(), Error> {
        let a = Arc::new(MemoryCache::new());
        let b = Arc::new(MemoryCache::new());
        let cache = a.clone().if_has_attributes(&["keep"]).combine(b.clone());
        cache.store(&state("x", Value::I64(1)))?;
        assert!(!a.contains("x"));
        assert!(b.contains("x"));
        let mut s = state("y", Value::I64(2));
        s.metadata.with_attribute("keep", true);
        cache.store(&s)?;
        assert!(a.contains("y"));
        assert!(!b.contains("y"));
        b.store(&state("y", Value::I64(3)))?;
        assert_eq!(*cache.get("y").unwrap().data, Value::I64(2));
        assert_eq!(cache.keys(), vec!["x".to_owned(), "y".to_owned()]);
        Ok(())
    }

    #[test]
    fn attribute_equal_guard() -> Result<(), Error> {
        let cache = MemoryCache::new().if_attribute_equal("kind", "big");
        let mut s = state("q", Value::I64(1));
        assert!(!cache.store(&s)?);
        s.metadata.with_attribute("kind", "big");
        assert!(cache.store(&s)?);
        let cache = MemoryCache::new().if_attribute_not_equal("kind", "big");
        assert!(!cache.store(&s)?);
        let cache = MemoryCache::new().if_has_not_attributes(&["kind"]);
        assert!(!cache.store(&s)?);
        Ok(())
    }

    #[cfg(feature = "sql_cache")]
    #[test]
    fn sql_cache() -> Result<(), Error> {
        for cache in [
            SqlCache::open_in_memory()?,
            SqlCache::new_string_cache(
                rusqlite::Connection::open_in_memory().map_err(|e| Error::general_error(e.to_string()))?,
            )?,
        ] {
            assert!(!cache.contains("a"));
            cache.store(&state("a", Value::from("hello")))?;
            cache.store(&state("a", Value::from("hello again")))?;
            assert!(cache.contains("a"));
            assert_eq!(cache.keys(), vec!["a".to_owned()]);
            assert_eq!(*cache.get("a").unwrap().data, Value::from("hello again"));
            let mut metadata = cache.get_metadata("a").unwrap();
            metadata.title = "Title".to_owned();
            cache.store_metadata(&metadata)?;
            let s = cache.get("a").unwrap();
            assert_eq!(s.metadata.title, "Title");
            assert_eq!(*s.data, Value::from("hello again"));
            assert!(cache.remove("a")?);
            assert!(!cache.contains("a"));
        }
        Ok(())
    }
}
