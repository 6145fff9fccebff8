#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::error::Error;
use crate::media_type::{file_extension_to_media_type, file_extension_to_type_identifier};
use crate::metadata::{timestamp, FileInfo, Metadata, Status};
use crate::query::{Key, ResourceName};

/// Store is a hierarchical key-value storage of bytes together with metadata.
/// Keys are paths; a key pointing to a directory has no data.
/// The empty key is the root directory and is always present.
///
/// Stores synchronize internally, all methods take `&self`.
/// Mutating methods call the event hooks (`on_data_changed`, `on_metadata_changed`, `on_removed`)
/// of the store holding the data. The default hooks forward the event to the parent store
/// (the wrapper linked with [Store::set_parent]), so events reach the outermost store
/// with keys translated on the way.
pub trait Store: Send + Sync {
    /// Get store name
    fn store_name(&self) -> String;

    /// Key prefix common to all keys in this store.
    fn key_prefix(&self) -> Key {
        Key::new()
    }

    /// Create default metadata object for a given key
    fn default_metadata(&self, key: &Key, is_dir: bool) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.with_key(&key.encode());
        metadata.fileinfo = Some(FileInfo {
            name: key_name(key),
            is_dir,
            ..Default::default()
        });
        metadata
    }

    /// Fill in the key, file information, timestamps and the media type derived from the key.
    /// When data is given, size and MD5 checksum are recorded.
    fn finalize_metadata(
        &self,
        metadata: Metadata,
        key: &Key,
        is_dir: bool,
        data: Option<&[u8]>,
        update: bool,
    ) -> Metadata {
        finalize_metadata(metadata, key, is_dir, data, update)
    }

    /// Get data and metadata
    fn get(&self, key: &Key) -> Result<(Vec<u8>, Metadata), Error> {
        let data = self.get_bytes(key)?;
        let metadata = self.get_metadata(key)?;
        Ok((data, metadata))
    }

    /// Get data as bytes
    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        Err(Error::key_not_found(key))
    }

    /// Get metadata
    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        Err(Error::key_not_found(key))
    }

    /// Store data and metadata.
    fn set(&self, key: &Key, _data: &[u8], _metadata: &Metadata) -> Result<(), Error> {
        Err(Error::key_not_supported(key, &self.store_name()))
    }

    /// Store metadata only
    fn set_metadata(&self, key: &Key, _metadata: &Metadata) -> Result<(), Error> {
        Err(Error::key_not_supported(key, &self.store_name()))
    }

    /// Remove data and metadata associated with the key
    fn remove(&self, key: &Key) -> Result<(), Error> {
        Err(Error::key_not_supported(key, &self.store_name()))
    }

    /// Remove an empty directory
    fn removedir(&self, key: &Key) -> Result<(), Error> {
        Err(Error::key_not_supported(key, &self.store_name()))
    }

    /// Returns true if store contains the key.
    fn contains(&self, key: &Key) -> Result<bool, Error> {
        Ok(key.is_empty())
    }

    /// Returns true if key points to a directory.
    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        Ok(key.is_empty())
    }

    /// All keys in the store (the root excluded)
    fn keys(&self) -> Result<Vec<Key>, Error> {
        self.listdir_keys_deep(&Key::new())
    }

    /// Return names inside a directory specified by key.
    /// To get a key, names need to be joined with the key (key/name).
    /// Complete keys can be obtained with the listdir_keys method.
    fn listdir(&self, _key: &Key) -> Result<Vec<String>, Error> {
        Ok(vec![])
    }

    /// Return keys inside a directory specified by key.
    /// Only keys present directly in the directory are returned,
    /// subdirectories are not traversed.
    fn listdir_keys(&self, key: &Key) -> Result<Vec<Key>, Error> {
        let names = self.listdir(key)?;
        Ok(names.iter().map(|x| key.join(x)).collect())
    }

    /// Keys in the directory and all its subdirectories
    fn listdir_keys_deep(&self, key: &Key) -> Result<Vec<Key>, Error> {
        let keys = self.listdir_keys(key)?;
        let mut keys_deep = Vec::new();
        for sub_key in keys {
            let is_dir = self.is_dir(&sub_key)?;
            keys_deep.push(sub_key.clone());
            if is_dir {
                keys_deep.extend(self.listdir_keys_deep(&sub_key)?);
            }
        }
        Ok(keys_deep)
    }

    /// Make a directory, including missing parents
    fn makedir(&self, key: &Key) -> Result<(), Error> {
        Err(Error::key_not_supported(key, &self.store_name()))
    }

    /// Returns true when this store supports the supplied key.
    /// This allows layering stores and keeping certain keys in certain stores.
    fn is_supported(&self, _key: &Key) -> bool {
        false
    }

    /// Store wrapping this one, if linked and still alive
    fn parent(&self) -> Option<Arc<dyn Store>> {
        None
    }

    /// Link this store to the store wrapping it
    fn set_parent(&self, _parent: Weak<dyn Store>) {}

    /// Key in this store of a key reported by a substore
    fn from_substore_key(&self, key: &Key) -> Key {
        key.clone()
    }

    /// Event handler called when the data is changed
    fn on_data_changed(&self, key: &Key) {
        forward_event(self, &StoreEvent::DataChanged(key.clone()));
    }

    /// Event handler called when the metadata is changed
    fn on_metadata_changed(&self, key: &Key) {
        forward_event(self, &StoreEvent::MetadataChanged(key.clone()));
    }

    /// Event handler called when the data or directory is removed
    fn on_removed(&self, key: &Key) {
        forward_event(self, &StoreEvent::Removed(key.clone()));
    }
}

/// Change notification passed from a store to its parent and to store listeners
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    DataChanged(Key),
    MetadataChanged(Key),
    Removed(Key),
}

impl StoreEvent {
    pub fn key(&self) -> &Key {
        match self {
            StoreEvent::DataChanged(key)
            | StoreEvent::MetadataChanged(key)
            | StoreEvent::Removed(key) => key,
        }
    }
}

/// Pass an event raised in `store` to the store wrapping it, with the key translated
pub fn forward_event<S: Store + ?Sized>(store: &S, event: &StoreEvent) {
    if let Some(parent) = store.parent() {
        let key = parent.from_substore_key(event.key());
        match event {
            StoreEvent::DataChanged(_) => parent.on_data_changed(&key),
            StoreEvent::MetadataChanged(_) => parent.on_metadata_changed(&key),
            StoreEvent::Removed(_) => parent.on_removed(&key),
        }
    }
}

/// Outermost store reachable through the parent links and the key translated to it
pub fn to_root_key(store: Arc<dyn Store>, key: &Key) -> (Arc<dyn Store>, Key) {
    let mut store = store;
    let mut key = key.clone();
    while let Some(parent) = store.parent() {
        key = parent.from_substore_key(&key);
        store = parent;
    }
    (store, key)
}

/// Weak link from a store to the store wrapping it
#[derive(Default)]
pub struct ParentLink(RwLock<Option<Weak<dyn Store>>>);

impl ParentLink {
    pub fn get(&self) -> Option<Arc<dyn Store>> {
        self.0
            .read()
            .ok()
            .and_then(|link| link.as_ref().and_then(Weak::upgrade))
    }

    pub fn set(&self, parent: Weak<dyn Store>) {
        if let Ok(mut link) = self.0.write() {
            *link = Some(parent);
        }
    }
}

/// A copy of a store is not wrapped by anything
impl Clone for ParentLink {
    fn clone(&self) -> Self {
        ParentLink::default()
    }
}

impl fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParentLink(linked: {})", self.get().is_some())
    }
}

/// Implements [Store::parent] and [Store::set_parent] over a [ParentLink] field named `parent`
#[macro_export]
macro_rules! parent_link_accessors {
    () => {
        fn parent(&self) -> Option<std::sync::Arc<dyn $crate::store::Store>> {
            self.parent.get()
        }
        fn set_parent(&self, parent: std::sync::Weak<dyn $crate::store::Store>) {
            self.parent.set(parent)
        }
    };
}

/// Make `parent` the parent of `child`
pub fn link_parent<P: Store + 'static>(parent: &Weak<P>, child: &dyn Store) {
    let parent: Weak<dyn Store> = parent.clone();
    child.set_parent(parent);
}

/// A rewrite keeps the creation time of the first write
fn keep_created(metadata: &mut Metadata, previous: Option<&Metadata>) {
    if let Some(created) = previous.and_then(|m| m.created.clone()) {
        metadata.created = Some(created);
    }
}

/// Last element of the key, empty for the root
pub fn key_name(key: &Key) -> String {
    key.filename().map(|n| n.name.clone()).unwrap_or_default()
}

/// Metadata finalization shared by all stores
pub fn finalize_metadata(
    mut metadata: Metadata,
    key: &Key,
    is_dir: bool,
    data: Option<&[u8]>,
    update: bool,
) -> Metadata {
    metadata.with_key(&key.encode());
    let now = timestamp();
    if update || data.is_some() {
        metadata.updated = Some(now.clone());
    }
    if metadata.created.is_none() && data.is_some() {
        metadata.created = Some(now);
    }
    let mut fileinfo = metadata.fileinfo.take().unwrap_or_default();
    fileinfo.name = key_name(key);
    fileinfo.is_dir = is_dir;
    if let Some(data) = data {
        fileinfo.size = Some(data.len() as u64);
        fileinfo.md5 = Some(format!("{:x}", md5::compute(data)));
    }
    metadata.fileinfo = Some(fileinfo);
    if !is_dir {
        if let Some(extension) = key.extension() {
            if metadata.mimetype.is_none() {
                metadata.mimetype = Some(file_extension_to_media_type(&extension).to_owned());
            }
            if metadata.type_identifier.is_none() {
                metadata.type_identifier =
                    file_extension_to_type_identifier(&extension).map(|t| t.to_owned());
            }
        }
    }
    metadata
}

/// Trivial store unable to store anything.
/// Used e.g. in the environment as a default value when the store is not available.
pub struct NoStore;

impl Store for NoStore {
    fn store_name(&self) -> String {
        "No store".to_owned()
    }
}

#[derive(Default)]
struct MemoryStoreContent {
    directories: HashSet<Key>,
    data: HashMap<Key, Vec<u8>>,
    metadata: HashMap<Key, Metadata>,
}

impl MemoryStoreContent {
    fn makedir(&mut self, key: &Key) {
        let mut key = key.clone();
        while !key.is_empty() {
            self.directories.insert(key.clone());
            key = key.parent();
        }
    }

    fn is_dir(&self, key: &Key) -> bool {
        key.is_empty() || self.directories.contains(key)
    }

    fn contains(&self, key: &Key) -> bool {
        key.is_empty()
            || self.directories.contains(key)
            || self.data.contains_key(key)
            || self.metadata.contains_key(key)
    }

    fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .directories
            .iter()
            .chain(self.data.keys())
            .chain(self.metadata.keys())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sort_keys(&mut keys);
        keys
    }

    fn listdir(&self, key: &Key) -> Vec<String> {
        let names: BTreeSet<String> = self
            .keys()
            .into_iter()
            .filter(|k| k.len() == key.len() + 1 && k.has_key_prefix(key))
            .map(|k| key_name(&k))
            .collect();
        names.into_iter().collect()
    }
}

fn sort_keys(keys: &mut Vec<Key>) {
    keys.sort_by_key(|k| k.encode());
}

/// Store keeping everything in memory
pub struct MemoryStore {
    content: Mutex<MemoryStoreContent>,
    prefix: Key,
    parent: ParentLink,
}

impl MemoryStore {
    pub fn new(prefix: &Key) -> MemoryStore {
        MemoryStore {
            content: Mutex::new(MemoryStoreContent::default()),
            prefix: prefix.to_owned(),
            parent: ParentLink::default(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryStoreContent>, Error> {
        self.content
            .lock()
            .map_err(|e| Error::lock_error("memory store", e))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&Key::new())
    }
}

impl Store for MemoryStore {
    fn store_name(&self) -> String {
        format!("{} Memory store", self.key_prefix())
    }

    fn key_prefix(&self) -> Key {
        self.prefix.to_owned()
    }

    parent_link_accessors!();

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        match self.lock()?.data.get(key) {
            Some(data) => Ok(data.to_owned()),
            None => Err(Error::key_not_found(key)),
        }
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        let content = self.lock()?;
        let is_dir = content.is_dir(key);
        let metadata = match content.metadata.get(key) {
            Some(metadata) => metadata.clone(),
            None if is_dir => self.default_metadata(key, true),
            None => return Err(Error::key_not_found(key)),
        };
        drop(content);
        Ok(self.finalize_metadata(metadata, key, is_dir, None, false))
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        let mut metadata = metadata.clone();
        {
            let mut content = self.lock()?;
            if content.directories.contains(key) {
                return Err(Error::key_write_error(key, &self.store_name(), "key is a directory"));
            }
            keep_created(&mut metadata, content.metadata.get(key));
            let metadata = self.finalize_metadata(metadata, key, false, Some(data), false);
            content.makedir(&key.parent());
            content.data.insert(key.to_owned(), data.to_owned());
            content.metadata.insert(key.to_owned(), metadata);
        }
        self.on_data_changed(key);
        self.on_metadata_changed(key);
        Ok(())
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        {
            let mut content = self.lock()?;
            let is_dir = content.is_dir(key);
            let mut metadata = metadata.clone();
            keep_created(&mut metadata, content.metadata.get(key));
            let metadata = self.finalize_metadata(metadata, key, is_dir, None, true);
            content.makedir(&key.parent());
            content.metadata.insert(key.to_owned(), metadata);
        }
        self.on_metadata_changed(key);
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        {
            let mut content = self.lock()?;
            content.directories.remove(key);
            content.data.remove(key);
            content.metadata.remove(key);
        }
        self.on_removed(key);
        Ok(())
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        {
            let mut content = self.lock()?;
            if !content.listdir(key).is_empty() {
                return Err(Error::key_write_error(
                    key,
                    &self.store_name(),
                    "directory is not empty",
                ));
            }
            content.directories.remove(key);
            content.metadata.remove(key);
        }
        self.on_removed(key);
        Ok(())
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        Ok(self.lock()?.contains(key))
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        Ok(self.lock()?.is_dir(key))
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        Ok(self.lock()?.keys())
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        let content = self.lock()?;
        if !content.is_dir(key) {
            return Err(Error::key_not_found(key));
        }
        Ok(content.listdir(key))
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.lock()?.makedir(key);
        self.on_data_changed(key);
        self.on_metadata_changed(key);
        Ok(())
    }

    fn is_supported(&self, _key: &Key) -> bool {
        true
    }
}

/// Store in a directory of the local filesystem.
/// Data of a key `a/b` is in the file `a/b`, its metadata in `a/__metadata__/b.json`.
/// Files without a metadata sidecar are reported with the external status.
#[derive(Debug, Clone)]
pub struct FileStore {
    pub path: PathBuf,
    pub prefix: Key,
    parent: ParentLink,
}

impl FileStore {
    pub const METADATA: &'static str = "__metadata__";

    pub fn new<P: AsRef<Path>>(path: P, prefix: &Key) -> FileStore {
        FileStore {
            path: path.as_ref().to_path_buf(),
            prefix: prefix.to_owned(),
            parent: ParentLink::default(),
        }
    }

    pub fn key_to_path(&self, key: &Key) -> PathBuf {
        let mut path = self.path.clone();
        for name in key.iter() {
            path.push(&name.name);
        }
        path
    }

    pub fn key_to_path_metadata(&self, key: &Key) -> PathBuf {
        let mut path = self.key_to_path(&key.parent());
        path.push(Self::METADATA);
        path.push(format!("{}.json", key_name(key)));
        path
    }

    fn check_key(&self, key: &Key) -> Result<(), Error> {
        if key
            .iter()
            .any(|name| name.name == Self::METADATA || name.name == ".." || name.name == ".")
        {
            return Err(Error::key_not_supported(key, &self.store_name()));
        }
        Ok(())
    }

    fn read_metadata_file(&self, key: &Key) -> Result<Option<Metadata>, Error> {
        let path = self.key_to_path_metadata(key);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .map_err(|e| Error::key_read_error(key, &self.store_name(), &e))?;
        match serde_json::from_str::<Metadata>(&text) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "corrupted metadata");
                Err(Error::key_read_error(key, &self.store_name(), &e))
            }
        }
    }

    fn write_metadata_file(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        let path = self.key_to_path_metadata(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        }
        let json = serde_json::to_string_pretty(metadata)
            .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        fs::write(path, json).map_err(|e| Error::key_write_error(key, &self.store_name(), &e))
    }
}

impl Store for FileStore {
    fn store_name(&self) -> String {
        format!("{} File store in {}", self.key_prefix(), self.path.display())
    }

    fn key_prefix(&self) -> Key {
        self.prefix.to_owned()
    }

    parent_link_accessors!();

    fn finalize_metadata(
        &self,
        metadata: Metadata,
        key: &Key,
        is_dir: bool,
        data: Option<&[u8]>,
        update: bool,
    ) -> Metadata {
        let mut metadata = finalize_metadata(metadata, key, is_dir, data, update);
        if let Some(fileinfo) = metadata.fileinfo.as_mut() {
            let path = self.key_to_path(key);
            let path = path.canonicalize().unwrap_or(path);
            fileinfo.filesystem_path = Some(path.display().to_string());
        }
        metadata
    }

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if path.is_file() {
            fs::read(path).map_err(|e| Error::key_read_error(key, &self.store_name(), &e))
        } else {
            Err(Error::key_not_found(key))
        }
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if path.is_dir() {
            let metadata = if key.is_empty() {
                None
            } else {
                self.read_metadata_file(key).ok().flatten()
            };
            let metadata = metadata.unwrap_or_else(|| self.default_metadata(key, true));
            return Ok(self.finalize_metadata(metadata, key, true, None, false));
        }
        match self.read_metadata_file(key)? {
            Some(metadata) => Ok(self.finalize_metadata(metadata, key, false, None, false)),
            None if path.exists() => {
                let mut metadata = self.default_metadata(key, false);
                metadata.set_status(Status::External);
                let data = fs::read(&path).ok();
                Ok(self.finalize_metadata(metadata, key, false, data.as_deref(), false))
            }
            None => Err(Error::key_not_found(key)),
        }
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if path.is_dir() {
            return Err(Error::key_write_error(key, &self.store_name(), "key is a directory"));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        }
        let mut metadata = metadata.clone();
        keep_created(&mut metadata, self.read_metadata_file(key).ok().flatten().as_ref());
        fs::write(&path, data).map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        let metadata = self.finalize_metadata(metadata, key, false, Some(data), false);
        self.write_metadata_file(key, &metadata)?;
        self.on_data_changed(key);
        self.on_metadata_changed(key);
        Ok(())
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.check_key(key)?;
        if key.is_empty() {
            return Err(Error::key_not_supported(key, &self.store_name()));
        }
        let is_dir = self.key_to_path(key).is_dir();
        let mut metadata = metadata.clone();
        keep_created(&mut metadata, self.read_metadata_file(key).ok().flatten().as_ref());
        let metadata = self.finalize_metadata(metadata, key, is_dir, None, true);
        self.write_metadata_file(key, &metadata)?;
        self.on_metadata_changed(key);
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if path.is_file() {
            fs::remove_file(&path)
                .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        }
        let metadata_path = self.key_to_path_metadata(key);
        if metadata_path.exists() {
            fs::remove_file(metadata_path)
                .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        }
        self.on_removed(key);
        Ok(())
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if path.is_dir() {
            let metadata_dir = path.join(Self::METADATA);
            if metadata_dir.is_dir() {
                fs::remove_dir(&metadata_dir)
                    .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
            }
            fs::remove_dir(&path).map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
            let metadata_path = self.key_to_path_metadata(key);
            if metadata_path.exists() {
                fs::remove_file(metadata_path)
                    .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
            }
        }
        self.on_removed(key);
        Ok(())
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        if self.check_key(key).is_err() {
            return Ok(false);
        }
        Ok(self.key_to_path(key).exists() || self.key_to_path_metadata(key).exists())
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        Ok(self.check_key(key).is_ok() && self.key_to_path(key).is_dir())
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        if !path.is_dir() {
            return Err(Error::key_not_found(key));
        }
        let dir = path
            .read_dir()
            .map_err(|e| Error::key_read_error(key, &self.store_name(), &e))?;
        let mut names: Vec<String> = dir
            .flatten()
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name != Self::METADATA)
            .collect();
        names.sort();
        Ok(names)
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.check_key(key)?;
        let path = self.key_to_path(key);
        fs::create_dir_all(path.join(Self::METADATA))
            .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        self.on_data_changed(key);
        self.on_metadata_changed(key);
        Ok(())
    }

    fn is_supported(&self, key: &Key) -> bool {
        self.check_key(key).is_ok()
    }
}

/// Mode for [Store::openbin](trait.Store.html#method.openbin)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

impl OpenMode {
    pub fn parse(mode: &str) -> Result<OpenMode, Error> {
        match mode {
            "r" | "rb" => Ok(OpenMode::Read),
            "w" | "wb" => Ok(OpenMode::Write),
            _ => Err(Error::not_supported(format!("Unsupported open mode '{}'", mode))),
        }
    }
}

/// File-like access to a store entry.
/// Written data are stored when the file is closed.
pub enum StoreFile<'a> {
    Reader(Cursor<Vec<u8>>),
    Writer {
        store: &'a dyn Store,
        key: Key,
        buffer: Vec<u8>,
    },
}

impl<'a> StoreFile<'a> {
    /// Finish the file; a writer stores the written bytes
    pub fn close(self) -> Result<(), Error> {
        match self {
            StoreFile::Reader(_) => Ok(()),
            StoreFile::Writer { store, key, buffer } => {
                let metadata = store
                    .get_metadata(&key)
                    .unwrap_or_else(|_| store.default_metadata(&key, false));
                store.set(&key, &buffer, &metadata)
            }
        }
    }
}

impl<'a> Read for StoreFile<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            StoreFile::Reader(cursor) => cursor.read(buf),
            StoreFile::Writer { .. } => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "file opened for writing",
            )),
        }
    }
}

impl<'a> Write for StoreFile<'a> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StoreFile::Writer { buffer, .. } => {
                buffer.extend_from_slice(buf);
                Ok(buf.len())
            }
            StoreFile::Reader(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "file opened for reading",
            )),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'s> dyn Store + 's {
    /// Open an entry as a binary file
    pub fn openbin(&self, key: &Key, mode: OpenMode) -> Result<StoreFile<'_>, Error> {
        match mode {
            OpenMode::Read => Ok(StoreFile::Reader(Cursor::new(self.get_bytes(key)?))),
            OpenMode::Write => {
                if !self.is_supported(key) {
                    return Err(Error::key_not_supported(key, &self.store_name()));
                }
                Ok(StoreFile::Writer {
                    store: self,
                    key: key.clone(),
                    buffer: Vec::new(),
                })
            }
        }
    }
}

/// Identity wrapper, base for stores modifying a part of the behaviour
pub struct ProxyStore {
    store: Arc<dyn Store>,
    parent: ParentLink,
}

impl ProxyStore {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            link_parent(me, store.as_ref());
            ProxyStore {
                store,
                parent: ParentLink::default(),
            }
        })
    }

    pub fn inner(&self) -> &Arc<dyn Store> {
        &self.store
    }
}

impl Store for ProxyStore {
    fn store_name(&self) -> String {
        format!("Proxy of ({})", self.store.store_name())
    }
    fn key_prefix(&self) -> Key {
        self.store.key_prefix()
    }
    parent_link_accessors!();
    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.store.get_bytes(key)
    }
    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.store.get_metadata(key)
    }
    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.store.set(key, data, metadata)
    }
    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.store.set_metadata(key, metadata)
    }
    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.store.remove(key)
    }
    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.store.removedir(key)
    }
    fn contains(&self, key: &Key) -> Result<bool, Error> {
        self.store.contains(key)
    }
    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        self.store.is_dir(key)
    }
    fn keys(&self) -> Result<Vec<Key>, Error> {
        self.store.keys()
    }
    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.store.listdir(key)
    }
    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.store.makedir(key)
    }
    fn is_supported(&self, key: &Key) -> bool {
        self.store.is_supported(key)
    }
}

/// Wrapper rejecting every write.
/// Changes made inside the wrapped store (e.g. by recipes) are still forwarded.
pub struct ReadOnlyStore {
    store: Arc<dyn Store>,
    parent: ParentLink,
}

impl ReadOnlyStore {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            link_parent(me, store.as_ref());
            ReadOnlyStore {
                store,
                parent: ParentLink::default(),
            }
        })
    }
}

impl Store for ReadOnlyStore {
    fn store_name(&self) -> String {
        format!("Read-only ({})", self.store.store_name())
    }
    fn key_prefix(&self) -> Key {
        self.store.key_prefix()
    }
    parent_link_accessors!();
    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.store.get_bytes(key)
    }
    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.store.get_metadata(key)
    }
    fn set(&self, key: &Key, _data: &[u8], _metadata: &Metadata) -> Result<(), Error> {
        Err(Error::read_only(key, &self.store_name()))
    }
    fn set_metadata(&self, key: &Key, _metadata: &Metadata) -> Result<(), Error> {
        Err(Error::read_only(key, &self.store_name()))
    }
    fn remove(&self, key: &Key) -> Result<(), Error> {
        Err(Error::read_only(key, &self.store_name()))
    }
    fn removedir(&self, key: &Key) -> Result<(), Error> {
        Err(Error::read_only(key, &self.store_name()))
    }
    fn contains(&self, key: &Key) -> Result<bool, Error> {
        self.store.contains(key)
    }
    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        self.store.is_dir(key)
    }
    fn keys(&self) -> Result<Vec<Key>, Error> {
        self.store.keys()
    }
    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.store.listdir(key)
    }
    fn makedir(&self, key: &Key) -> Result<(), Error> {
        Err(Error::read_only(key, &self.store_name()))
    }
    fn is_supported(&self, key: &Key) -> bool {
        self.store.is_supported(key)
    }
}

pub type StoreListener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Wrapper notifying registered listeners about changes.
/// Listeners see every change of the wrapped stores, including those not made through this wrapper.
pub struct ObservableStore {
    store: Arc<dyn Store>,
    listeners: RwLock<Vec<StoreListener>>,
    parent: ParentLink,
}

impl ObservableStore {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            link_parent(me, store.as_ref());
            ObservableStore {
                store,
                listeners: RwLock::new(Vec::new()),
                parent: ParentLink::default(),
            }
        })
    }

    pub fn add_listener(&self, listener: StoreListener) -> Result<(), Error> {
        self.listeners
            .write()
            .map_err(|e| Error::lock_error("store listeners", e))?
            .push(listener);
        Ok(())
    }

    fn notify(&self, event: StoreEvent) {
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener(&event);
            }
        }
        forward_event(self, &event);
    }
}

impl Store for ObservableStore {
    fn store_name(&self) -> String {
        format!("Observable ({})", self.store.store_name())
    }
    fn key_prefix(&self) -> Key {
        self.store.key_prefix()
    }
    parent_link_accessors!();
    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.store.get_bytes(key)
    }
    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.store.get_metadata(key)
    }
    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.store.set(key, data, metadata)
    }
    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.store.set_metadata(key, metadata)
    }
    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.store.remove(key)
    }
    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.store.removedir(key)
    }
    fn contains(&self, key: &Key) -> Result<bool, Error> {
        self.store.contains(key)
    }
    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        self.store.is_dir(key)
    }
    fn keys(&self) -> Result<Vec<Key>, Error> {
        self.store.keys()
    }
    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.store.listdir(key)
    }
    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.store.makedir(key)
    }
    fn is_supported(&self, key: &Key) -> bool {
        self.store.is_supported(key)
    }
    fn on_data_changed(&self, key: &Key) {
        self.notify(StoreEvent::DataChanged(key.clone()));
    }
    fn on_metadata_changed(&self, key: &Key) {
        self.notify(StoreEvent::MetadataChanged(key.clone()));
    }
    fn on_removed(&self, key: &Key) {
        self.notify(StoreEvent::Removed(key.clone()));
    }
}

/// Overlay store combines two stores: overlay and fallback.
/// Overlay is used as a primary store for reading and writing.
/// The fallback is only read, when the key is not in the overlay and was not removed.
/// Removal of a key present in the fallback is remembered, the fallback is never modified.
pub struct OverlayStore {
    overlay: Arc<dyn Store>,
    fallback: Arc<dyn Store>,
    removed: Mutex<HashSet<Key>>,
    parent: ParentLink,
}

impl OverlayStore {
    pub fn new(overlay: Arc<dyn Store>, fallback: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            link_parent(me, overlay.as_ref());
            link_parent(me, fallback.as_ref());
            OverlayStore {
                overlay,
                fallback,
                removed: Mutex::new(HashSet::new()),
                parent: ParentLink::default(),
            }
        })
    }

    fn is_removed(&self, key: &Key) -> bool {
        match self.removed.lock() {
            Ok(removed) => removed.iter().any(|r| key.has_key_prefix(r)),
            Err(_) => false,
        }
    }

    fn restore(&self, key: &Key) -> Result<(), Error> {
        let mut removed = self
            .removed
            .lock()
            .map_err(|e| Error::lock_error("overlay store", e))?;
        let mut k = key.clone();
        while !k.is_empty() {
            removed.remove(&k);
            k = k.parent();
        }
        Ok(())
    }

    fn tombstone(&self, key: &Key) -> Result<(), Error> {
        self.removed
            .lock()
            .map_err(|e| Error::lock_error("overlay store", e))?
            .insert(key.clone());
        Ok(())
    }

    fn source(&self, key: &Key) -> Result<&Arc<dyn Store>, Error> {
        if self.is_removed(key) {
            return Err(Error::key_not_found(key));
        }
        if self.overlay.contains(key)? {
            Ok(&self.overlay)
        } else {
            Ok(&self.fallback)
        }
    }
}

impl Store for OverlayStore {
    fn store_name(&self) -> String {
        format!(
            "Overlay of ({}) over ({})",
            self.overlay.store_name(),
            self.fallback.store_name()
        )
    }

    parent_link_accessors!();

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.source(key)?.get_bytes(key)
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.source(key)?.get_metadata(key)
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.restore(key)?;
        self.overlay.set(key, data, metadata)
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.restore(key)?;
        self.overlay.set_metadata(key, metadata)
    }

    // Removal from the overlay is reported by the overlay itself,
    // hiding a fallback key is reported here.
    fn remove(&self, key: &Key) -> Result<(), Error> {
        if self.is_removed(key) {
            return Ok(());
        }
        let in_overlay = self.overlay.contains(key)?;
        if in_overlay {
            self.overlay.remove(key)?;
        }
        if self.fallback.contains(key)? {
            self.tombstone(key)?;
            if !in_overlay {
                self.on_removed(key);
            }
        }
        Ok(())
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        if self.contains(key)? {
            if !self.listdir(key)?.is_empty() {
                return Err(Error::key_write_error(
                    key,
                    &self.store_name(),
                    "directory is not empty",
                ));
            }
            let in_overlay = self.overlay.contains(key)?;
            if in_overlay {
                self.overlay.removedir(key)?;
            }
            if self.fallback.contains(key)? {
                self.tombstone(key)?;
                if !in_overlay {
                    self.on_removed(key);
                }
            }
        }
        Ok(())
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        if self.is_removed(key) {
            return Ok(false);
        }
        Ok(self.overlay.contains(key)? || self.fallback.contains(key)?)
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        if self.is_removed(key) {
            return Ok(false);
        }
        self.source(key)?.is_dir(key)
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        let mut keys: Vec<Key> = self
            .overlay
            .keys()?
            .into_iter()
            .chain(self.fallback.keys()?)
            .filter(|k| !self.is_removed(k))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        sort_keys(&mut keys);
        Ok(keys)
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        if self.is_removed(key) {
            return Err(Error::key_not_found(key));
        }
        let mut names = BTreeSet::new();
        if self.overlay.is_dir(key)? {
            names.extend(self.overlay.listdir(key)?);
        }
        if self.fallback.is_dir(key)? {
            names.extend(self.fallback.listdir(key)?);
        }
        Ok(names
            .into_iter()
            .filter(|name| !self.is_removed(&key.join(name)))
            .collect())
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.restore(key)?;
        self.overlay.makedir(key)
    }

    fn is_supported(&self, key: &Key) -> bool {
        self.overlay.is_supported(key) || self.fallback.is_supported(key)
    }
}

/// Bidirectional key translation used by [KeyTranslatingStore]
pub trait KeyTranslation: Send + Sync {
    /// Translate an outer key to the key of the substore, None if not supported
    fn translate(&self, key: &Key) -> Option<Key>;
    /// Translate a substore key to the outer key
    fn inverse(&self, key: &Key) -> Key;
    fn describe(&self) -> String {
        "key translation".to_owned()
    }
}

/// Store exposing a substore under translated keys
pub struct KeyTranslatingStore<T: KeyTranslation> {
    substore: Arc<dyn Store>,
    translation: T,
    parent: ParentLink,
}

impl<T: KeyTranslation + 'static> KeyTranslatingStore<T> {
    pub fn with_translation(substore: Arc<dyn Store>, translation: T) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            link_parent(me, substore.as_ref());
            KeyTranslatingStore {
                substore,
                translation,
                parent: ParentLink::default(),
            }
        })
    }

    pub fn substore(&self) -> &Arc<dyn Store> {
        &self.substore
    }

    fn translate(&self, key: &Key) -> Result<Key, Error> {
        self.translation
            .translate(key)
            .ok_or_else(|| Error::key_not_supported(key, &self.store_name()))
    }
}

impl<T: KeyTranslation + 'static> Store for KeyTranslatingStore<T> {
    fn store_name(&self) -> String {
        format!("{} on ({})", self.translation.describe(), self.substore.store_name())
    }

    parent_link_accessors!();

    fn from_substore_key(&self, key: &Key) -> Key {
        self.translation.inverse(key)
    }

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.substore
            .get_bytes(&self.translate(key)?)
            .map_err(|e| e.with_key(key))
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        let mut metadata = self
            .substore
            .get_metadata(&self.translate(key)?)
            .map_err(|e| e.with_key(key))?;
        metadata.with_key(&key.encode());
        if let Some(serde_json::Value::String(recipes_key)) = metadata.extra.get("recipes_key") {
            if let Ok(k) = crate::parse::parse_key(recipes_key) {
                let outer = self.translation.inverse(&k).encode();
                metadata
                    .extra
                    .insert("recipes_key".to_owned(), serde_json::Value::String(outer));
            }
        }
        Ok(metadata)
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.substore.set(&self.translate(key)?, data, metadata)
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.substore.set_metadata(&self.translate(key)?, metadata)
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.substore.remove(&self.translate(key)?)
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.substore.removedir(&self.translate(key)?)
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        match self.translation.translate(key) {
            Some(k) => self.substore.contains(&k),
            None => Ok(false),
        }
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        match self.translation.translate(key) {
            Some(k) => self.substore.is_dir(&k),
            None => Ok(false),
        }
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        Ok(self
            .substore
            .keys()?
            .iter()
            .map(|k| self.translation.inverse(k))
            .collect())
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.substore.listdir(&self.translate(key)?)
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.substore.makedir(&self.translate(key)?)
    }

    fn is_supported(&self, key: &Key) -> bool {
        self.translation
            .translate(key)
            .map_or(false, |k| self.substore.is_supported(&k))
    }
}

/// Translation rebasing keys under a prefix
pub struct Prefix(pub Key);

impl KeyTranslation for Prefix {
    fn translate(&self, key: &Key) -> Option<Key> {
        if key.has_key_prefix(&self.0) {
            Some(Key(key.0[self.0.len()..].to_vec()))
        } else {
            None
        }
    }
    fn inverse(&self, key: &Key) -> Key {
        Key(self.0 .0.iter().chain(key.iter()).cloned().collect())
    }
    fn describe(&self) -> String {
        format!("Prefixed store {}", self.0)
    }
}

/// Substore visible under a prefix: key `prefix/x` maps to `x` in the substore
pub type PrefixStore = KeyTranslatingStore<Prefix>;

impl KeyTranslatingStore<Prefix> {
    pub fn new(substore: Arc<dyn Store>, prefix: &Key) -> Arc<Self> {
        KeyTranslatingStore::with_translation(substore, Prefix(prefix.clone()))
    }

    pub fn prefix(&self) -> &Key {
        &self.translation.0
    }
}

/// Routing rule of a [RoutingStore]
pub trait Router: Send + Sync {
    fn route_to(&self, key: &Key) -> Result<Arc<dyn Store>, Error>;

    /// All the stores routed to, used to list keys
    fn routes(&self) -> Vec<Arc<dyn Store>>;

    fn describe(&self) -> String {
        "Routing store".to_owned()
    }
}

/// Store delegating every key to a substore chosen by a router
pub struct RoutingStore<R: Router> {
    router: R,
    parent: ParentLink,
}

impl<R: Router + 'static> RoutingStore<R> {
    pub fn new(router: R) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            for store in router.routes() {
                link_parent(me, store.as_ref());
            }
            RoutingStore {
                router,
                parent: ParentLink::default(),
            }
        })
    }

    pub fn router(&self) -> &R {
        &self.router
    }
}

impl<R: Router> Store for RoutingStore<R> {
    fn store_name(&self) -> String {
        self.router.describe()
    }
    parent_link_accessors!();
    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.router.route_to(key)?.get_bytes(key)
    }
    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        let mut metadata = self.router.route_to(key)?.get_metadata(key)?;
        metadata.with_key(&key.encode());
        Ok(metadata)
    }
    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.router.route_to(key)?.set(key, data, metadata)
    }
    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.router.route_to(key)?.set_metadata(key, metadata)
    }
    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.router.route_to(key)?.remove(key)
    }
    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.router.route_to(key)?.removedir(key)
    }
    fn contains(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        match self.router.route_to(key) {
            Ok(store) => store.contains(key),
            Err(_) => Ok(false),
        }
    }
    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() {
            return Ok(true);
        }
        match self.router.route_to(key) {
            Ok(store) => store.is_dir(key),
            Err(_) => Ok(false),
        }
    }
    fn keys(&self) -> Result<Vec<Key>, Error> {
        let mut keys = HashSet::new();
        for store in self.router.routes() {
            keys.extend(store.keys()?);
        }
        let mut keys: Vec<Key> = keys.into_iter().collect();
        sort_keys(&mut keys);
        Ok(keys)
    }
    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.router.route_to(key)?.listdir(key)
    }
    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.router.route_to(key)?.makedir(key)
    }
    fn is_supported(&self, key: &Key) -> bool {
        self.router
            .route_to(key)
            .map_or(false, |store| store.is_supported(key))
    }
}

/// Store combining a default store with stores mounted under key prefixes.
/// A key is routed to the mount with the longest matching prefix,
/// keys outside of all mounts go to the default store.
pub struct MountPointStore {
    default_store: Option<Arc<dyn Store>>,
    routing_table: RwLock<Vec<(Key, Arc<PrefixStore>)>>,
    me: Weak<MountPointStore>,
    parent: ParentLink,
}

impl MountPointStore {
    pub fn new(default_store: Option<Arc<dyn Store>>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            if let Some(store) = &default_store {
                link_parent(me, store.as_ref());
            }
            MountPointStore {
                default_store,
                routing_table: RwLock::new(Vec::new()),
                me: me.clone(),
                parent: ParentLink::default(),
            }
        })
    }

    /// Mount a store under a key; a previous mount at the same key is replaced
    pub fn mount(&self, key: &Key, store: Arc<dyn Store>) -> Result<&Self, Error> {
        let mut table = self
            .routing_table
            .write()
            .map_err(|e| Error::lock_error("mount table", e))?;
        table.retain(|(k, _)| k != key);
        tracing::debug!(key = %key, store = %store.store_name(), "mount");
        let mounted = PrefixStore::new(store, key);
        link_parent(&self.me, &*mounted);
        table.push((key.clone(), mounted));
        Ok(self)
    }

    /// Remove a mount, returns the mounted store
    pub fn umount(&self, key: &Key) -> Result<Option<Arc<dyn Store>>, Error> {
        let mut table = self
            .routing_table
            .write()
            .map_err(|e| Error::lock_error("mount table", e))?;
        let found = table
            .iter()
            .position(|(k, _)| k == key)
            .map(|i| table.remove(i).1.substore().clone());
        Ok(found)
    }

    pub fn mount_points(&self) -> Vec<Key> {
        self.routing_table
            .read()
            .map(|t| t.iter().map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    fn table(&self) -> Result<Vec<(Key, Arc<PrefixStore>)>, Error> {
        let mut table = self
            .routing_table
            .read()
            .map_err(|e| Error::lock_error("mount table", e))?
            .clone();
        // Stable sort keeps later mounts after earlier ones with the same length
        table.sort_by_key(|(k, _)| std::cmp::Reverse(k.len()));
        Ok(table)
    }

    pub fn route_to(&self, key: &Key) -> Result<Arc<dyn Store>, Error> {
        for (prefix, store) in self.table()? {
            if key.has_key_prefix(&prefix) && store.is_supported(key) {
                return Ok(store);
            }
        }
        match &self.default_store {
            Some(store) => Ok(store.clone()),
            None => Err(Error::key_route_not_found(key, &self.store_name())),
        }
    }

    /// Key is an ancestor of a mount point (or a mount point itself)
    fn is_mount_ancestor(&self, key: &Key) -> bool {
        self.mount_points().iter().any(|p| p.has_key_prefix(key))
    }
}

impl Store for MountPointStore {
    fn store_name(&self) -> String {
        let mounts = self
            .mount_points()
            .iter()
            .map(|k| k.encode())
            .collect::<Vec<_>>()
            .join(", ");
        format!("Mount point store [{}]", mounts)
    }

    parent_link_accessors!();

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        self.route_to(key)?.get_bytes(key)
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        let routed = self.route_to(key).and_then(|store| store.get_metadata(key));
        match routed {
            Ok(mut metadata) => {
                metadata.with_key(&key.encode());
                Ok(metadata)
            }
            Err(e) => {
                if self.is_mount_ancestor(key) {
                    Ok(self.finalize_metadata(self.default_metadata(key, true), key, true, None, false))
                } else {
                    Err(e)
                }
            }
        }
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        self.route_to(key)?.set(key, data, metadata)
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        self.route_to(key)?.set_metadata(key, metadata)
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.route_to(key)?.remove(key)
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.route_to(key)?.removedir(key)
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() || self.is_mount_ancestor(key) {
            return Ok(true);
        }
        match self.route_to(key) {
            Ok(store) => store.contains(key),
            Err(_) => Ok(false),
        }
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        if key.is_empty() || self.is_mount_ancestor(key) {
            return Ok(true);
        }
        match self.route_to(key) {
            Ok(store) => store.is_dir(key),
            Err(_) => Ok(false),
        }
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        let mut keys = HashSet::new();
        let mut shadowing: Vec<Key> = Vec::new();
        for (prefix, store) in self.table()? {
            keys.insert(prefix.clone());
            for key in store.keys()? {
                if !shadowing.iter().any(|p| key.has_key_prefix(p)) {
                    keys.insert(key);
                }
            }
            shadowing.push(prefix);
        }
        if let Some(store) = &self.default_store {
            for key in store.keys()? {
                if !shadowing.iter().any(|p| key.has_key_prefix(p)) {
                    keys.insert(key);
                }
            }
        }
        let mut keys: Vec<Key> = keys.into_iter().collect();
        sort_keys(&mut keys);
        Ok(keys)
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        let mut names = BTreeSet::new();
        if let Ok(store) = self.route_to(key) {
            if store.is_dir(key).unwrap_or(false) {
                names.extend(store.listdir(key)?);
            }
        }
        for prefix in self.mount_points() {
            if prefix.len() > key.len() && prefix.has_key_prefix(key) {
                names.insert(prefix[key.len()].name.clone());
            }
        }
        if names.is_empty() && !self.is_dir(key)? {
            return Err(Error::key_not_found(key));
        }
        Ok(names.into_iter().collect())
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.route_to(key)?.makedir(key)
    }

    fn is_supported(&self, key: &Key) -> bool {
        self.route_to(key)
            .map_or(false, |store| store.is_supported(key))
    }
}
