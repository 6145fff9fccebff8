#![allow(unused_imports)]
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::metadata::{Embedding, Metadata, Tool};
use crate::query::{Key, Query};
use crate::value::Value;

/// Indexer visits data and metadata when a state is created.
/// It can extend the metadata (e.g. with tools usable for the data)
/// or feed an external index. It must return valid metadata,
/// at least the metadata it received.
pub trait Indexer: Send + Sync {
    /// Identifier of the indexer, unique within a registry
    fn identifier(&self) -> String;

    fn index(
        &self,
        key: Option<&Key>,
        query: Option<&Query>,
        data: Option<&Value>,
        metadata: Metadata,
    ) -> Metadata;
}

/// Ordered collection of indexers, invoked in registration order
#[derive(Clone, Default)]
pub struct IndexerRegistry {
    indexers: Vec<Arc<dyn Indexer>>,
}

impl IndexerRegistry {
    pub fn new() -> Self {
        IndexerRegistry {
            indexers: Vec::new(),
        }
    }

    /// Registry with the tool indexer installed
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AssureTools));
        registry
    }

    /// Register an indexer.
    /// An indexer with the same identifier is replaced and moved to the end.
    pub fn register(&mut self, indexer: Arc<dyn Indexer>) -> &mut Self {
        let identifier = indexer.identifier();
        self.indexers.retain(|i| i.identifier() != identifier);
        self.indexers.push(indexer);
        self
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.indexers.iter().map(|i| i.identifier()).collect()
    }

    pub fn len(&self) -> usize {
        self.indexers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexers.is_empty()
    }
}

impl Indexer for IndexerRegistry {
    fn identifier(&self) -> String {
        "IndexerRegistry".to_owned()
    }

    fn index(
        &self,
        key: Option<&Key>,
        query: Option<&Query>,
        data: Option<&Value>,
        mut metadata: Metadata,
    ) -> Metadata {
        for indexer in self.indexers.iter() {
            metadata = indexer.index(key, query, data, metadata);
        }
        metadata
    }
}

fn sort_tools(tools: &mut Vec<Tool>) {
    tools.sort_by(|a, b| b.priority.cmp(&a.priority));
}

/// Keeps the tools of the metadata well formed:
/// one tool per link, highest priority first.
pub struct AssureTools;

impl Indexer for AssureTools {
    fn identifier(&self) -> String {
        "AssureTools".to_owned()
    }

    fn index(
        &self,
        _key: Option<&Key>,
        _query: Option<&Query>,
        _data: Option<&Value>,
        mut metadata: Metadata,
    ) -> Metadata {
        let mut tools: Vec<Tool> = Vec::with_capacity(metadata.tools.len());
        for tool in metadata.tools.drain(..) {
            if let Some(existing) = tools.iter_mut().find(|t| t.link == tool.link) {
                *existing = tool;
            } else {
                tools.push(tool);
            }
        }
        sort_tools(&mut tools);
        metadata.tools = tools;
        metadata
    }
}

/// Adds a tool binding to the metadata
pub struct AddTool {
    pub tool: Tool,
}

impl AddTool {
    pub fn new(link: &str, menu: &str, label: &str, embedding: Embedding, priority: i32) -> Self {
        AddTool {
            tool: Tool {
                link: link.to_owned(),
                menu: menu.to_owned(),
                label: label.to_owned(),
                embedding,
                priority,
            },
        }
    }
}

impl Indexer for AddTool {
    fn identifier(&self) -> String {
        format!("AddTool:{}", self.tool.link)
    }

    fn index(
        &self,
        _key: Option<&Key>,
        _query: Option<&Query>,
        _data: Option<&Value>,
        mut metadata: Metadata,
    ) -> Metadata {
        metadata.tools.retain(|t| t.link != self.tool.link);
        metadata.tools.push(self.tool.clone());
        sort_tools(&mut metadata.tools);
        metadata
    }
}

/// Runs the wrapped indexer only when a metadata item has the given value.
/// The item is looked up among the serialized metadata fields.
pub struct MetadataItemEquals {
    pub item: String,
    pub value: JsonValue,
    pub indexer: Arc<dyn Indexer>,
}

impl MetadataItemEquals {
    pub fn new<V: Into<JsonValue>>(item: &str, value: V, indexer: Arc<dyn Indexer>) -> Self {
        MetadataItemEquals {
            item: item.to_owned(),
            value: value.into(),
            indexer,
        }
    }
}

impl Indexer for MetadataItemEquals {
    fn identifier(&self) -> String {
        format!("{}[{}={}]", self.indexer.identifier(), self.item, self.value)
    }

    fn index(
        &self,
        key: Option<&Key>,
        query: Option<&Query>,
        data: Option<&Value>,
        metadata: Metadata,
    ) -> Metadata {
        let matches = metadata
            .to_json_value()
            .ok()
            .and_then(|json| json.get(&self.item).cloned())
            .map_or(false, |v| v == self.value);
        if matches {
            self.indexer.index(key, query, data, metadata)
        } else {
            metadata
        }
    }
}
