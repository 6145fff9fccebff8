#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt::Display;

use serde_json::Value as JsonValue;

use crate::dependencies::Dependencies;
use crate::error::Error;
use crate::media_type::{file_extension_to_media_type, filename_extension, DEFAULT_MEDIA_TYPE};
use crate::query::Position;

/// Status of a state (or of a resource in a store)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum Status {
    /// Status does not exist or is not available.
    #[serde(rename = "none")]
    None,
    /// Immediately after a submission for background evaluation.
    #[serde(rename = "submitted")]
    Submitted,
    /// Parent (predecessor) is being evaluated.
    #[serde(rename = "parent")]
    EvaluatingParent,
    /// Last action of the query is being evaluated.
    #[serde(rename = "evaluation")]
    Evaluation,
    /// Dependencies (e.g. link parameters) are being evaluated.
    #[serde(rename = "dependencies")]
    EvaluatingDependencies,
    /// Evaluation finished, result not yet stored.
    #[serde(rename = "finished")]
    Finished,
    /// Data is ready.
    #[serde(rename = "ready")]
    Ready,
    /// Evaluation terminated with an error.
    #[serde(rename = "error")]
    Error,
    /// Data is not available, but a recipe exists.
    #[serde(rename = "recipe")]
    Recipe,
    /// Data is not valid anymore and could not be removed.
    #[serde(rename = "obsolete")]
    Obsolete,
    /// Data was created as a side effect of another operation.
    #[serde(rename = "side-effect")]
    SideEffect,
    /// Data exists, but it is expired.
    #[serde(rename = "expired")]
    Expired,
    /// Data comes from an external source or was modified by a user.
    #[serde(rename = "external")]
    External,
}

impl Default for Status {
    fn default() -> Self {
        Self::None
    }
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::None => "none",
            Status::Submitted => "submitted",
            Status::EvaluatingParent => "parent",
            Status::Evaluation => "evaluation",
            Status::EvaluatingDependencies => "dependencies",
            Status::Finished => "finished",
            Status::Ready => "ready",
            Status::Error => "error",
            Status::Recipe => "recipe",
            Status::Obsolete => "obsolete",
            Status::SideEffect => "side-effect",
            Status::Expired => "expired",
            Status::External => "external",
        }
    }

    /// Returns true if data is associated with the status
    pub fn has_data(&self) -> bool {
        matches!(
            self,
            Status::Ready
                | Status::Finished
                | Status::SideEffect
                | Status::Expired
                | Status::External
                | Status::Obsolete
        )
    }

    /// Returns true while the evaluation is in progress
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            Status::Submitted
                | Status::EvaluatingParent
                | Status::Evaluation
                | Status::EvaluatingDependencies
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            Status::Ready | Status::Finished | Status::Error | Status::SideEffect | Status::External
        )
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogEntryKind {
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "command")]
    Command,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub kind: LogEntryKind,
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Query of the context which produced the entry (for child logs)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl LogEntry {
    pub fn new(kind: LogEntryKind, message: String) -> LogEntry {
        LogEntry {
            kind,
            message,
            timestamp: timestamp(),
            position: None,
            traceback: None,
            query: None,
            origin: None,
        }
    }
    pub fn info(message: String) -> LogEntry {
        LogEntry::new(LogEntryKind::Info, message)
    }
    pub fn debug(message: String) -> LogEntry {
        LogEntry::new(LogEntryKind::Debug, message)
    }
    pub fn warning(message: String) -> LogEntry {
        LogEntry::new(LogEntryKind::Warning, message)
    }
    pub fn error(message: String) -> LogEntry {
        LogEntry::new(LogEntryKind::Error, message)
    }
    pub fn command(action: String) -> LogEntry {
        LogEntry::new(LogEntryKind::Command, action)
    }
    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_owned());
        self
    }
    pub fn with_position(mut self, position: &Position) -> Self {
        if !position.is_unknown() {
            self.position = Some(position.clone());
        }
        self
    }
    pub fn with_traceback(mut self, traceback: String) -> Self {
        self.traceback = Some(traceback);
        self
    }
    pub fn with_origin(mut self, origin: &str) -> Self {
        self.origin = Some(origin.to_owned());
        self
    }
    pub fn is_error(&self) -> bool {
        self.kind == LogEntryKind::Error
    }
}

/// Progress of a long running operation
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProgressIndicator {
    pub id: usize,
    pub step: usize,
    #[serde(default)]
    pub total: Option<usize>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    /// Query of the context reporting the progress (for child progress)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl ProgressIndicator {
    pub fn new(id: usize, step: usize, total: Option<usize>, message: &str) -> Self {
        ProgressIndicator {
            id,
            step,
            total,
            message: message.to_owned(),
            timestamp: timestamp(),
            origin: None,
        }
    }
}

/// Record of an executed action with the arguments it received
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct ExtendedCommand {
    pub name: String,
    pub ns: String,
    /// Encoded action request
    pub action: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub arguments: Vec<JsonValue>,
    #[serde(default)]
    pub version: String,
}

/// Link parameter evaluated as an argument
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArgumentQuery {
    /// Link query as written in the action
    pub query: String,
    /// Query actually evaluated (relative links are resolved against the parent query)
    pub resolved: String,
    #[serde(default)]
    pub position: Position,
}

/// Information about the stored file, maintained by stores
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct FileInfo {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem_path: Option<String>,
}

/// Short description of the data, provided by the state type
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DataCharacteristics {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub type_identifier: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

/// How a tool should be embedded in a user interface
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Embedding {
    Iframe,
    Gui,
    Link,
    Tab,
    Window,
}

/// User interface binding attached to metadata by indexers
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tool {
    pub link: String,
    #[serde(default)]
    pub menu: String,
    #[serde(default)]
    pub label: String,
    pub embedding: Embedding,
    #[serde(default)]
    pub priority: i32,
}

fn default_true() -> bool {
    true
}

/// Current time as an ISO-8601 UTC timestamp
pub fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Metadata accompany every state - result of a query evaluation or a resource in a store.
/// All fields have defaults, so any JSON object can be read as metadata;
/// unknown fields are kept in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Metadata {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub type_identifier: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub error: Option<Error>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub child_log: Vec<LogEntry>,
    #[serde(default)]
    pub progress_indicators: Vec<ProgressIndicator>,
    #[serde(default)]
    pub child_progress_indicators: Vec<ProgressIndicator>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub vars: BTreeMap<String, JsonValue>,
    #[serde(default)]
    pub commands: Vec<Vec<String>>,
    #[serde(default)]
    pub extended_commands: Vec<ExtendedCommand>,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default = "default_true")]
    pub caching: bool,
    #[serde(default)]
    pub volatile: bool,
    #[serde(default)]
    pub side_effect: bool,
    #[serde(default)]
    pub html_preview: String,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub updated: Option<String>,
    #[serde(default)]
    pub started: Option<String>,
    #[serde(default)]
    pub parent_query: Option<String>,
    #[serde(default)]
    pub direct_subqueries: Vec<String>,
    #[serde(default)]
    pub argument_queries: Vec<ArgumentQuery>,
    #[serde(default)]
    pub resource_metadata: Option<Box<Metadata>>,
    #[serde(default)]
    pub fileinfo: Option<FileInfo>,
    #[serde(default)]
    pub data_characteristics: Option<DataCharacteristics>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Default for Metadata {
    fn default() -> Self {
        Metadata {
            query: None,
            key: None,
            status: Status::None,
            type_identifier: None,
            message: String::new(),
            is_error: false,
            error: None,
            log: Vec::new(),
            child_log: Vec::new(),
            progress_indicators: Vec::new(),
            child_progress_indicators: Vec::new(),
            title: String::new(),
            description: String::new(),
            filename: None,
            extension: None,
            mimetype: None,
            attributes: BTreeMap::new(),
            vars: BTreeMap::new(),
            commands: Vec::new(),
            extended_commands: Vec::new(),
            dependencies: Dependencies::default(),
            caching: true,
            volatile: false,
            side_effect: false,
            html_preview: String::new(),
            created: None,
            updated: None,
            started: None,
            parent_query: None,
            direct_subqueries: Vec::new(),
            argument_queries: Vec::new(),
            resource_metadata: None,
            fileinfo: None,
            data_characteristics: None,
            tools: Vec::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Metadata {
    pub fn new() -> Metadata {
        Metadata::default()
    }

    pub fn from_error(error: Error) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.with_error(&error);
        metadata
    }

    pub fn from_json(json: &str) -> Result<Metadata, Error> {
        serde_json::from_str(json)
            .map_err(|e| Error::serialization_error("metadata", &e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::serialization_error("metadata", &e.to_string()))
    }

    pub fn to_json_value(&self) -> Result<JsonValue, Error> {
        serde_json::to_value(self)
            .map_err(|e| Error::serialization_error("metadata", &e.to_string()))
    }

    pub fn with_query(&mut self, query: &str) -> &mut Self {
        self.query = Some(query.to_owned());
        self.dependencies.query = query.to_owned();
        self
    }

    pub fn with_key(&mut self, key: &str) -> &mut Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn with_type_identifier(&mut self, type_identifier: &str) -> &mut Self {
        self.type_identifier = Some(type_identifier.to_owned());
        self
    }

    /// Set the status; error status also sets the error flag
    pub fn set_status(&mut self, status: Status) -> &mut Self {
        self.status = status;
        if status == Status::Error {
            self.is_error = true;
        }
        self
    }

    pub fn with_status(&mut self, status: Status) -> &mut Self {
        self.set_status(status)
    }

    /// Set filename together with the extension and the media type derived from it
    pub fn with_filename(&mut self, filename: &str) -> &mut Self {
        self.filename = Some(filename.to_owned());
        self.extension = filename_extension(filename);
        if let Some(extension) = &self.extension {
            self.mimetype = Some(file_extension_to_media_type(extension).to_owned());
        }
        self
    }

    pub fn set_extension(&mut self, extension: &str) -> &mut Self {
        self.extension = Some(extension.to_owned());
        self.mimetype = Some(file_extension_to_media_type(extension).to_owned());
        self
    }

    /// Media type, derived from the extension if not set explicitly
    pub fn media_type(&self) -> String {
        if let Some(mimetype) = &self.mimetype {
            return mimetype.clone();
        }
        self.extension
            .as_ref()
            .map(|ext| file_extension_to_media_type(ext).to_owned())
            .unwrap_or_else(|| DEFAULT_MEDIA_TYPE.to_owned())
    }

    pub fn type_identifier(&self) -> String {
        self.type_identifier.clone().unwrap_or_default()
    }

    pub fn touch(&mut self) -> &mut Self {
        let now = timestamp();
        if self.created.is_none() {
            self.created = Some(now.clone());
        }
        self.updated = Some(now);
        self
    }

    /// Add an entry to the log, the message of the entry becomes the message of the metadata
    pub fn log_entry(&mut self, entry: LogEntry) -> &mut Self {
        if !entry.message.is_empty() && entry.kind != LogEntryKind::Command {
            self.message = entry.message.clone();
        }
        if entry.is_error() {
            self.set_status(Status::Error);
        }
        self.log.push(entry);
        self
    }

    pub fn info(&mut self, message: &str) -> &mut Self {
        self.log_entry(LogEntry::info(message.to_owned()))
    }
    pub fn debug(&mut self, message: &str) -> &mut Self {
        self.log_entry(LogEntry::debug(message.to_owned()))
    }
    pub fn warning(&mut self, message: &str) -> &mut Self {
        self.log_entry(LogEntry::warning(message.to_owned()))
    }
    pub fn error(&mut self, message: &str) -> &mut Self {
        self.log_entry(LogEntry::error(message.to_owned()))
    }

    /// Record an error: error log entry with traceback, error status and the error itself
    pub fn with_error(&mut self, error: &Error) -> &mut Self {
        let mut entry = LogEntry::error(error.to_string())
            .with_position(&error.position)
            .with_traceback(error.traceback_text());
        if let Some(query) = &error.query {
            entry = entry.with_query(query);
        }
        self.log_entry(entry);
        self.error = Some(error.clone());
        self
    }

    /// Remove all the messages from the log
    pub fn clear_log(&mut self) -> &mut Self {
        self.log.clear();
        self.info("Log cleared")
    }

    /// Returns Err with the recorded error if the metadata is in the error state
    pub fn error_result(&self) -> Result<(), Error> {
        if self.is_error || self.status == Status::Error {
            if let Some(error) = &self.error {
                Err(error.clone())
            } else {
                Err(Error::general_error(self.message.clone()))
            }
        } else {
            Ok(())
        }
    }

    pub fn get_attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.get(name).map_or(false, |v| !v.is_null())
    }

    pub fn with_attribute<V: Into<JsonValue>>(&mut self, name: &str, value: V) -> &mut Self {
        self.attributes.insert(name.to_owned(), value.into());
        self
    }

    /// Keep only attributes starting with an uppercase letter.
    /// Those are carried forward from one action to the next.
    pub fn retain_persistent_attributes(&mut self) -> &mut Self {
        self.attributes
            .retain(|k, _| k.chars().next().map_or(false, |c| c.is_uppercase()));
        self
    }

    /// Last error log entry, if any
    pub fn last_error_entry(&self) -> Option<&LogEntry> {
        self.log.iter().rev().find(|e| e.is_error())
    }

    /// Size of the file (maintained by stores)
    pub fn file_size(&self) -> Option<u64> {
        self.fileinfo.as_ref().and_then(|f| f.size)
    }

    pub fn is_dir(&self) -> bool {
        self.fileinfo.as_ref().map_or(false, |f| f.is_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(serde_json::to_string(&Status::SideEffect)?, "\"side-effect\"");
        assert_eq!(serde_json::to_string(&Status::EvaluatingParent)?, "\"parent\"");
        let s: Status = serde_json::from_str("\"ready\"")?;
        assert_eq!(s, Status::Ready);
        assert_eq!(Status::Recipe.to_string(), "recipe");
        Ok(())
    }

    #[test]
    fn metadata_from_empty_json() -> Result<(), Error> {
        let metadata = Metadata::from_json("{}")?;
        assert_eq!(metadata.status, Status::None);
        assert!(metadata.caching);
        assert!(metadata.log.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_fields_are_kept() -> Result<(), Error> {
        let metadata = Metadata::from_json(r#"{"status":"ready","custom":{"a":1}}"#)?;
        assert_eq!(metadata.status, Status::Ready);
        assert_eq!(metadata.extra.get("custom").unwrap()["a"], 1);
        let json = metadata.to_json()?;
        assert!(json.contains("\"custom\""));
        Ok(())
    }

    #[test]
    fn error_sets_status() {
        let mut metadata = Metadata::new();
        metadata.info("Starting");
        assert_eq!(metadata.message, "Starting");
        metadata.with_error(&Error::execution_error("Failed".to_owned()).with_frame("action 'x'"));
        assert!(metadata.is_error);
        assert_eq!(metadata.status, Status::Error);
        let entry = metadata.last_error_entry().unwrap();
        assert!(entry.traceback.as_ref().unwrap().contains("action 'x'"));
        let e = metadata.error_result().unwrap_err();
        assert_eq!(e.message, "Failed");
    }

    #[test]
    fn filename_sets_media_type() {
        let mut metadata = Metadata::new();
        metadata.with_filename("data.CSV");
        assert_eq!(metadata.extension, Some("csv".to_owned()));
        assert_eq!(metadata.media_type(), "text/csv");
    }

    #[test]
    fn persistent_attributes() {
        let mut metadata = Metadata::new();
        metadata.with_attribute("ABC", 1).with_attribute("abc", 2);
        metadata.retain_persistent_attributes();
        assert!(metadata.has_attribute("ABC"));
        assert!(!metadata.has_attribute("abc"));
    }
}
