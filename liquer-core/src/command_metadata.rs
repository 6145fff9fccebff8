#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fmt::Display;

use crate::dependencies::{Dependencies, Version};
use crate::error::Error;
use serde_json::Value as JsonValue;

pub const DEFAULT_NAMESPACE: &str = "root";

/// A structure holding a description of an identified issue with a command registration
/// Issue can be either a warning or an error (when is_error is true)
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandRegistryIssue {
    pub namespace: String,
    pub name: String,
    pub is_error: bool,
    pub message: String,
}

impl CommandRegistryIssue {
    pub fn new(namespace: &str, name: &str, is_error: bool, message: String) -> Self {
        CommandRegistryIssue {
            namespace: namespace.to_string(),
            name: name.to_string(),
            is_error,
            message,
        }
    }
    pub fn warning(namespace: &str, name: &str, message: String) -> Self {
        CommandRegistryIssue::new(namespace, name, false, message)
    }
    pub fn error(namespace: &str, name: &str, message: String) -> Self {
        CommandRegistryIssue::new(namespace, name, true, message)
    }
}

/// Kind of an argument, determines how the textual parameter is converted
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    #[serde(rename = "str")]
    String,
    #[serde(rename = "int")]
    Integer,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "bool")]
    Boolean,
    /// Swallows all the remaining parameters as a single list value
    #[serde(rename = "list")]
    List,
    /// Evaluation context, injected
    #[serde(rename = "context")]
    Context,
    /// Value passed as it is (text or the value of a link)
    #[serde(rename = "any")]
    Any,
}

impl ArgumentType {
    pub fn is_injected(&self) -> bool {
        matches!(self, ArgumentType::Context)
    }
    pub fn name(&self) -> &'static str {
        match self {
            ArgumentType::String => "str",
            ArgumentType::Integer => "int",
            ArgumentType::Float => "float",
            ArgumentType::Boolean => "bool",
            ArgumentType::List => "list",
            ArgumentType::Context => "context",
            ArgumentType::Any => "any",
        }
    }
}

impl Default for ArgumentType {
    fn default() -> Self {
        ArgumentType::Any
    }
}

/// Hint for a user interface how to edit the argument
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ArgumentGUIInfo {
    TextField(usize),
    TextArea(usize, usize),
    IntegerField,
    FloatField,
    Checkbox,
    None,
}

impl Default for ArgumentGUIInfo {
    fn default() -> Self {
        ArgumentGUIInfo::TextField(20)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Value(JsonValue),
    NoDefault,
}

impl DefaultValue {
    pub fn null() -> Self {
        DefaultValue::Value(JsonValue::Null)
    }
    pub fn is_null(&self) -> bool {
        match self {
            DefaultValue::Value(value) => value.is_null(),
            _ => false,
        }
    }
    pub fn value(&self) -> Option<&JsonValue> {
        match self {
            DefaultValue::Value(value) => Some(value),
            DefaultValue::NoDefault => None,
        }
    }
}

impl Default for DefaultValue {
    fn default() -> Self {
        DefaultValue::NoDefault
    }
}

/// Converts an identifier to a human readable label,
/// e.g. `user_id` to `User ID`.
pub fn identifier_to_label(identifier: &str) -> String {
    let text = identifier.replace('_', " ").replace(" id", "ID");
    let text = if text == "url" { "URL".to_owned() } else { text };
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => text,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArgumentInfo {
    pub name: String,
    pub label: String,
    pub default: DefaultValue,
    #[serde(rename = "type")]
    pub argument_type: ArgumentType,
    pub optional: bool,
    pub multiple: bool,
    pub editor: ArgumentGUIInfo,
}

impl ArgumentInfo {
    fn with_type(name: &str, argument_type: ArgumentType, editor: ArgumentGUIInfo) -> Self {
        ArgumentInfo {
            name: name.to_string(),
            label: identifier_to_label(name),
            default: DefaultValue::NoDefault,
            argument_type,
            optional: false,
            multiple: false,
            editor,
        }
    }

    pub fn argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::Any, ArgumentGUIInfo::TextField(40))
    }
    pub fn string_argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::String, ArgumentGUIInfo::TextField(40))
    }
    pub fn integer_argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::Integer, ArgumentGUIInfo::IntegerField)
    }
    pub fn float_argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::Float, ArgumentGUIInfo::FloatField)
    }
    pub fn boolean_argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::Boolean, ArgumentGUIInfo::Checkbox)
    }
    pub fn list_argument(name: &str) -> Self {
        Self::with_type(name, ArgumentType::List, ArgumentGUIInfo::TextArea(40, 5))
    }
    /// Context argument: optional with a null default, injected during execution
    pub fn context_argument() -> Self {
        let mut a = Self::with_type("context", ArgumentType::Context, ArgumentGUIInfo::None);
        a.default = DefaultValue::null();
        a.optional = true;
        a
    }

    pub fn with_default<V: Into<JsonValue>>(mut self, value: V) -> Self {
        self.default = DefaultValue::Value(value.into());
        self.optional = true;
        self
    }
    pub fn with_default_none(mut self) -> Self {
        self.default = DefaultValue::null();
        self.optional = true;
        self
    }
    pub fn true_by_default(self) -> Self {
        self.with_default(true)
    }
    pub fn false_by_default(self) -> Self {
        self.with_default(false)
    }
    /// Trailing variadic argument
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self.optional = true;
        self
    }
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    fn check(&self, namespace: &str, name: &str, is_last: bool) -> Vec<CommandRegistryIssue> {
        let mut issues = Vec::new();
        if self.argument_type == ArgumentType::Context && self.name != "context" {
            issues.push(CommandRegistryIssue::warning(
                namespace,
                name,
                format!("Context argument should be called 'context', not '{}'", self.name),
            ));
        }
        if self.name == "context" && !(self.optional && self.default.is_null()) {
            issues.push(CommandRegistryIssue::error(
                namespace,
                name,
                "Argument 'context' must be optional with a null default".to_owned(),
            ));
        }
        if (self.multiple || self.argument_type == ArgumentType::List) && !is_last {
            issues.push(CommandRegistryIssue::error(
                namespace,
                name,
                format!("Argument '{}' swallows all parameters, it must be the last one", self.name),
            ));
        }
        issues
    }
}

/// Describes how the command uses the state of the previous action
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StateArgument {
    pub name: String,
    /// Pass the whole state, not just the data
    pub pass_state: bool,
}

/// CommandMetadata describes a command: documentation, arguments, attributes and the version.
/// It does not specify how to execute the command though, this is the role of [crate::commands::Command].
///
/// Commands with a state argument are chained - they receive the result of the previous action.
/// Commands without it are first commands, ignoring the previous data.
///
/// # Example
/// ```
/// use liquer_core::command_metadata::*;
///
/// let mut command = CommandMetadata::new("add");
/// command
///     .with_doc("Add a number")
///     .with_argument(ArgumentInfo::integer_argument("y").with_default(1));
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandMetadata {
    pub namespace: String,
    pub name: String,
    pub label: String,
    pub module: String,
    pub doc: String,
    pub version: String,
    pub state_argument: Option<StateArgument>,
    pub arguments: Vec<ArgumentInfo>,
    pub attributes: BTreeMap<String, JsonValue>,
    pub cache: bool,
    pub volatile: bool,
}

impl CommandMetadata {
    pub fn new(name: &str) -> Self {
        CommandMetadata {
            namespace: DEFAULT_NAMESPACE.to_string(),
            name: name.to_string(),
            label: identifier_to_label(name),
            module: "".to_string(),
            doc: "".to_string(),
            version: "".to_string(),
            state_argument: Some(StateArgument {
                name: "state".to_owned(),
                pass_state: false,
            }),
            arguments: Vec::new(),
            attributes: BTreeMap::new(),
            cache: true,
            volatile: false,
        }
    }

    /// First command - ignores the previous state
    pub fn first(name: &str) -> Self {
        let mut cm = Self::new(name);
        cm.state_argument = None;
        cm
    }

    pub fn check(&self) -> Vec<CommandRegistryIssue> {
        let mut issues = Vec::new();
        if self.name.is_empty() {
            issues.push(CommandRegistryIssue::error(
                &self.namespace,
                &self.name,
                "Command name is empty".to_string(),
            ));
        }
        if self.name == "ns" {
            issues.push(CommandRegistryIssue::error(
                &self.namespace,
                &self.name,
                "Command name 'ns' is reserved".to_string(),
            ));
        }
        let n = self.arguments.len();
        for (i, a) in self.arguments.iter().enumerate() {
            issues.append(&mut a.check(&self.namespace, &self.name, i + 1 == n));
        }
        issues
    }

    pub fn with_argument(&mut self, argument: ArgumentInfo) -> &mut Self {
        self.arguments.push(argument);
        self
    }
    pub fn with_doc(&mut self, doc: &str) -> &mut Self {
        self.doc = doc.to_string();
        self
    }
    pub fn with_namespace(&mut self, namespace: &str) -> &mut Self {
        self.namespace = namespace.to_string();
        self
    }
    pub fn with_label(&mut self, label: &str) -> &mut Self {
        self.label = label.to_string();
        self
    }
    pub fn with_module(&mut self, module: &str) -> &mut Self {
        self.module = module.to_string();
        self
    }
    /// The command receives the whole state instead of the data only
    pub fn with_state_passed(&mut self) -> &mut Self {
        self.state_argument = Some(StateArgument {
            name: "state".to_owned(),
            pass_state: true,
        });
        self
    }
    pub fn with_attribute<V: Into<JsonValue>>(&mut self, name: &str, value: V) -> &mut Self {
        self.attributes.insert(name.to_owned(), value.into());
        self
    }
    /// Allows to replace an already registered command
    pub fn modify_command(&mut self) -> &mut Self {
        self.with_attribute("modify_command", true)
    }
    pub fn is_modify_command(&self) -> bool {
        self.attributes
            .get("modify_command")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
    pub fn volatile(&mut self) -> &mut Self {
        self.volatile = true;
        self.with_attribute("volatile", true)
    }
    pub fn no_cache(&mut self) -> &mut Self {
        self.cache = false;
        self.with_attribute("cache", false)
    }

    pub fn is_first_command(&self) -> bool {
        self.state_argument.is_none()
    }

    /// Attributes transferred to the metadata of the produced state.
    /// Registry bookkeeping attributes are excluded.
    pub fn state_attributes(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.attributes
            .iter()
            .filter(|(k, _)| k.as_str() != "modify_command" && k.as_str() != "ns")
    }

    /// Stable hash over the descriptor: namespace, name, argument names, kinds, defaults
    /// and a code version tag supplied by the author of the command.
    pub fn compute_version(&self, code_version: &str) -> Version {
        let mut text = format!("{}\n{}\n{}\n", self.namespace, self.name, code_version);
        if let Some(sa) = &self.state_argument {
            text.push_str(&format!("state:{}:{}\n", sa.name, sa.pass_state));
        }
        for a in self.arguments.iter() {
            let default = match &a.default {
                DefaultValue::Value(v) => v.to_string(),
                DefaultValue::NoDefault => "-".to_owned(),
            };
            text.push_str(&format!(
                "{}:{}:{}:{}\n",
                a.name,
                a.argument_type.name(),
                default,
                a.multiple
            ));
        }
        Version::from_bytes(text.as_bytes())
    }

    pub fn with_version(&mut self, code_version: &str) -> &mut Self {
        self.version = self.compute_version(code_version).encode();
        self
    }

    pub fn key(&self) -> String {
        Dependencies::command_key(&self.namespace, &self.name)
    }
}

/// Registry holding the metadata of all registered commands.
/// Serialized it is the content of the `commands.json` API endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CommandMetadataRegistry {
    pub commands: Vec<CommandMetadata>,
}

impl CommandMetadataRegistry {
    pub fn new() -> Self {
        CommandMetadataRegistry {
            commands: Vec::new(),
        }
    }

    /// Add or replace command metadata
    pub fn add_command(&mut self, command: &CommandMetadata) -> &mut Self {
        if let Some(cm) = self.get_mut(&command.namespace, &command.name) {
            *cm = command.clone();
        } else {
            self.commands.push(command.to_owned());
        }
        self
    }

    pub fn get_mut(&mut self, namespace: &str, name: &str) -> Option<&mut CommandMetadata> {
        self.commands
            .iter_mut()
            .find(|c| c.namespace == namespace && c.name == name)
    }

    pub fn find_command(&self, namespace: &str, name: &str) -> Option<&CommandMetadata> {
        self.commands
            .iter()
            .find(|c| c.namespace == namespace && c.name == name)
    }

    /// First command found while walking the namespaces in order
    pub fn find_command_in_namespaces(
        &self,
        namespaces: &[String],
        name: &str,
    ) -> Option<&CommandMetadata> {
        namespaces
            .iter()
            .find_map(|ns| self.find_command(ns, name))
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut ns: Vec<String> = self.commands.iter().map(|c| c.namespace.clone()).collect();
        ns.sort();
        ns.dedup();
        ns
    }

    /// Commands grouped by namespace and name
    pub fn as_json_value(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        for c in self.commands.iter() {
            let entry = map
                .entry(c.namespace.clone())
                .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
            if let JsonValue::Object(ns) = entry {
                ns.insert(
                    c.name.clone(),
                    serde_json::to_value(c).unwrap_or(JsonValue::Null),
                );
            }
        }
        JsonValue::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert_eq!(identifier_to_label("hello_world"), "Hello world");
        assert_eq!(identifier_to_label("user_id"), "UserID");
        assert_eq!(identifier_to_label("url"), "URL");
    }

    #[test]
    fn check_reports_issues() {
        let mut cm = CommandMetadata::new("ns");
        cm.with_argument(ArgumentInfo::list_argument("a"))
            .with_argument(ArgumentInfo::string_argument("b"));
        let issues = cm.check();
        assert_eq!(issues.iter().filter(|i| i.is_error).count(), 2);
        let mut cm = CommandMetadata::new("ok");
        cm.with_argument(ArgumentInfo::context_argument());
        assert!(cm.check().is_empty());
    }

    #[test]
    fn version_depends_on_descriptor() {
        let mut a = CommandMetadata::new("add");
        a.with_argument(ArgumentInfo::integer_argument("y").with_default(1));
        let mut b = a.clone();
        assert_eq!(a.compute_version("1"), b.compute_version("1"));
        assert_ne!(a.compute_version("1"), a.compute_version("2"));
        b.arguments[0] = ArgumentInfo::integer_argument("y").with_default(2);
        assert_ne!(a.compute_version("1"), b.compute_version("1"));
    }

    #[test]
    fn find_in_namespaces() {
        let mut registry = CommandMetadataRegistry::new();
        let mut cm = CommandMetadata::new("x");
        cm.with_namespace("pd");
        registry.add_command(&cm);
        registry.add_command(&CommandMetadata::new("x"));
        let namespaces = vec!["pd".to_owned(), "root".to_owned()];
        assert_eq!(
            registry
                .find_command_in_namespaces(&namespaces, "x")
                .map(|c| c.namespace.as_str()),
            Some("pd")
        );
        assert!(registry
            .find_command_in_namespaces(&["root".to_owned()], "y")
            .is_none());
        let json = registry.as_json_value();
        assert!(json["pd"]["x"].is_object());
    }
}
