#![allow(unused_imports)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::command_metadata::{
    ArgumentInfo, ArgumentType, CommandMetadata, CommandMetadataRegistry, DefaultValue,
};
use crate::context::Context;
use crate::error::{Error, ErrorType};
use crate::query::{ActionRequest, Position, Query};
use crate::state::State;
use crate::value::{parse_bool, Value};

/// Link parameter after evaluation: the value bound to the position of the link in the query
#[derive(Debug, Clone)]
pub struct ExpandedActionParameter {
    pub link: Query,
    pub state: State,
    pub position: Position,
}

/// Action parameter with links already evaluated
#[derive(Debug, Clone)]
pub enum ResolvedParameter {
    Text(String, Position),
    Expanded(ExpandedActionParameter),
}

impl ResolvedParameter {
    pub fn position(&self) -> Position {
        match self {
            ResolvedParameter::Text(_, position) => position.clone(),
            ResolvedParameter::Expanded(e) => e.position.clone(),
        }
    }

    pub fn is_volatile(&self) -> bool {
        match self {
            ResolvedParameter::Text(_, _) => false,
            ResolvedParameter::Expanded(e) => e.state.is_volatile(),
        }
    }

    /// Raw value, without any conversion
    pub fn value(&self) -> Value {
        match self {
            ResolvedParameter::Text(text, _) => Value::Text(text.clone()),
            ResolvedParameter::Expanded(e) => (*e.state.data).clone(),
        }
    }

    fn describe(&self) -> String {
        match self {
            ResolvedParameter::Text(text, _) => text.clone(),
            ResolvedParameter::Expanded(e) => format!("~X~{}~E", e.link.encode()),
        }
    }
}

/// Argument bound to the command parameter
#[derive(Debug, Clone)]
pub struct BoundArgument {
    pub name: String,
    /// None for injected arguments (context)
    pub value: Option<Value>,
    pub position: Position,
}

/// Encapsulates the action parameters, that are passed to the command
/// when it is executed.
#[derive(Debug, Clone, Default)]
pub struct CommandArguments {
    pub arguments: Vec<BoundArgument>,
    pub action_position: Position,
}

impl CommandArguments {
    pub fn new(action_position: Position) -> Self {
        CommandArguments {
            arguments: Vec::new(),
            action_position,
        }
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    pub fn push(&mut self, name: &str, value: Value, position: Position) -> &mut Self {
        self.arguments.push(BoundArgument {
            name: name.to_owned(),
            value: Some(value),
            position,
        });
        self
    }

    pub fn push_injected(&mut self, name: &str) -> &mut Self {
        self.arguments.push(BoundArgument {
            name: name.to_owned(),
            value: None,
            position: Position::unknown(),
        });
        self
    }

    pub fn parameter_position(&self, i: usize) -> Position {
        match self.arguments.get(i) {
            Some(a) if !a.position.is_unknown() => a.position.clone(),
            _ => self.action_position.clone(),
        }
    }

    pub fn get_value(&self, i: usize, name: &str) -> Result<&Value, Error> {
        match self.arguments.get(i) {
            Some(BoundArgument {
                value: Some(value), ..
            }) => Ok(value),
            Some(_) => Err(Error::general_error(format!(
                "Inconsistent parameter type - injected found, value expected for '{}'",
                name
            ))
            .with_position(&self.action_position)),
            None => Err(Error::missing_argument(i, name, &self.action_position)),
        }
    }

    /// Argument converted to the required type; conversion errors carry the argument position
    pub fn get<T: TryFrom<Value, Error = Error>>(&self, i: usize, name: &str) -> Result<T, Error> {
        let value = self.get_value(i, name)?.clone();
        T::try_from(value).map_err(|e| e.with_position(&self.parameter_position(i)))
    }

    /// Like [CommandArguments::get], but a none value gives None
    pub fn get_optional<T: TryFrom<Value, Error = Error>>(
        &self,
        i: usize,
        name: &str,
    ) -> Result<Option<T>, Error> {
        let value = self.get_value(i, name)?;
        if value.is_none() {
            Ok(None)
        } else {
            self.get(i, name).map(Some)
        }
    }

    /// Values of a list or a multiple argument
    pub fn get_list(&self, i: usize, name: &str) -> Result<Vec<Value>, Error> {
        match self.get_value(i, name)? {
            Value::Array(a) => Ok(a.clone()),
            Value::None => Ok(Vec::new()),
            other => Ok(vec![other.clone()]),
        }
    }

    /// Arguments as JSON for the extended command record.
    /// Long or binary values are abbreviated.
    pub fn to_json(&self) -> Vec<JsonValue> {
        self.arguments
            .iter()
            .map(|a| match &a.value {
                None => JsonValue::Null,
                Some(Value::Bytes(b)) => JsonValue::String(format!("<{} bytes>", b.len())),
                Some(v) => match v.try_into_json_value() {
                    Ok(json) => {
                        let text = json.to_string();
                        if text.len() > 100 {
                            JsonValue::String(format!("{}...", text.chars().take(50).collect::<String>()))
                        } else {
                            json
                        }
                    }
                    Err(_) => JsonValue::Null,
                },
            })
            .collect()
    }
}

fn convert_argument(info: &ArgumentInfo, parameter: &ResolvedParameter) -> Result<Value, Error> {
    let position = parameter.position();
    let parse_error = |value: &str, expected: &str| {
        Error::argument_parse_error(&info.name, value, expected, &position)
    };
    match parameter {
        ResolvedParameter::Text(text, _) => match info.argument_type {
            ArgumentType::Integer => text
                .parse::<i64>()
                .map(Value::I64)
                .map_err(|_| parse_error(text, "integer")),
            ArgumentType::Float => text
                .parse::<f64>()
                .map(Value::F64)
                .map_err(|_| parse_error(text, "float")),
            ArgumentType::Boolean => Ok(Value::Bool(parse_bool(text))),
            _ => Ok(Value::Text(text.clone())),
        },
        ResolvedParameter::Expanded(e) => {
            let value = e.state.get()?;
            match info.argument_type {
                ArgumentType::Integer => value
                    .try_into_i64()
                    .map(Value::I64)
                    .map_err(|_| parse_error(&parameter.describe(), "integer")),
                ArgumentType::Float => value
                    .try_into_f64()
                    .map(Value::F64)
                    .map_err(|_| parse_error(&parameter.describe(), "float")),
                ArgumentType::Boolean => value
                    .try_into_bool()
                    .map(Value::Bool)
                    .map_err(|_| parse_error(&parameter.describe(), "bool")),
                ArgumentType::String => value
                    .try_into_string()
                    .map(Value::Text)
                    .map_err(|_| parse_error(&parameter.describe(), "string")),
                _ => Ok(value.clone()),
            }
        }
    }
}

fn default_argument(info: &ArgumentInfo, default: &JsonValue) -> Value {
    let value = Value::from_json_value(default);
    match (info.argument_type, &value) {
        (ArgumentType::Float, Value::I64(n)) => Value::F64(*n as f64),
        _ => value,
    }
}

/// Bind action parameters to the command arguments.
///
/// Context arguments are injected and do not consume a parameter.
/// A list or a multiple argument swallows all the remaining parameters as raw values.
/// Missing arguments get their default; a missing argument without a default and unused
/// parameters are errors carrying the position of the action or of the offending parameter.
pub fn parse_arguments(
    metadata: &CommandMetadata,
    parameters: &[ResolvedParameter],
    action_position: &Position,
) -> Result<CommandArguments, Error> {
    let mut arguments = CommandArguments::new(action_position.clone());
    let mut i = 0;
    for (n, info) in metadata.arguments.iter().enumerate() {
        if info.argument_type.is_injected() {
            arguments.push_injected(&info.name);
            continue;
        }
        if info.multiple || info.argument_type == ArgumentType::List {
            let position = parameters
                .get(i)
                .map(|p| p.position())
                .unwrap_or_else(|| action_position.clone());
            let values: Vec<Value> = parameters[i.min(parameters.len())..]
                .iter()
                .map(|p| p.value())
                .collect();
            i = parameters.len();
            if values.is_empty() {
                if let DefaultValue::Value(default) = &info.default {
                    if !default.is_null() {
                        arguments.push(&info.name, default_argument(info, default), position);
                        continue;
                    }
                }
            }
            arguments.push(&info.name, Value::Array(values), position);
            continue;
        }
        if let Some(parameter) = parameters.get(i) {
            let value = convert_argument(info, parameter)?;
            arguments.push(&info.name, value, parameter.position());
            i += 1;
        } else {
            match &info.default {
                DefaultValue::Value(default) => {
                    arguments.push(
                        &info.name,
                        default_argument(info, default),
                        action_position.clone(),
                    );
                }
                DefaultValue::NoDefault => {
                    return Err(Error::missing_argument(n, &info.name, action_position));
                }
            }
        }
    }
    if i < parameters.len() {
        return Err(Error::too_many_parameters(
            &metadata.name,
            parameters.len() - i,
            &parameters[i].position(),
        ));
    }
    Ok(arguments)
}

pub type CommandFunction =
    dyn Fn(&State, &CommandArguments, &mut Context<'_>) -> Result<Value, Error> + Send + Sync;

/// Registered command: metadata together with the executor
#[derive(Clone)]
pub struct Command {
    pub metadata: CommandMetadata,
    executor: Arc<CommandFunction>,
}

impl Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Command {
    pub fn new<F>(metadata: CommandMetadata, f: F) -> Self
    where
        F: Fn(&State, &CommandArguments, &mut Context<'_>) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        Command {
            metadata,
            executor: Arc::new(f),
        }
    }

    pub fn execute(
        &self,
        state: &State,
        arguments: &CommandArguments,
        context: &mut Context<'_>,
    ) -> Result<Value, Error> {
        (self.executor)(state, arguments, context)
    }
}

/// Registry of commands, addressed by namespace and name
#[derive(Default, Clone)]
pub struct CommandRegistry {
    commands: HashMap<(String, String), Arc<Command>>,
    pub command_metadata_registry: CommandMetadataRegistry,
}

impl CommandRegistry {
    pub fn new() -> Self {
        CommandRegistry {
            commands: HashMap::new(),
            command_metadata_registry: CommandMetadataRegistry::new(),
        }
    }

    /// Register a command.
    /// A command already registered under the same namespace and name can only be replaced
    /// by the same descriptor (same version) or when the new metadata has the `modify_command` attribute.
    /// Metadata without a version get one computed from the descriptor.
    pub fn register<F>(&mut self, metadata: CommandMetadata, f: F) -> Result<&mut Self, Error>
    where
        F: Fn(&State, &CommandArguments, &mut Context<'_>) -> Result<Value, Error>
            + Send
            + Sync
            + 'static,
    {
        self.register_command(Command::new(metadata, f))
    }

    pub fn register_command(&mut self, mut command: Command) -> Result<&mut Self, Error> {
        if command.metadata.version.is_empty() {
            command.metadata.with_version("");
        }
        let metadata = &command.metadata;
        let issues = metadata.check();
        if let Some(issue) = issues.iter().find(|i| i.is_error) {
            return Err(Error::configuration_error(format!(
                "Command '{}' in namespace '{}' can't be registered: {}",
                metadata.name, metadata.namespace, issue.message
            )));
        }
        for issue in issues.iter() {
            tracing::warn!(namespace = %issue.namespace, command = %issue.name, "{}", issue.message);
        }
        let key = (metadata.namespace.clone(), metadata.name.clone());
        if let Some(registered) = self.commands.get(&key) {
            let same = registered.metadata.version == metadata.version;
            if !same && !metadata.is_modify_command() {
                return Err(Error::command_already_registered(
                    &metadata.namespace,
                    &metadata.name,
                ));
            }
            tracing::debug!(namespace = %metadata.namespace, command = %metadata.name, "command re-registered");
        }
        self.command_metadata_registry.add_command(metadata);
        self.commands.insert(key, Arc::new(command));
        Ok(self)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<Command>> {
        self.commands
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Walk the namespaces in order, first hit wins
    pub fn resolve(&self, namespaces: &[String], name: &str) -> Option<Arc<Command>> {
        namespaces.iter().find_map(|ns| self.get(ns, name))
    }

    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.commands
            .contains_key(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_metadata::ArgumentInfo;

    fn text(s: &str, offset: usize) -> ResolvedParameter {
        ResolvedParameter::Text(s.to_owned(), Position::new(offset, 1, offset + 1))
    }

    fn add_metadata() -> CommandMetadata {
        let mut cm = CommandMetadata::new("add");
        cm.with_argument(ArgumentInfo::integer_argument("y").with_default(1));
        cm
    }

    #[test]
    fn parse_with_default() -> Result<(), Error> {
        let cm = add_metadata();
        let args = parse_arguments(&cm, &[], &Position::new(8, 1, 9))?;
        assert_eq!(args.get::<i64>(0, "y")?, 1);
        let args = parse_arguments(&cm, &[text("5", 12)], &Position::new(8, 1, 9))?;
        assert_eq!(args.get::<i64>(0, "y")?, 5);
        assert_eq!(args.parameter_position(0).offset, 12);
        Ok(())
    }

    #[test]
    fn parse_error_has_position() {
        let cm = add_metadata();
        let err = parse_arguments(&cm, &[text("x1", 12)], &Position::new(8, 1, 9)).unwrap_err();
        assert_eq!(err.error_type, ErrorType::ArgumentParseError);
        assert_eq!(err.position.offset, 12);
        let err = parse_arguments(&cm, &[text("1", 12), text("2", 14)], &Position::new(8, 1, 9))
            .unwrap_err();
        assert_eq!(err.error_type, ErrorType::TooManyParameters);
        assert_eq!(err.position.offset, 14);
    }

    #[test]
    fn missing_argument() {
        let mut cm = CommandMetadata::new("value");
        cm.with_argument(ArgumentInfo::integer_argument("x"));
        let err = parse_arguments(&cm, &[], &Position::new(0, 1, 1)).unwrap_err();
        assert_eq!(err.error_type, ErrorType::ArgumentMissing);
    }

    #[test]
    fn multiple_and_context() -> Result<(), Error> {
        let mut cm = CommandMetadata::new("join");
        cm.with_argument(ArgumentInfo::boolean_argument("flag"))
            .with_argument(ArgumentInfo::context_argument())
            .with_argument(ArgumentInfo::string_argument("items").multiple());
        let args = parse_arguments(
            &cm,
            &[text("yes", 5), text("a", 9), text("b", 11)],
            &Position::new(0, 1, 1),
        )?;
        assert_eq!(args.len(), 3);
        assert!(args.get::<bool>(0, "flag")?);
        assert!(args.get_value(1, "context").is_err());
        let mut flag = CommandMetadata::new("flag");
        flag.with_argument(ArgumentInfo::boolean_argument("b"));
        for (parameter, expected) in [("t", true), ("TRUE", true), ("1", false), ("n", false)] {
            let args = parse_arguments(&flag, &[text(parameter, 5)], &Position::new(0, 1, 1))?;
            assert_eq!(args.get::<bool>(0, "b")?, expected);
        }
        assert_eq!(
            args.get_list(2, "items")?,
            vec![Value::from("a"), Value::from("b")]
        );
        Ok(())
    }

    #[test]
    fn registration_rules() -> Result<(), Error> {
        let mut registry = CommandRegistry::new();
        let mut cm = add_metadata();
        cm.with_version("1");
        registry.register(cm.clone(), |_, _, _| Ok(Value::I64(1)))?;
        // same descriptor
        registry.register(cm.clone(), |_, _, _| Ok(Value::I64(2)))?;
        let mut other = add_metadata();
        other.with_version("2");
        let err = registry
            .register(other.clone(), |_, _, _| Ok(Value::I64(3)))
            .err()
            .map(|e| e.error_type);
        assert_eq!(err, Some(ErrorType::CommandAlreadyRegistered));
        other.modify_command().with_version("2");
        registry.register(other, |_, _, _| Ok(Value::I64(3)))?;
        assert_eq!(registry.len(), 1);
        assert!(registry
            .resolve(&["pd".to_owned(), "root".to_owned()], "add")
            .is_some());
        Ok(())
    }
}
