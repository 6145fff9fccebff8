use itertools::Itertools;

use crate::query::ActionRequest;
use crate::query::Key;
use crate::query::Position;
use std::error;
use std::fmt;
use std::fmt::Display;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Copy)]
pub enum ErrorType {
    ArgumentMissing,
    ArgumentParseError,
    ActionNotRegistered,
    CommandAlreadyRegistered,
    ParseError,
    TooManyParameters,
    ConversionError,
    SerializationError,
    General,
    CacheNotSupported,
    NotSupported,
    NotAvailable,
    KeyNotFound,
    KeyNotSupported,
    KeyRouteNotFound,
    KeyReadError,
    KeyWriteError,
    ReadOnly,
    VersionCollision,
    ConfigurationError,
    UnexpectedError,
    ExecutionError,
}

impl ErrorType {
    /// Short user-visible classification of the error kind
    pub fn classification(&self) -> &'static str {
        match self {
            ErrorType::ParseError => "parse error",
            ErrorType::ActionNotRegistered => "unknown action",
            ErrorType::ArgumentMissing
            | ErrorType::ArgumentParseError
            | ErrorType::TooManyParameters
            | ErrorType::ConversionError => "argument parse",
            ErrorType::ExecutionError | ErrorType::General => "command exception",
            ErrorType::NotAvailable | ErrorType::CacheNotSupported => "missing cache entry",
            ErrorType::KeyNotFound => "keyNotFound",
            ErrorType::KeyNotSupported => "keyNotSupported",
            ErrorType::KeyRouteNotFound => "keyRouteNotFound",
            ErrorType::KeyReadError | ErrorType::KeyWriteError => "store i/o",
            ErrorType::ReadOnly => "read only",
            ErrorType::VersionCollision => "version collision",
            ErrorType::CommandAlreadyRegistered => "registration",
            ErrorType::SerializationError => "serialization",
            ErrorType::ConfigurationError => "configuration",
            ErrorType::NotSupported => "not supported",
            ErrorType::UnexpectedError => "unexpected",
        }
    }
}

/// Error used across the evaluation engine, caches and stores.
/// Besides the message it can carry a position in the query, the query and key
/// related to the failure, a cause and a traceback.
/// The traceback is a list of frames recorded while the error travels
/// through the evaluation (outermost frame last).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Error {
    pub error_type: ErrorType,
    pub message: String,
    pub position: Position,
    pub query: Option<String>,
    pub key: Option<String>,
    #[serde(default)]
    pub cause: Option<String>,
    #[serde(default)]
    pub traceback: Vec<String>,
}

impl Error {
    pub fn new(error_type: ErrorType, message: String) -> Self {
        Error {
            error_type,
            message,
            position: Position::unknown(),
            query: None,
            key: None,
            cause: None,
            traceback: Vec::new(),
        }
    }

    pub fn from_error<E: Display>(error_type: ErrorType, error: E) -> Self {
        Error::new(error_type, error.to_string())
    }

    pub fn from_result<T, E: Display>(error_type: ErrorType, result: Result<T, E>) -> Result<T, Self> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(Error::from_error(error_type, e)),
        }
    }

    pub fn with_position(mut self, position: &Position) -> Self {
        self.position = position.clone();
        self
    }
    pub fn with_query(mut self, query: &crate::query::Query) -> Self {
        self.query = Some(query.encode());
        self
    }
    pub fn with_query_text(mut self, query: &str) -> Self {
        self.query = Some(query.to_owned());
        self
    }
    pub fn with_key(mut self, key: &Key) -> Self {
        self.key = Some(key.encode());
        self
    }
    pub fn with_cause<E: Display>(mut self, cause: E) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// Append a traceback frame
    pub fn with_frame<S: Into<String>>(mut self, frame: S) -> Self {
        self.traceback.push(frame.into());
        self
    }

    /// Traceback rendered as text, one frame per line followed by the error itself
    pub fn traceback_text(&self) -> String {
        let mut lines: Vec<String> = self
            .traceback
            .iter()
            .rev()
            .map(|frame| format!("  {}", frame))
            .collect();
        if let Some(cause) = &self.cause {
            lines.push(format!("Caused by: {}", cause));
        }
        lines.push(format!("{:?}: {}", self.error_type, self));
        lines.join("\n")
    }

    /// Constructs an error with the `NotAvailable` error type.
    /// This can be used when Option is converted to a result type.
    pub fn not_available() -> Self {
        Error::new(ErrorType::NotAvailable, "Not available".to_string())
    }
    /// Returns true if the requested item is not available.
    pub fn is_not_available(&self) -> bool {
        self.error_type == ErrorType::NotAvailable
    }
    pub fn cache_not_supported() -> Self {
        Error::new(ErrorType::CacheNotSupported, "Cache not supported".to_string())
    }
    pub fn not_supported(message: String) -> Self {
        Error::new(ErrorType::NotSupported, message)
    }
    pub fn action_not_registered(action: &ActionRequest, namespaces: &[String]) -> Self {
        Error::new(
            ErrorType::ActionNotRegistered,
            format!(
                "Action '{}' not registered in namespaces {}",
                action.name,
                namespaces.iter().map(|ns| format!("'{}'", ns)).join(", ")
            ),
        )
        .with_position(&action.position)
    }
    pub fn command_already_registered(namespace: &str, name: &str) -> Self {
        Error::new(
            ErrorType::CommandAlreadyRegistered,
            format!(
                "Command '{}' is already registered in namespace '{}' with a different version",
                name, namespace
            ),
        )
    }
    pub fn missing_argument(i: usize, name: &str, position: &Position) -> Self {
        Error::new(
            ErrorType::ArgumentMissing,
            format!("Missing argument #{}:{}", i, name),
        )
        .with_position(position)
    }
    pub fn too_many_parameters(action: &str, count: usize, position: &Position) -> Self {
        Error::new(
            ErrorType::TooManyParameters,
            format!("Too many parameters for '{}': {} unused", action, count),
        )
        .with_position(position)
    }
    pub fn argument_parse_error(name: &str, value: &str, expected: &str, position: &Position) -> Self {
        Error::new(
            ErrorType::ArgumentParseError,
            format!(
                "Can't parse argument '{}' from '{}', {} expected",
                name, value, expected
            ),
        )
        .with_position(position)
    }
    pub fn conversion_error<W: Display, T: Display>(what: W, to: T) -> Self {
        Error::new(
            ErrorType::ConversionError,
            format!("Can't convert '{}' to {}", what, to),
        )
    }
    pub fn conversion_error_with_message<W: Display, T: Display>(
        what: W,
        to: T,
        message: &str,
    ) -> Self {
        Error::new(
            ErrorType::ConversionError,
            format!("Can't convert '{}' to {}: {}", what, to, message),
        )
    }
    pub fn serialization_error<S: Display>(type_identifier: S, message: &str) -> Self {
        Error::new(
            ErrorType::SerializationError,
            format!("Serialization of '{}' failed: {}", type_identifier, message),
        )
    }
    pub fn key_parse_error(key: &str, err: &str, position: &Position) -> Self {
        Error::new(
            ErrorType::ParseError,
            format!("Can't parse key '{}': {}", key, err),
        )
        .with_position(position)
    }
    /// Parse error of a query.
    /// The message contains a preview of the query with the failing offset marked.
    pub fn query_parse_error(query: &str, err: &str, position: &Position) -> Self {
        let message = if position.is_unknown() {
            format!("Can't parse query '{}': {}", query, err)
        } else {
            let offset = position.offset.min(query.len());
            let (head, tail) = query.split_at(offset);
            format!("Can't parse query '{}': {} ('{}' >>> '{}')", query, err, head, tail)
        };
        Error::new(ErrorType::ParseError, message)
            .with_position(position)
            .with_query_text(query)
    }
    pub fn general_error(message: String) -> Self {
        Error::new(ErrorType::General, message)
    }
    pub fn unexpected_error(message: String) -> Self {
        Error::new(ErrorType::UnexpectedError, message)
    }
    pub fn configuration_error(message: String) -> Self {
        Error::new(ErrorType::ConfigurationError, message)
    }
    pub fn version_collision(what: &str, name: &str, version1: &str, version2: &str) -> Self {
        Error::new(
            ErrorType::VersionCollision,
            format!(
                "Version collision of {} '{}': '{}' and '{}'",
                what, name, version1, version2
            ),
        )
    }
    pub fn key_not_found(key: &Key) -> Self {
        Error::new(ErrorType::KeyNotFound, format!("Key not found: '{}'", key)).with_key(key)
    }
    pub fn key_not_supported(key: &Key, store_name: &str) -> Self {
        Error::new(
            ErrorType::KeyNotSupported,
            format!("Key '{}' not supported by store {}", key, store_name),
        )
        .with_key(key)
    }
    pub fn key_route_not_found(key: &Key, store_name: &str) -> Self {
        Error::new(
            ErrorType::KeyRouteNotFound,
            format!("No route for key '{}' in store {}", key, store_name),
        )
        .with_key(key)
    }
    pub fn read_only(key: &Key, store_name: &str) -> Self {
        Error::new(
            ErrorType::ReadOnly,
            format!("Key '{}' can't be written: store {} is read only", key, store_name),
        )
        .with_key(key)
    }
    pub fn key_read_error(key: &Key, store_name: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::KeyReadError,
            format!("Key '{}' read error by store {}: {}", key, store_name, message),
        )
        .with_key(key)
    }
    pub fn key_write_error(key: &Key, store_name: &str, message: &(impl Display + ?Sized)) -> Self {
        Error::new(
            ErrorType::KeyWriteError,
            format!("Key '{}' write error by store {}: {}", key, store_name, message),
        )
        .with_key(key)
    }
    pub fn execution_error(message: String) -> Self {
        Error::new(ErrorType::ExecutionError, message)
    }

    /// Error used when a lock protecting a shared registry or backend is poisoned
    pub(crate) fn lock_error<E: Display>(what: &str, e: E) -> Self {
        Error::unexpected_error(format!("Lock of {} poisoned: {}", what, e))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.position.is_unknown() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} at {}", self.message, self.position)
        }
    }
}

impl error::Error for Error {
    fn description(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_position() {
        let e = Error::general_error("Bad thing".to_owned());
        assert_eq!(e.to_string(), "Bad thing");
        let e = e.with_position(&Position::new(3, 1, 4));
        assert_eq!(e.to_string(), "Bad thing at position 4");
    }

    #[test]
    fn traceback_lists_frames() {
        let e = Error::execution_error("boom".to_owned())
            .with_frame("action 'fail'")
            .with_frame("query 'fail'");
        let text = e.traceback_text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "  query 'fail'");
        assert_eq!(lines[1], "  action 'fail'");
        assert!(lines[2].contains("boom"));
    }

    #[test]
    fn query_parse_error_preview() {
        let e = Error::query_parse_error("abc/%%%", "unexpected", &Position::new(4, 1, 5));
        assert!(e.message.contains("'abc/' >>> '%%%'"));
        assert_eq!(e.query, Some("abc/%%%".to_owned()));
        assert_eq!(e.error_type.classification(), "parse error");
    }
}
