use std::sync::Arc;

use crate::error::Error;
use crate::metadata::{Metadata, Status};
use crate::value::Value;

/// State is the result of a query evaluation: data together with metadata.
/// Data is shared, so states can be cheaply cloned and passed between actions.
/// When the metadata carry an error, the data are not valid and [State::get] returns the error.
#[derive(Debug, Clone)]
pub struct State {
    pub data: Arc<Value>,
    pub metadata: Metadata,
}

impl State {
    pub fn new() -> State {
        State {
            data: Arc::new(Value::none()),
            metadata: Metadata::new(),
        }
    }

    pub fn from_value_and_metadata(value: Value, metadata: Metadata) -> State {
        State {
            data: Arc::new(value),
            metadata,
        }
    }

    pub fn from_error(error: Error) -> State {
        let mut metadata = Metadata::from_error(error.clone());
        if let Some(query) = &error.query {
            metadata.with_query(query);
        }
        State {
            data: Arc::new(Value::none()),
            metadata,
        }
    }

    pub fn with_metadata(&self, metadata: Metadata) -> Self {
        State {
            data: self.data.clone(),
            metadata,
        }
    }

    pub fn with_data(&self, value: Value) -> Self {
        State {
            data: Arc::new(value),
            metadata: self.metadata.clone(),
        }
    }

    pub fn with_string(&self, text: &str) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.with_type_identifier("text");
        State {
            data: Arc::new(Value::new(text)),
            metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_error(&self) -> bool {
        self.metadata.is_error
    }

    pub fn status(&self) -> Status {
        self.metadata.status
    }

    /// Returns the data, or the recorded error if the state is in error
    pub fn get(&self) -> Result<&Value, Error> {
        self.metadata.error_result()?;
        Ok(&self.data)
    }

    /// Like [State::get], but returns the shared data
    pub fn get_arc(&self) -> Result<Arc<Value>, Error> {
        self.metadata.error_result()?;
        Ok(self.data.clone())
    }

    pub fn query(&self) -> Option<&str> {
        self.metadata.query.as_deref()
    }

    pub fn type_identifier(&self) -> String {
        self.metadata.type_identifier()
    }

    pub fn is_volatile(&self) -> bool {
        self.metadata.volatile
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_reraises_error() {
        let state = State::from_error(Error::execution_error("boom".to_owned()));
        assert!(state.is_error());
        assert_eq!(state.status(), Status::Error);
        assert_eq!(state.get().unwrap_err().message, "boom");
    }

    #[test]
    fn with_data_keeps_metadata() -> Result<(), Error> {
        let mut metadata = Metadata::new();
        metadata.with_query("abc");
        let state = State::from_value_and_metadata(Value::I64(1), metadata);
        let s2 = state.with_data(Value::I64(2));
        assert_eq!(s2.query(), Some("abc"));
        assert_eq!(*s2.get()?, Value::I64(2));
        let s3 = s2.with_string("x");
        assert_eq!(s3.type_identifier(), "text");
        Ok(())
    }
}
