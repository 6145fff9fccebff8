use liquer_core::error::Error;
use liquer_core::state::State;
use liquer_core::state_types::StateTypesRegistry;

use crate::utils::DataResponse;

/// Serialize a state in the format given by its extension (or the default format of its type).
/// Error states give the error back.
pub fn encode_state(state: &State, state_types: &StateTypesRegistry) -> Result<DataResponse, Error> {
    let value = state.get()?;
    let metadata = &state.metadata;
    let state_type = match metadata.type_identifier.as_deref() {
        Some(t) if state_types.contains(t) => state_types.get(t),
        _ => state_types.get_for_value(value),
    };
    let extension = metadata
        .extension
        .clone()
        .unwrap_or_else(|| state_type.default_extension().to_owned());
    let (data, media_type) = state_type.as_bytes(value, Some(&extension))?;
    let filename = metadata
        .filename
        .clone()
        .unwrap_or_else(|| state_type.default_filename());
    Ok(DataResponse {
        data,
        media_type,
        filename: Some(filename),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquer_core::metadata::Metadata;
    use liquer_core::value::Value;

    #[test]
    fn encodes_by_extension() -> Result<(), Error> {
        let registry = StateTypesRegistry::new();
        let mut metadata = Metadata::new();
        metadata.with_filename("data.yaml");
        let state = State::from_value_and_metadata(Value::I64(3), metadata);
        let response = encode_state(&state, &registry)?;
        assert_eq!(String::from_utf8_lossy(&response.data).trim(), "3");
        assert_eq!(response.filename.as_deref(), Some("data.yaml"));

        let state = State::from_value_and_metadata(Value::new("hello"), Metadata::new());
        let response = encode_state(&state, &registry)?;
        assert_eq!(response.data, b"hello".to_vec());
        assert_eq!(response.filename.as_deref(), Some("data.txt"));
        assert!(response.media_type.starts_with("text/plain"));
        Ok(())
    }

    #[test]
    fn error_state_is_an_error() {
        let state = State::from_error(Error::general_error("broken".to_owned()));
        assert!(encode_state(&state, &StateTypesRegistry::new()).is_err());
    }
}
