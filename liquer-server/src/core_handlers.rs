use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::Response,
    response::IntoResponse,
    Json,
};
use base64::Engine;
use liquer_core::error::Error;
use liquer_core::query::encode_token;
use liquer_store::remote::ApiResponse;
use serde_json::Value as JsonValue;

use crate::environment::{async_evaluate, submit, ServerEnvRef};
use crate::presets::module_commands;
use crate::utils::{json_response, ApiJson, CoreError};
use crate::value::encode_state;

async fn evaluate_response(env: ServerEnvRef, query: String) -> Response<Body> {
    tracing::debug!(%query, "evaluate");
    let state_types = env.envref.get_state_types();
    match async_evaluate(env, query).await {
        Ok(state) => match encode_state(&state, &state_types) {
            Ok(data) => data.into_response(),
            Err(e) => CoreError(e).into_response(),
        },
        Err(e) => CoreError(e).into_response(),
    }
}

/// Evaluate the query and answer the serialized state
#[axum::debug_handler]
pub async fn evaluate_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    evaluate_response(env, query).await
}

/// Evaluate the configured index query
#[axum::debug_handler]
pub async fn index_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    let query = env.index_query.clone();
    evaluate_response(env, query).await
}

#[axum::debug_handler]
pub async fn submit_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    submit(&env, &query);
    ApiJson(ApiResponse::ok("Submitted").with_query(&query)).into_response()
}

#[axum::debug_handler]
pub async fn commands_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    json_response(&env.envref.get_command_metadata_registry().as_json_value())
}

/// Evaluate the query and answer its metadata, also for failed evaluations
#[axum::debug_handler]
pub async fn debug_json_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    match async_evaluate(env, query).await {
        Ok(state) => json_response(&state.metadata),
        Err(e) => CoreError(e).into_response(),
    }
}

#[derive(Deserialize, Debug)]
pub struct BuildRequest {
    /// Actions as lists of tokens, the first token being the action name
    pub ql: Vec<Vec<String>>,
}

/// Encode a query from its actions
pub fn build_query(ql: &[Vec<String>]) -> String {
    ql.iter()
        .map(|action| {
            action
                .iter()
                .map(encode_token)
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[axum::debug_handler]
pub async fn build_handler(
    State(env): State<ServerEnvRef>,
    Json(request): Json<BuildRequest>,
) -> Response<Body> {
    let query = build_query(&request.ql);
    let link = env.query_link(&query);
    ApiJson(
        ApiResponse::ok("Query created")
            .with_query(&query)
            .with("link", link),
    )
    .into_response()
}

/// Request to register commands from a built-in module.
/// Without `command` all commands of the module are registered.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CommandDescriptor {
    pub module: String,
    #[serde(default)]
    pub command: Option<String>,
}

impl CommandDescriptor {
    /// Descriptor given as (URL-safe or standard) base64 encoded JSON
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let encoded = encoded.trim();
        let json = base64::engine::general_purpose::URL_SAFE
            .decode(encoded)
            .or_else(|_| base64::engine::general_purpose::STANDARD.decode(encoded))
            .map_err(|e| Error::general_error(format!("Invalid base64 command descriptor: {}", e)))?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, Error> {
        serde_json::from_slice(json)
            .map_err(|e| Error::general_error(format!("Invalid command descriptor: {}", e)))
    }
}

fn register_commands(env: &ServerEnvRef, descriptor: &CommandDescriptor) -> Result<Vec<String>, Error> {
    if !env.envref.is_remote_registration_enabled() {
        return Err(Error::not_supported(
            "Remote command registration is disabled".to_owned(),
        ));
    }
    let commands = module_commands(&descriptor.module)?;
    let selected: Vec<_> = commands
        .into_iter()
        .filter(|c| match &descriptor.command {
            Some(name) => &c.metadata.name == name,
            None => true,
        })
        .collect();
    if selected.is_empty() {
        return Err(Error::general_error(format!(
            "Module '{}' has no command '{}'",
            descriptor.module,
            descriptor.command.as_deref().unwrap_or_default()
        )));
    }
    let mut names = Vec::new();
    for command in selected {
        names.push(command.metadata.name.clone());
        env.envref.register_command_object(command)?;
    }
    tracing::info!(module = %descriptor.module, commands = ?names, "commands registered remotely");
    Ok(names)
}

fn register_response(env: &ServerEnvRef, descriptor: Result<CommandDescriptor, Error>) -> Response<Body> {
    match descriptor.and_then(|d| register_commands(env, &d)) {
        Ok(names) => {
            let names: Vec<JsonValue> = names.into_iter().map(JsonValue::from).collect();
            ApiJson(ApiResponse::ok("Commands registered").with("commands", names)).into_response()
        }
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn register_command_get_handler(
    Path(encoded): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    register_response(&env, CommandDescriptor::from_base64(&encoded))
}

/// The descriptor is the request body, either JSON or base64 encoded JSON
#[axum::debug_handler]
pub async fn register_command_post_handler(
    State(env): State<ServerEnvRef>,
    body: Bytes,
) -> Response<Body> {
    let descriptor = CommandDescriptor::from_json(&body).or_else(|_| {
        CommandDescriptor::from_base64(&String::from_utf8_lossy(&body))
    });
    register_response(&env, descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_encodes_tokens() {
        let ql = vec![
            vec!["text".to_owned(), "hello world".to_owned()],
            vec!["upper".to_owned()],
        ];
        assert_eq!(build_query(&ql), "text-hello~.world/upper");
        assert_eq!(build_query(&[]), "");
    }

    #[test]
    fn descriptors() -> Result<(), Error> {
        let json = br#"{"module": "text", "command": "upper"}"#;
        let descriptor = CommandDescriptor::from_json(json)?;
        assert_eq!(descriptor.command.as_deref(), Some("upper"));
        let encoded = base64::engine::general_purpose::URL_SAFE.encode(json);
        assert_eq!(CommandDescriptor::from_base64(&encoded)?, descriptor);
        let descriptor = CommandDescriptor::from_json(br#"{"module": "core"}"#)?;
        assert!(descriptor.command.is_none());
        assert!(CommandDescriptor::from_base64("not base64!").is_err());
        Ok(())
    }
}
