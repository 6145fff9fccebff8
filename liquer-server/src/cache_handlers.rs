use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::Response,
    response::IntoResponse,
};
use liquer_core::error::Error;
use liquer_core::metadata::Metadata;
use liquer_core::parse::parse_query;
use liquer_store::remote::ApiResponse;

use crate::environment::ServerEnvRef;
use crate::utils::{api_result, blocking, json_response, ApiJson, CoreError};
use crate::value::encode_state;

/// Cache entries are keyed by the canonical encoding of the query
fn canonical(query: &str) -> String {
    parse_query(query)
        .map(|q| q.encode())
        .unwrap_or_else(|_| query.to_owned())
}

#[axum::debug_handler]
pub async fn cache_get_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    let query = canonical(&query);
    let result = blocking(move || {
        let state = env
            .envref
            .get_cache()
            .get(&query)
            .ok_or_else(|| Error::not_available().with_query_text(&query))?;
        encode_state(&state, &env.envref.get_state_types())
    })
    .await;
    match result {
        Ok(data) => data.into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}

/// Metadata of a cached state; a query that is not cached gets a `not available` record
#[axum::debug_handler]
pub async fn cache_metadata_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    let query = canonical(&query);
    let lookup = query.clone();
    let result = blocking(move || Ok(env.envref.get_cache().get_metadata(&lookup))).await;
    match result {
        Ok(Some(metadata)) => json_response(&metadata),
        Ok(None) => json_response(&serde_json::json!({
            "query": query,
            "status": "not available",
            "cached": false,
        })),
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn cache_metadata_post_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
    body: Bytes,
) -> Response<Body> {
    let query = canonical(&query);
    let response_query = query.clone();
    let result = blocking(move || {
        let text = std::str::from_utf8(&body)
            .map_err(|e| Error::general_error(format!("Metadata is not valid UTF-8: {}", e)))?;
        let mut metadata = Metadata::from_json(text)?;
        if metadata.query.is_none() {
            metadata.with_query(&query);
        }
        env.envref.get_cache().store_metadata(&metadata)
    })
    .await;
    match result {
        Ok(stored) => {
            let message = if stored {
                "Metadata stored"
            } else {
                "Failed to store metadata"
            };
            ApiJson(
                ApiResponse::ok(message)
                    .with_query(&response_query)
                    .with("result", stored),
            )
            .into_response()
        }
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn cache_remove_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    let query = canonical(&query);
    let lookup = query.clone();
    let result = blocking(move || env.envref.get_cache().remove(&lookup)).await;
    match result {
        Ok(removed) => {
            ApiJson(ApiResponse::ok("Removed from cache").with_query(&query).with("removed", removed))
                .into_response()
        }
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn cache_contains_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    let query = canonical(&query);
    let lookup = query.clone();
    let result = blocking(move || Ok(env.envref.get_cache().contains(&lookup))).await;
    match result {
        Ok(cached) => {
            let message = if cached { "Cached" } else { "Not cached" };
            ApiJson(ApiResponse::ok(message).with_query(&query).with("cached", cached)).into_response()
        }
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn cache_keys_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    api_result(
        blocking(move || Ok(env.envref.get_cache().keys())).await,
        "Cache keys",
        "keys",
    )
}

#[axum::debug_handler]
pub async fn cache_clean_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    let result = blocking(move || env.envref.get_cache().clean()).await;
    match result {
        Ok(()) => ApiJson(ApiResponse::ok("Cache cleaned")).into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}
