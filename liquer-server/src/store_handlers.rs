use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use liquer_core::error::Error;
use liquer_core::metadata::Metadata;
use liquer_core::parse::parse_key;
use liquer_core::query::Key;
use liquer_core::store::key_name;
use liquer_store::remote::ApiResponse;
use serde_json::Value as JsonValue;

use crate::environment::ServerEnvRef;
use crate::utils::{blocking, ApiJson, CoreError, DataResponse};

/// Key from the URL path; an empty path is the root key
pub fn parse_store_key(path: &str) -> Result<Key, Error> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        Ok(Key::new())
    } else {
        parse_key(path)
    }
}

/// Run a store operation on the blocking pool and answer the result in the field `field`
async fn store_operation<T, F>(env: ServerEnvRef, query: String, field: &'static str, f: F) -> Response<Body>
where
    T: Into<JsonValue> + Send + 'static,
    F: FnOnce(&dyn liquer_core::store::Store, &Key) -> Result<T, Error> + Send + 'static,
{
    let key = match parse_store_key(&query) {
        Ok(key) => key,
        Err(e) => return CoreError(e).into_response(),
    };
    let encoded = key.encode();
    let result = blocking(move || {
        let store = env.envref.get_store();
        f(store.as_ref(), &key)
    })
    .await;
    match result {
        Ok(value) => ApiJson(ApiResponse::ok("OK").with_key(&encoded).with(field, value)).into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}

async fn read_data(env: ServerEnvRef, key: Key) -> Response<Body> {
    let result = blocking(move || {
        let store = env.envref.get_store();
        let (data, metadata) = store.get(&key)?;
        Ok(DataResponse {
            data,
            media_type: metadata.media_type(),
            filename: Some(key_name(&key)),
        })
    })
    .await;
    match result {
        Ok(data) => data.into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn store_data_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    match parse_store_key(&query) {
        Ok(key) => read_data(env, key).await,
        Err(e) => CoreError(e).into_response(),
    }
}

/// Store the request body, keeping the metadata already stored with the key
#[axum::debug_handler]
pub async fn store_data_post_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
    body: Bytes,
) -> Response<Body> {
    store_operation(env, query, "stored", move |store, key| {
        let metadata = store.get_metadata(key).unwrap_or_default();
        store.set(key, &body, &metadata)?;
        Ok(true)
    })
    .await
}

#[axum::debug_handler]
pub async fn store_metadata_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "metadata", |store, key| {
        store.get_metadata(key)?.to_json_value()
    })
    .await
}

#[axum::debug_handler]
pub async fn store_metadata_post_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
    body: Bytes,
) -> Response<Body> {
    store_operation(env, query, "stored", move |store, key| {
        let text = std::str::from_utf8(&body)
            .map_err(|e| Error::general_error(format!("Metadata is not valid UTF-8: {}", e)))?;
        store.set_metadata(key, &Metadata::from_json(text)?)?;
        Ok(true)
    })
    .await
}

#[axum::debug_handler]
pub async fn remove_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "removed", |store, key| store.remove(key).map(|_| true)).await
}

#[axum::debug_handler]
pub async fn removedir_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "removed", |store, key| store.removedir(key).map(|_| true)).await
}

#[axum::debug_handler]
pub async fn contains_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "contains", |store, key| store.contains(key)).await
}

#[axum::debug_handler]
pub async fn is_dir_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "is_dir", |store, key| store.is_dir(key)).await
}

#[axum::debug_handler]
pub async fn keys_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    store_operation(env, String::new(), "keys", |store, _| {
        store
            .keys()
            .map(|keys| keys.iter().map(|k| k.encode()).collect::<Vec<_>>())
    })
    .await
}

#[axum::debug_handler]
pub async fn listdir_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "listdir", |store, key| store.listdir(key)).await
}

#[axum::debug_handler]
pub async fn listdir_root_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    store_operation(env, String::new(), "listdir", |store, key| store.listdir(key)).await
}

#[axum::debug_handler]
pub async fn makedir_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    store_operation(env, query, "created", |store, key| store.makedir(key).map(|_| true)).await
}

/// Serve `web/{path}`; a directory is served by its index.html
#[axum::debug_handler]
pub async fn web_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
) -> Response<Body> {
    match parse_store_key(&format!("web/{}", query)) {
        Ok(key) => web_response(env, key).await,
        Err(e) => CoreError(e).into_response(),
    }
}

#[axum::debug_handler]
pub async fn web_root_handler(State(env): State<ServerEnvRef>) -> Response<Body> {
    match parse_key("web") {
        Ok(key) => web_response(env, key).await,
        Err(e) => CoreError(e).into_response(),
    }
}

async fn web_response(env: ServerEnvRef, key: Key) -> Response<Body> {
    let store = env.envref.get_store();
    let lookup = key.clone();
    let key = match blocking(move || store.is_dir(&lookup)).await {
        Ok(true) => key.join("index.html"),
        Ok(false) => key,
        Err(e) => return CoreError(e).into_response(),
    };
    read_data(env, key).await
}

#[axum::debug_handler]
pub async fn upload_form_handler(Path(query): Path<String>) -> Response<Body> {
    match parse_store_key(&query) {
        Ok(key) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html")],
            format!(
                "<!DOCTYPE html>
<html>
<head>
    <title>Upload File {key}</title>
</head>
<body>
    <h1>Upload to {key}</h1>
    <form method=\"post\" enctype=\"multipart/form-data\">
    <input type=\"file\" name=\"file\"/>
    <input type=\"submit\" value=\"Upload\"/>
    </form>
</body>
</html>
"
            ),
        )
            .into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}

/// Store the multipart field `file`. When the key is a directory, the uploaded file name is appended.
#[axum::debug_handler]
pub async fn upload_handler(
    Path(query): Path<String>,
    State(env): State<ServerEnvRef>,
    mut multipart: Multipart,
) -> Response<Body> {
    let mut upload = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().map(|f| f.to_owned());
                match field.bytes().await {
                    Ok(data) => {
                        upload = Some((filename, data));
                        break;
                    }
                    Err(e) => {
                        return CoreError(Error::general_error(format!("Upload failed: {}", e)))
                            .into_response()
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return CoreError(Error::general_error(format!("Invalid upload: {}", e)))
                    .into_response()
            }
        }
    }
    let (filename, data) = match upload {
        Some(upload) => upload,
        None => {
            return CoreError(Error::general_error("Field 'file' is missing".to_owned()))
                .into_response()
        }
    };
    let size = data.len() as u64;
    store_operation(env, query, "size", move |store, key| {
        let key = match filename {
            Some(name) if key.is_empty() || store.is_dir(key)? => key.join(name),
            _ => key.clone(),
        };
        store.set(&key, &data, &Metadata::new())?;
        tracing::info!(key = %key, size, "uploaded");
        Ok(size)
    })
    .await
}
