use axum::body::Body;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Response, StatusCode};
use axum::response::IntoResponse;
use liquer_core::error::{Error, ErrorType};
use liquer_store::remote::ApiResponse;

/// HTTP status used for an error.
/// Missing entries give 404, malformed requests 400, refused writes 403,
/// everything else (evaluation and adapter failures) 500.
pub fn error_status(error: &Error) -> StatusCode {
    match error.error_type {
        ErrorType::KeyNotFound | ErrorType::NotAvailable | ErrorType::KeyRouteNotFound => {
            StatusCode::NOT_FOUND
        }
        ErrorType::ParseError
        | ErrorType::ArgumentMissing
        | ErrorType::ArgumentParseError
        | ErrorType::TooManyParameters
        | ErrorType::ActionNotRegistered => StatusCode::BAD_REQUEST,
        ErrorType::ReadOnly | ErrorType::NotSupported | ErrorType::KeyNotSupported => {
            StatusCode::FORBIDDEN
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub struct CoreError(pub Error);

impl From<Error> for CoreError {
    fn from(e: Error) -> Self {
        CoreError(e)
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response<Body> {
        tracing::debug!(error = %self.0, "request failed");
        let status = error_status(&self.0);
        (status, ApiJson(ApiResponse::from_error(&self.0))).into_response()
    }
}

/// JSON document of the API
pub struct ApiJson(pub ApiResponse);

impl IntoResponse for ApiJson {
    fn into_response(self) -> Response<Body> {
        json_response(&self.0)
    }
}

/// Answer a result as an API document; `field` names the member holding the value
pub fn api_result<T: Into<serde_json::Value>>(
    result: Result<T, Error>,
    message: &str,
    field: &str,
) -> Response<Body> {
    match result {
        Ok(value) => ApiJson(ApiResponse::ok(message).with(field, value)).into_response(),
        Err(e) => CoreError(e).into_response(),
    }
}

pub fn json_response<T: serde::Serialize>(value: &T) -> Response<Body> {
    match serde_json::to_vec_pretty(value) {
        Ok(json) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain")],
            format!("Can't serialize the response: {}", e),
        )
            .into_response(),
    }
}

/// Serialized data with its media type.
/// A filename turns non-inline media types into attachments.
pub struct DataResponse {
    pub data: Vec<u8>,
    pub media_type: String,
    pub filename: Option<String>,
}

impl IntoResponse for DataResponse {
    fn into_response(self) -> Response<Body> {
        let mut headers = HeaderMap::new();
        let media_type = HeaderValue::from_str(&self.media_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        headers.insert(header::CONTENT_TYPE, media_type);
        if let Some(filename) = &self.filename {
            if !liquer_core::media_type::is_inline_media_type(&self.media_type) {
                let disposition = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
                if let Ok(value) = HeaderValue::from_str(&disposition) {
                    headers.insert(header::CONTENT_DISPOSITION, value);
                }
            }
        }
        (StatusCode::OK, headers, self.data).into_response()
    }
}

/// Run blocking work (evaluation, store access) off the async executor
pub async fn blocking<T, F>(f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::unexpected_error(format!("Background task failed: {}", e)))?
}
