//! Store talking to the store API of a remote liquer server.
//!
//! Every store operation maps to one endpoint under the API prefix
//! (e.g. `http://host:5000/liquer/api`):
//!
//! | operation | request |
//! |---|---|
//! | `get_bytes` | `GET store/data/{key}` (raw bytes) |
//! | `get_metadata` | `GET store/metadata/{key}` |
//! | `set` | `POST store/data/{key}` then `POST store/metadata/{key}` |
//! | `remove`, `removedir`, `makedir` | `GET store/remove/{key}`, ... |
//! | `contains`, `is_dir`, `listdir` | `GET store/contains/{key}`, ... |
//! | `keys` | `GET store/keys` |
//!
//! JSON answers are [ApiResponse] documents. The HTTP client is abstracted by [HttpTransport].

use std::sync::Arc;

use liquer_core::error::Error;
use liquer_core::metadata::Metadata;
use liquer_core::parse::parse_key;
use liquer_core::query::Key;
use liquer_core::store::{ParentLink, Store};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// JSON document returned by the API endpoints.
/// Endpoint specific results (`contains`, `keys`, `metadata`, ...) are kept in `extra`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: ApiStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ApiResponse {
    pub fn ok(message: &str) -> Self {
        ApiResponse {
            status: ApiStatus::Ok,
            message: message.to_owned(),
            query: None,
            key: None,
            traceback: None,
            error: None,
            extra: Map::new(),
        }
    }

    pub fn from_error(error: &Error) -> Self {
        ApiResponse {
            status: ApiStatus::Error,
            message: error.to_string(),
            query: error.query.clone(),
            key: error.key.clone(),
            traceback: Some(error.traceback_text()),
            error: Some(error.clone()),
            extra: Map::new(),
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_owned());
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn with<V: Into<JsonValue>>(mut self, name: &str, value: V) -> Self {
        self.extra.insert(name.to_owned(), value.into());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == ApiStatus::Ok
    }

    /// Convert an error answer back to an [Error]
    pub fn into_result(self) -> Result<ApiResponse, Error> {
        if self.is_ok() {
            return Ok(self);
        }
        Err(match self.error {
            Some(error) => error,
            None => Error::general_error(self.message),
        })
    }

    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T, Error> {
        let value = self.extra.get(name).ok_or_else(|| {
            Error::general_error(format!("Field '{}' is missing in the response", name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            Error::general_error(format!("Field '{}' has unexpected form: {}", name, e))
        })
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("can't read the response from {url}: {message}")]
    Response { url: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking HTTP client used by [RemoteStore].
/// Responses with an error status are returned as `Ok`; only transport failures are errors.
pub trait HttpTransport: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, TransportError>;
    fn post(&self, url: &str, content_type: &str, body: Vec<u8>)
        -> Result<HttpResponse, TransportError>;
}

#[cfg(feature = "http")]
pub use ureq_transport::UreqTransport;

#[cfg(feature = "http")]
mod ureq_transport {
    use std::io::Read;

    use super::{HttpResponse, HttpTransport, TransportError};

    /// Transport based on a `ureq` agent
    pub struct UreqTransport {
        agent: ureq::Agent,
    }

    impl UreqTransport {
        pub fn new() -> Self {
            UreqTransport {
                agent: ureq::Agent::new(),
            }
        }
    }

    impl Default for UreqTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    fn read_response(
        url: &str,
        result: Result<ureq::Response, ureq::Error>,
    ) -> Result<HttpResponse, TransportError> {
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => {
                return Err(TransportError::Request {
                    url: url.to_owned(),
                    message: e.to_string(),
                })
            }
        };
        let status = response.status();
        let content_type = response.header("Content-Type").map(str::to_owned);
        let mut body = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| TransportError::Response {
                url: url.to_owned(),
                message: e.to_string(),
            })?;
        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }

    impl HttpTransport for UreqTransport {
        fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            read_response(url, self.agent.get(url).call())
        }

        fn post(
            &self,
            url: &str,
            content_type: &str,
            body: Vec<u8>,
        ) -> Result<HttpResponse, TransportError> {
            read_response(
                url,
                self.agent
                    .post(url)
                    .set("Content-Type", content_type)
                    .send_bytes(&body),
            )
        }
    }
}

pub struct RemoteStore {
    api_url: String,
    transport: Arc<dyn HttpTransport>,
    parent: ParentLink,
}

impl RemoteStore {
    /// `api_url` is the API root of the server, e.g. `http://localhost:5000/liquer/api`
    pub fn new(api_url: &str, transport: Arc<dyn HttpTransport>) -> Self {
        RemoteStore {
            api_url: api_url.trim_end_matches('/').to_owned(),
            transport,
            parent: ParentLink::default(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    fn url(&self, endpoint: &str, key: &Key) -> String {
        if key.is_empty() {
            format!("{}/store/{}", self.api_url, endpoint)
        } else {
            format!("{}/store/{}/{}", self.api_url, endpoint, key.encode())
        }
    }

    fn transport_error(&self, key: &Key, e: TransportError) -> Error {
        Error::key_read_error(key, &self.store_name(), &e)
    }

    fn parse_response(&self, key: &Key, response: HttpResponse) -> Result<ApiResponse, Error> {
        let parsed: ApiResponse = serde_json::from_slice(&response.body).map_err(|e| {
            Error::key_read_error(
                key,
                &self.store_name(),
                &format!("unexpected answer (HTTP {}): {}", response.status, e),
            )
        })?;
        parsed.into_result()
    }

    fn get_json(&self, endpoint: &str, key: &Key) -> Result<ApiResponse, Error> {
        let url = self.url(endpoint, key);
        tracing::debug!(%url, "remote store request");
        let response = self
            .transport
            .get(&url)
            .map_err(|e| self.transport_error(key, e))?;
        self.parse_response(key, response)
    }

    fn post(&self, endpoint: &str, key: &Key, content_type: &str, body: Vec<u8>) -> Result<ApiResponse, Error> {
        let url = self.url(endpoint, key);
        tracing::debug!(%url, "remote store post");
        let response = self
            .transport
            .post(&url, content_type, body)
            .map_err(|e| Error::key_write_error(key, &self.store_name(), &e))?;
        self.parse_response(key, response)
    }

    fn post_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        let body = metadata.to_json()?.into_bytes();
        self.post("metadata", key, "application/json", body)?;
        Ok(())
    }
}

impl Store for RemoteStore {
    fn store_name(&self) -> String {
        format!("Remote store {}", self.api_url)
    }

    liquer_core::parent_link_accessors!();

    fn get_bytes(&self, key: &Key) -> Result<Vec<u8>, Error> {
        let url = self.url("data", key);
        let response = self
            .transport
            .get(&url)
            .map_err(|e| self.transport_error(key, e))?;
        if response.is_success() {
            Ok(response.body)
        } else {
            Err(self
                .parse_response(key, response)
                .err()
                .unwrap_or_else(|| Error::key_not_found(key)))
        }
    }

    fn get_metadata(&self, key: &Key) -> Result<Metadata, Error> {
        self.get_json("metadata", key)?.field("metadata")
    }

    fn set(&self, key: &Key, data: &[u8], metadata: &Metadata) -> Result<(), Error> {
        let metadata = self.finalize_metadata(metadata.clone(), key, false, Some(data), true);
        self.post("data", key, "application/octet-stream", data.to_vec())?;
        self.post_metadata(key, &metadata)?;
        self.on_data_changed(key);
        self.on_metadata_changed(key);
        Ok(())
    }

    fn set_metadata(&self, key: &Key, metadata: &Metadata) -> Result<(), Error> {
        let metadata = self.finalize_metadata(metadata.clone(), key, false, None, true);
        self.post_metadata(key, &metadata)?;
        self.on_metadata_changed(key);
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<(), Error> {
        self.get_json("remove", key)?;
        self.on_removed(key);
        Ok(())
    }

    fn removedir(&self, key: &Key) -> Result<(), Error> {
        self.get_json("removedir", key)?;
        self.on_removed(key);
        Ok(())
    }

    fn contains(&self, key: &Key) -> Result<bool, Error> {
        self.get_json("contains", key)?.field("contains")
    }

    fn is_dir(&self, key: &Key) -> Result<bool, Error> {
        self.get_json("is_dir", key)?.field("is_dir")
    }

    fn keys(&self) -> Result<Vec<Key>, Error> {
        let keys: Vec<String> = self.get_json("keys", &Key::new())?.field("keys")?;
        let mut keys = keys
            .iter()
            .map(parse_key)
            .collect::<Result<Vec<Key>, Error>>()?;
        keys.sort_by_key(|k| k.encode());
        Ok(keys)
    }

    fn listdir(&self, key: &Key) -> Result<Vec<String>, Error> {
        self.get_json("listdir", key)?.field("listdir")
    }

    fn makedir(&self, key: &Key) -> Result<(), Error> {
        self.get_json("makedir", key)?;
        self.on_data_changed(key);
        Ok(())
    }

    fn is_supported(&self, _key: &Key) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liquer_core::error::ErrorType;
    use liquer_core::store::MemoryStore;
    use std::sync::Mutex;

    const API: &str = "http://remote/liquer/api";

    /// Answers store API requests from a memory store
    struct Loopback {
        store: MemoryStore,
        requests: Mutex<Vec<String>>,
    }

    impl Loopback {
        fn new() -> Self {
            Loopback {
                store: MemoryStore::default(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn json(response: ApiResponse) -> HttpResponse {
            let status = if response.is_ok() { 200 } else { 404 };
            HttpResponse {
                status,
                content_type: Some("application/json".to_owned()),
                body: serde_json::to_vec(&response).unwrap_or_default(),
            }
        }

        fn answer<T: Into<JsonValue>>(result: Result<T, Error>, field: &str) -> HttpResponse {
            Self::json(match result {
                Ok(value) => ApiResponse::ok("OK").with(field, value),
                Err(e) => ApiResponse::from_error(&e),
            })
        }

        fn route(&self, url: &str) -> (String, Key) {
            self.requests.lock().unwrap().push(url.to_owned());
            let path = url.strip_prefix(&format!("{}/store/", API)).unwrap_or(url);
            let (endpoint, key) = path.split_once('/').unwrap_or((path, ""));
            (endpoint.to_owned(), parse_key(key).unwrap_or_default())
        }
    }

    impl HttpTransport for Loopback {
        fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
            let (endpoint, key) = self.route(url);
            let store = &self.store;
            Ok(match endpoint.as_str() {
                "data" => match store.get_bytes(&key) {
                    Ok(body) => HttpResponse {
                        status: 200,
                        content_type: None,
                        body,
                    },
                    Err(e) => Self::json(ApiResponse::from_error(&e)),
                },
                "metadata" => Self::answer(
                    store.get_metadata(&key).and_then(|m| m.to_json_value()),
                    "metadata",
                ),
                "contains" => Self::answer(store.contains(&key), "contains"),
                "is_dir" => Self::answer(store.is_dir(&key), "is_dir"),
                "listdir" => Self::answer(store.listdir(&key), "listdir"),
                "keys" => Self::answer(
                    store
                        .keys()
                        .map(|keys| keys.iter().map(|k| k.encode()).collect::<Vec<_>>()),
                    "keys",
                ),
                "remove" => Self::answer(store.remove(&key).map(|_| true), "removed"),
                "removedir" => Self::answer(store.removedir(&key).map(|_| true), "removed"),
                "makedir" => Self::answer(store.makedir(&key).map(|_| true), "created"),
                _ => HttpResponse {
                    status: 404,
                    content_type: None,
                    body: b"not found".to_vec(),
                },
            })
        }

        fn post(
            &self,
            url: &str,
            _content_type: &str,
            body: Vec<u8>,
        ) -> Result<HttpResponse, TransportError> {
            let (endpoint, key) = self.route(url);
            let store = &self.store;
            let result = match endpoint.as_str() {
                "data" => {
                    let metadata = store.get_metadata(&key).unwrap_or_default();
                    store.set(&key, &body, &metadata)
                }
                "metadata" => std::str::from_utf8(&body)
                    .map_err(|e| Error::general_error(e.to_string()))
                    .and_then(Metadata::from_json)
                    .and_then(|m| store.set_metadata(&key, &m)),
                _ => Err(Error::general_error(format!("unknown endpoint {}", endpoint))),
            };
            Ok(Self::answer(result.map(|_| true), "stored"))
        }
    }

    #[test]
    fn operations_map_to_endpoints() -> Result<(), Error> {
        let server = Arc::new(Loopback::new());
        let store = RemoteStore::new(&format!("{}/", API), server.clone());
        assert_eq!(store.api_url(), API);
        let key = parse_key("a/b.txt")?;
        let mut metadata = Metadata::new();
        metadata.title = "remote".to_owned();
        store.set(&key, b"hello", &metadata)?;
        assert_eq!(server.store.get_bytes(&key)?, b"hello".to_vec());
        assert_eq!(store.get_bytes(&key)?, b"hello".to_vec());
        assert_eq!(store.get_metadata(&key)?.title, "remote");
        assert!(store.contains(&key)?);
        assert!(store.is_dir(&parse_key("a")?)?);
        assert_eq!(store.listdir(&parse_key("a")?)?, vec!["b.txt".to_owned()]);
        assert!(store.keys()?.contains(&key));
        store.remove(&key)?;
        assert!(!store.contains(&key)?);
        let requests = server.requests.lock().unwrap();
        assert_eq!(requests[0], format!("{}/store/data/a/b.txt", API));
        assert_eq!(requests[1], format!("{}/store/metadata/a/b.txt", API));
        Ok(())
    }

    #[test]
    fn remote_errors_are_reported() -> Result<(), Error> {
        let store = RemoteStore::new(API, Arc::new(Loopback::new()));
        let err = store.get_bytes(&parse_key("missing.txt")?).unwrap_err();
        assert_eq!(err.error_type, ErrorType::KeyNotFound);
        let err = store.get_metadata(&parse_key("missing.txt")?).unwrap_err();
        assert_eq!(err.error_type, ErrorType::KeyNotFound);
        Ok(())
    }

    #[test]
    fn response_document() -> Result<(), Error> {
        let response = ApiResponse::ok("Keys obtained").with("keys", vec!["a", "b"]);
        let json = serde_json::to_value(&response).map_err(|e| Error::general_error(e.to_string()))?;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["keys"][1], "b");
        let error = ApiResponse::from_error(&Error::general_error("boom".to_owned()));
        let json = serde_json::to_value(&error).map_err(|e| Error::general_error(e.to_string()))?;
        assert_eq!(json["status"], "ERROR");
        assert!(json.get("traceback").is_some());
        assert!(error.into_result().is_err());
        Ok(())
    }
}
