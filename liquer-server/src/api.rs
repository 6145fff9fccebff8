//! Routes of the HTTP facade.
//!
//! All routes except `/` live under the configured URL prefix (default `/liquer`).

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::cache_handlers::*;
use crate::core_handlers::*;
use crate::environment::ServerEnvRef;
use crate::store_handlers::*;

/// Routes relative to the URL prefix
pub fn api_routes() -> Router<ServerEnvRef> {
    Router::new()
        .route("/q/{*query}", get(evaluate_handler).post(evaluate_handler))
        .route("/submit/{*query}", get(submit_handler))
        .route("/api/commands.json", get(commands_handler))
        .route("/api/debug-json/{*query}", get(debug_json_handler))
        .route("/api/build", post(build_handler))
        .route(
            "/api/register_command",
            post(register_command_post_handler),
        )
        .route(
            "/api/register_command/{*descriptor}",
            get(register_command_get_handler).post(register_command_post_handler),
        )
        .route("/api/cache/get/{*query}", get(cache_get_handler))
        .route(
            "/api/cache/meta/{*query}",
            get(cache_metadata_handler).post(cache_metadata_post_handler),
        )
        .route("/api/cache/remove/{*query}", get(cache_remove_handler))
        .route("/api/cache/contains/{*query}", get(cache_contains_handler))
        .route("/api/cache/keys.json", get(cache_keys_handler))
        .route("/api/cache/clean", get(cache_clean_handler))
        .route(
            "/api/store/data/{*key}",
            get(store_data_handler).post(store_data_post_handler),
        )
        .route(
            "/api/store/metadata/{*key}",
            get(store_metadata_handler).post(store_metadata_post_handler),
        )
        .route("/api/store/remove/{*key}", get(remove_handler))
        .route("/api/store/removedir/{*key}", get(removedir_handler))
        .route("/api/store/contains/{*key}", get(contains_handler))
        .route("/api/store/is_dir/{*key}", get(is_dir_handler))
        .route("/api/store/keys", get(keys_handler))
        .route("/api/store/listdir", get(listdir_root_handler))
        .route("/api/store/listdir/{*key}", get(listdir_handler))
        .route("/api/store/makedir/{*key}", get(makedir_handler))
        .route(
            "/api/store/upload/{*key}",
            get(upload_form_handler).post(upload_handler),
        )
        .route("/web", get(web_root_handler))
        .route("/web/{*path}", get(web_handler))
}

/// Complete application: `/` serves the index query, the API is mounted at the URL prefix
pub fn router(env: ServerEnvRef) -> Router {
    let prefix = env.url_prefix.clone();
    let root = Router::new().route("/", get(index_handler));
    let app = if prefix.is_empty() {
        root.merge(api_routes())
    } else {
        root.nest(&prefix, api_routes())
    };
    app.layer(TraceLayer::new_for_http()).with_state(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ServerEnvironment;
    use crate::presets::{create_environment, register_module};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use liquer_core::config::Config;
    use liquer_core::error::Error;
    use liquer_core::metadata::Metadata;
    use liquer_core::parse::parse_key;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn server(yaml: &str) -> Result<ServerEnvRef, Error> {
        let config = Config::from_yaml(yaml)?;
        let envref = create_environment(&config)?;
        Ok(ServerEnvironment::new(envref)
            .with_url_prefix(&config.setup.url_prefix)
            .with_index_query(&config.setup.index_query)
            .to_ref())
    }

    async fn send(env: &ServerEnvRef, request: Request<Body>) -> Result<Response, Box<dyn std::error::Error>> {
        Ok(router(env.clone()).oneshot(request).await?)
    }

    async fn get_request(env: &ServerEnvRef, uri: &str) -> Result<Response, Box<dyn std::error::Error>> {
        send(env, Request::builder().uri(uri).body(Body::empty())?).await
    }

    async fn body_bytes(response: Response) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
        Ok(to_bytes(response.into_body(), usize::MAX).await?.to_vec())
    }

    async fn body_json(response: Response) -> Result<JsonValue, Box<dyn std::error::Error>> {
        Ok(serde_json::from_slice(&body_bytes(response).await?)?)
    }

    #[tokio::test]
    async fn evaluate_query() -> TestResult {
        let env = server("setup:\n  modules: [core, text]\n")?;
        let response = get_request(&env, "/liquer/q/value-1/add-2").await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(body_bytes(response).await?, b"3".to_vec());

        let response = get_request(&env, "/liquer/q/text-hello/upper/greeting.txt").await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await?, b"HELLO".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn evaluation_errors() -> TestResult {
        let env = server("setup: {}\n")?;
        let response = get_request(&env, "/liquer/q/fail").await?;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await?;
        assert_eq!(json["status"], "ERROR");
        assert!(json["traceback"].is_string());

        let response = get_request(&env, "/liquer/q/nonexistent").await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = get_request(&env, "/liquer/api/debug-json/fail").await?;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await?;
        assert_eq!(json["is_error"], true);
        Ok(())
    }

    #[tokio::test]
    async fn submit_fills_the_cache() -> TestResult {
        let env = server("setup:\n  cache: memory\n")?;
        let response = get_request(&env, "/liquer/submit/value-9").await?;
        let json = body_json(response).await?;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["message"], "Submitted");
        assert_eq!(json["query"], "value-9");

        let mut cached = false;
        for _ in 0..100 {
            let json = body_json(get_request(&env, "/liquer/api/cache/contains/value-9").await?).await?;
            if json["cached"] == true {
                cached = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(cached);
        let response = get_request(&env, "/liquer/api/cache/get/value-9").await?;
        assert_eq!(body_bytes(response).await?, b"9".to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn cache_endpoints() -> TestResult {
        let env = server("setup:\n  cache: memory\n")?;
        get_request(&env, "/liquer/q/value-2/add").await?;

        let json = body_json(get_request(&env, "/liquer/api/cache/keys.json").await?).await?;
        let keys: Vec<String> = serde_json::from_value(json["keys"].clone())?;
        assert!(keys.contains(&"value-2/add".to_owned()));

        let json = body_json(get_request(&env, "/liquer/api/cache/meta/value-2/add").await?).await?;
        assert_eq!(json["query"], "value-2/add");
        assert_eq!(json["status"], "ready");

        let json = body_json(get_request(&env, "/liquer/api/cache/remove/value-2/add").await?).await?;
        assert_eq!(json["removed"], true);
        let response = get_request(&env, "/liquer/api/cache/get/value-2/add").await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let json = body_json(get_request(&env, "/liquer/api/cache/meta/value-2/add").await?).await?;
        assert_eq!(json["cached"], false);

        let json = body_json(get_request(&env, "/liquer/api/cache/clean").await?).await?;
        assert_eq!(json["status"], "OK");
        assert!(env.envref.get_cache().keys().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn store_endpoints() -> TestResult {
        let env = server("setup: {}\n")?;
        let response = send(
            &env,
            Request::builder()
                .method("POST")
                .uri("/liquer/api/store/data/docs/hello.txt")
                .body(Body::from("hello"))?,
        )
        .await?;
        assert_eq!(body_json(response).await?["stored"], true);

        let response = get_request(&env, "/liquer/api/store/data/docs/hello.txt").await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()?
            .starts_with("text/plain"));
        assert_eq!(body_bytes(response).await?, b"hello".to_vec());

        let json = body_json(get_request(&env, "/liquer/api/store/contains/docs/hello.txt").await?).await?;
        assert_eq!(json["contains"], true);
        assert_eq!(json["key"], "docs/hello.txt");
        let json = body_json(get_request(&env, "/liquer/api/store/is_dir/docs").await?).await?;
        assert_eq!(json["is_dir"], true);
        let json = body_json(get_request(&env, "/liquer/api/store/listdir/docs").await?).await?;
        assert_eq!(json["listdir"], serde_json::json!(["hello.txt"]));
        let json = body_json(get_request(&env, "/liquer/api/store/listdir").await?).await?;
        assert_eq!(json["listdir"], serde_json::json!(["docs"]));
        let json = body_json(get_request(&env, "/liquer/api/store/keys").await?).await?;
        let keys: Vec<String> = serde_json::from_value(json["keys"].clone())?;
        assert!(keys.contains(&"docs/hello.txt".to_owned()));

        let mut metadata = Metadata::new();
        metadata.title = "Greeting".to_owned();
        let response = send(
            &env,
            Request::builder()
                .method("POST")
                .uri("/liquer/api/store/metadata/docs/hello.txt")
                .body(Body::from(metadata.to_json()?))?,
        )
        .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(get_request(&env, "/liquer/api/store/metadata/docs/hello.txt").await?).await?;
        assert_eq!(json["metadata"]["title"], "Greeting");

        let json = body_json(get_request(&env, "/liquer/api/store/remove/docs/hello.txt").await?).await?;
        assert_eq!(json["removed"], true);
        let response = get_request(&env, "/liquer/api/store/data/docs/hello.txt").await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await?["status"], "ERROR");

        let json = body_json(get_request(&env, "/liquer/api/store/makedir/empty").await?).await?;
        assert_eq!(json["created"], true);
        assert!(env.envref.get_store().is_dir(&parse_key("empty")?)?);
        let json = body_json(get_request(&env, "/liquer/api/store/removedir/empty").await?).await?;
        assert_eq!(json["removed"], true);
        Ok(())
    }

    #[tokio::test]
    async fn upload() -> TestResult {
        let env = server("setup: {}\n")?;
        let response = get_request(&env, "/liquer/api/store/upload/files").await?;
        assert!(String::from_utf8(body_bytes(response).await?)?.contains("multipart/form-data"));

        env.envref.get_store().makedir(&parse_key("files")?)?;
        let boundary = "liquerboundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\nContent-Type: text/plain\r\n\r\nsome notes\r\n--{b}--\r\n",
            b = boundary
        );
        let response = send(
            &env,
            Request::builder()
                .method("POST")
                .uri("/liquer/api/store/upload/files")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", boundary),
                )
                .body(Body::from(body))?,
        )
        .await?;
        let json = body_json(response).await?;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["size"], 10);
        assert_eq!(
            env.envref.get_store().get_bytes(&parse_key("files/notes.txt")?)?,
            b"some notes".to_vec()
        );
        Ok(())
    }

    #[tokio::test]
    async fn web_and_index() -> TestResult {
        let env = server("setup:\n  index_query: web/index.html\n")?;
        let store = env.envref.get_store();
        store.set(&parse_key("web/index.html")?, b"<h1>home</h1>", &Metadata::new())?;
        store.set(&parse_key("web/app/index.html")?, b"<h1>app</h1>", &Metadata::new())?;

        let response = get_request(&env, "/liquer/web/app").await?;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()?
            .starts_with("text/html"));
        assert_eq!(body_bytes(response).await?, b"<h1>app</h1>".to_vec());
        let response = get_request(&env, "/liquer/web").await?;
        assert_eq!(body_bytes(response).await?, b"<h1>home</h1>".to_vec());
        let response = get_request(&env, "/liquer/web/missing.html").await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        Ok(())
    }

    #[tokio::test]
    async fn commands_and_build() -> TestResult {
        let env = server("setup:\n  url_prefix: /api/v1\n")?;
        let json = body_json(get_request(&env, "/api/v1/api/commands.json").await?).await?;
        assert!(json["root"]["value"].is_object());

        let response = send(
            &env,
            Request::builder()
                .method("POST")
                .uri("/api/v1/api/build")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"ql": [["value", "1"], ["add", "2"]]}"#))?,
        )
        .await?;
        let json = body_json(response).await?;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["query"], "value-1/add-2");
        assert_eq!(json["link"], "/api/v1/q/value-1/add-2");
        Ok(())
    }

    #[tokio::test]
    async fn remote_registration_is_gated() -> TestResult {
        let env = server("setup: {}\n")?;
        let descriptor = r#"{"module": "text", "command": "upper"}"#;
        let request = || {
            Request::builder()
                .method("POST")
                .uri("/liquer/api/register_command")
                .body(Body::from(descriptor))
        };
        let response = send(&env, request()?).await?;
        let json = body_json(response).await?;
        assert_eq!(json["status"], "ERROR");
        assert_eq!(json["message"], "Remote command registration is disabled");

        env.envref.enable_remote_registration();
        let json = body_json(send(&env, request()?).await?).await?;
        assert_eq!(json["status"], "OK");
        assert_eq!(json["commands"], serde_json::json!(["upper"]));
        let state = env.envref.evaluate("text-abc/upper")?;
        assert_eq!(state.get()?.try_into_string()?, "ABC");

        let response = send(
            &env,
            Request::builder()
                .method("POST")
                .uri("/liquer/api/register_command")
                .body(Body::from(r#"{"module": "shell"}"#))?,
        )
        .await?;
        assert_eq!(body_json(response).await?["status"], "ERROR");
        Ok(())
    }

    #[tokio::test]
    async fn root_prefix() -> TestResult {
        let env = server("setup:\n  url_prefix: /\n  index_query: value-5\n")?;
        register_module(&env.envref, "text")?;
        let response = get_request(&env, "/").await?;
        assert_eq!(body_bytes(response).await?, b"5".to_vec());
        let response = get_request(&env, "/q/text-x/upper").await?;
        assert_eq!(body_bytes(response).await?, b"X".to_vec());
        Ok(())
    }
}
