use std::sync::Arc;

use liquer_core::context::Environment;
use liquer_core::error::Error;
use liquer_core::pool::Pool;
use liquer_core::state::State;

use crate::utils::blocking;

/// Shared state of the HTTP handlers
pub struct ServerEnvironment {
    pub envref: Arc<Environment>,
    pub pool: Option<Arc<Pool>>,
    /// Prefix the API is mounted at, used to build links
    pub url_prefix: String,
    /// Query served at `/`
    pub index_query: String,
}

pub type ServerEnvRef = Arc<ServerEnvironment>;

impl ServerEnvironment {
    pub fn new(envref: Arc<Environment>) -> Self {
        ServerEnvironment {
            envref,
            pool: None,
            url_prefix: "/liquer".to_owned(),
            index_query: "index.html".to_owned(),
        }
    }

    pub fn with_pool(mut self, pool: Pool) -> Self {
        self.pool = Some(Arc::new(pool));
        self
    }

    pub fn with_url_prefix(mut self, url_prefix: &str) -> Self {
        self.url_prefix = normalize_prefix(url_prefix);
        self
    }

    pub fn with_index_query(mut self, index_query: &str) -> Self {
        self.index_query = index_query.to_owned();
        self
    }

    pub fn to_ref(self) -> ServerEnvRef {
        Arc::new(self)
    }

    /// Link to the evaluation endpoint of a query
    pub fn query_link(&self, query: &str) -> String {
        format!("{}/q/{}", self.url_prefix, query)
    }
}

/// `/liquer/` and `liquer` both become `/liquer`; the root prefix becomes empty
pub fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("/{}", prefix)
    }
}

/// Evaluate a query without blocking the executor, in the pool when there is one
pub async fn async_evaluate(env: ServerEnvRef, query: String) -> Result<State, Error> {
    match &env.pool {
        Some(pool) => pool.evaluate_in_background(&query).join().await,
        None => {
            let envref = env.envref.clone();
            blocking(move || envref.evaluate(&query)).await
        }
    }
}

/// Start an evaluation and return without waiting for it
pub fn submit(env: &ServerEnvRef, query: &str) {
    match &env.pool {
        Some(pool) => {
            // The handle is dropped; the result still lands in the cache.
            pool.evaluate_in_background(query);
        }
        None => {
            let envref = env.envref.clone();
            let query = query.to_owned();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = envref.evaluate(&query) {
                    tracing::warn!(%query, error = %e, "submitted evaluation failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert_eq!(normalize_prefix("/liquer/"), "/liquer");
        assert_eq!(normalize_prefix("liquer"), "/liquer");
        assert_eq!(normalize_prefix("/"), "");
        let env = ServerEnvironment::new(Environment::new()).with_url_prefix("api/v1/");
        assert_eq!(env.query_link("value-1"), "/api/v1/q/value-1");
    }
}
