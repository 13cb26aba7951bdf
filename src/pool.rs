//! Connection pool for service container HTTP connections
//!
//! Connections to a container are reused across requests until the pool's
//! idle timeout expires.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Body, Bytes};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per container
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Build the URI of a request to a service container
///
/// `rest` is the path (and query) after the route name, starting with `/`.
pub fn backend_uri(ip_address: &str, port: u16, rest: &str) -> Result<Uri, PoolError> {
    if ip_address.is_empty() {
        return Err(PoolError::RequestBuild(
            "container has no address".to_string(),
        ));
    }
    if !rest.starts_with('/') {
        return Err(PoolError::RequestBuild(format!(
            "path '{}' does not start with '/'",
            rest
        )));
    }
    let host = if ip_address.contains(':') {
        format!("[{}]", ip_address)
    } else {
        ip_address.to_string()
    };
    format!("http://{}:{}{}", host, port, rest)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))
}

/// A connection pool for HTTP connections to service containers
pub struct ConnectionPool {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `uri`, keeping its method, headers and body
    pub async fn send_request<B>(
        &self,
        req: Request<B>,
        uri: Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(uri)
            .version(hyper::Version::HTTP_11);

        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body.boxed())
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[test]
    fn test_backend_uri() {
        let uri = backend_uri("172.17.0.3", 8080, "/a/b?x=1").unwrap();
        assert_eq!(uri.to_string(), "http://172.17.0.3:8080/a/b?x=1");

        let uri = backend_uri("fd00::2", 80, "/").unwrap();
        assert_eq!(uri.host(), Some("[fd00::2]"));

        assert!(backend_uri("", 80, "/").is_err());
        assert!(backend_uri("10.0.0.1", 80, "/bad path").is_err());
        assert!(backend_uri("10.0.0.1", 80, ".route").is_err());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let pool = ConnectionPool::new(PoolConfig::default());
        // Bind then drop to get a port nothing listens on
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let req = Request::builder()
            .uri("/")
            .body(Full::new(Bytes::new()).map_err(|e| match e {}))
            .unwrap();

        let uri = backend_uri("127.0.0.1", port, "/").unwrap();
        let result = pool.send_request(req, uri).await;

        assert!(matches!(result, Err(PoolError::Client(_))));
        assert_eq!(pool.stats().get_failed_requests(), 1);
    }
}
