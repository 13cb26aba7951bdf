use crate::config::{RouteKind, SharedSettings};
use crate::error::{json_error_response, BoxError, GatewayError, GatewayErrorCode, ResponseBody};
use crate::executor::Executor;
use crate::function::Invoker;
use crate::lifecycle::Orchestrator;
use crate::pool::{backend_uri, ConnectionPool, PoolConfig};
use crate::route::{route_name_len, Route, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderValue, AUTHORIZATION};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Route name and forwarded remainder of a dispatch path
#[derive(Debug, PartialEq, Eq)]
pub struct RoutePath<'a> {
    pub name: &'a str,
    /// Path and query after the route name, never empty
    pub rest: String,
}

/// Why a path could not be dispatched
#[derive(Debug, PartialEq, Eq)]
pub enum PathError {
    /// Path is not under the dispatch prefix
    OutsidePrefix,
    /// No valid route name right after the prefix
    MalformedName,
}

/// Split `/{prefix}/{name}{rest}` into the route name and the remainder
///
/// The name is the leading run of `[a-z0-9_-]` after the prefix; whatever
/// follows it is forwarded unmodified. An empty path remainder becomes `/`,
/// with the query kept after it.
pub fn parse_route_path<'a>(
    path_and_query: &'a str,
    prefix: &str,
) -> Result<RoutePath<'a>, PathError> {
    let under_prefix = path_and_query
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(prefix))
        .ok_or(PathError::OutsidePrefix)?;
    let trimmed = match under_prefix.strip_prefix('/') {
        Some(trimmed) => trimmed,
        None if under_prefix.is_empty() || under_prefix.starts_with('?') => {
            return Err(PathError::MalformedName)
        }
        None => return Err(PathError::OutsidePrefix),
    };

    let len = route_name_len(trimmed);
    if len == 0 {
        return Err(PathError::MalformedName);
    }
    let (name, rest) = trimmed.split_at(len);
    let (path, query) = match rest.find('?') {
        Some(at) => rest.split_at(at),
        None => (rest, ""),
    };
    let path = if path.is_empty() { "/" } else { path };

    Ok(RoutePath {
        name,
        rest: format!("{}{}", path, query),
    })
}

/// Request dispatcher shared by every connection
pub struct Gateway {
    table: Arc<RouteTable>,
    settings: SharedSettings,
    orchestrator: Orchestrator,
    invoker: Invoker,
    pool: Arc<ConnectionPool>,
}

impl Gateway {
    pub fn new(
        table: Arc<RouteTable>,
        settings: SharedSettings,
        executor: Executor,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            table,
            settings,
            orchestrator: Orchestrator::new(executor.clone()),
            invoker: Invoker::new(executor),
            pool: Arc::new(ConnectionPool::new(pool_config)),
        }
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Dispatch one request to the route named in its path
    pub async fn handle_request<B>(
        &self,
        mut req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, hyper::Error>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + Unpin + 'static,
    {
        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // X-Forwarded-For is overwritten so clients cannot spoof it
        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        let prefix = self.settings.read().prefix.clone();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let RoutePath { name, rest } = match parse_route_path(&path_and_query, &prefix) {
            Ok(parsed) => parsed,
            Err(PathError::OutsidePrefix) => {
                debug!(path = %path_and_query, request_id, "Path outside dispatch prefix");
                return Ok(json_error_response(
                    GatewayErrorCode::UnknownRoute,
                    GatewayErrorCode::UnknownRoute.default_message(),
                ));
            }
            Err(PathError::MalformedName) => {
                let err = GatewayError::MalformedRouteName(path_and_query.clone());
                debug!(request_id, error = %err, "Rejected request");
                return Ok(err.to_response());
            }
        };

        debug!(route = name, method = %req.method(), rest, request_id, "Incoming request");

        let Some(route) = self.table.get(name) else {
            return Ok(GatewayError::UnknownRoute(name.to_string()).to_response());
        };

        let header = req
            .headers()
            .get(AUTHORIZATION)
            .map(|v| v.to_str().unwrap_or("\u{fffd}"));
        if !route.authorize(header) {
            warn!(route = name, request_id, "Authorization mismatch");
            return Ok(GatewayError::Unauthorized(name.to_string()).to_response());
        }

        let result = match route.kind() {
            RouteKind::Function | RouteKind::Shell => self.invoke(&route, req).await,
            RouteKind::Service => self.proxy(&route, req, &rest).await,
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                match e.code() {
                    GatewayErrorCode::UnknownRoute => {
                        debug!(route = name, request_id, error = %e, "Route went away")
                    }
                    _ => error!(route = name, request_id, error = %e, "Request failed"),
                }
                Ok(e.to_response())
            }
        }
    }

    async fn invoke<B>(
        &self,
        route: &Route,
        req: Request<B>,
    ) -> Result<Response<ResponseBody>, GatewayError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Unpin,
    {
        let response = self.invoker.invoke(route, req.into_body()).await?;
        Ok(response.into_response())
    }

    async fn proxy<B>(
        &self,
        route: &Route,
        req: Request<B>,
        rest: &str,
    ) -> Result<Response<ResponseBody>, GatewayError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let ip_address = self.orchestrator.run(route).await?;

        let uri = backend_uri(&ip_address, route.config.port, rest)
            .map_err(|e| GatewayError::ProxyConstruction(e.to_string()))?;

        // One deadline covers the backend's headers and its whole body
        let deadline = Instant::now() + route.config.timeout();
        match tokio::time::timeout_at(deadline, self.pool.send_request(req, uri)).await {
            Ok(Ok(response)) => Ok(response
                .map(|body| DeadlineBody::new(body, deadline, route.config.timeout_ms).boxed())),
            Ok(Err(e)) => Err(GatewayError::ProxyTransport(e.to_string())),
            Err(_) => Err(GatewayError::ProxyTransport(format!(
                "timed out after {}ms",
                route.config.timeout_ms
            ))),
        }
    }
}

/// Backend body that fails once the route deadline has passed
///
/// The status and headers are already on their way to the client by then,
/// so the error aborts the response instead of truncating it silently.
struct DeadlineBody {
    inner: BoxBody<Bytes, hyper::Error>,
    deadline: Pin<Box<Sleep>>,
    timeout_ms: u64,
}

impl DeadlineBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, deadline: Instant, timeout_ms: u64) -> Self {
        Self {
            inner,
            deadline: Box::pin(tokio::time::sleep_until(deadline)),
            timeout_ms,
        }
    }
}

impl Body for DeadlineBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, BoxError>>> {
        let this = self.get_mut();
        if this.inner.is_end_stream() {
            return Poll::Ready(None);
        }
        if this.deadline.as_mut().poll(cx).is_ready() {
            let message = format!("backend body not complete after {}ms", this.timeout_ms);
            return Poll::Ready(Some(Err(message.into())));
        }
        Pin::new(&mut this.inner)
            .poll_frame(cx)
            .map(|frame| frame.map(|result| result.map_err(BoxError::from)))
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Public listener dispatching requests to routes
pub struct GatewayServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gateway).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gateway: Arc<Gateway>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { gateway.handle_request(req, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
