use crate::config::{PatchError, RouteConfig, SettingPatch};
use crate::error::{json_error_response, GatewayErrorCode, ResponseBody};
use crate::proxy::Gateway;
use crate::route::is_valid_route_name;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

const ROUTES_PREFIX: &str = "/api/routes/";

type AdminResponse = Response<ResponseBody>;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> AdminResponse {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: &serde_json::Value) -> AdminResponse {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(code: GatewayErrorCode, message: impl Into<String>) -> AdminResponse {
    json_error_response(code, message)
}

/// Management API for routes and settings
///
/// Only started when a shared secret is configured; every call except
/// `/health` must carry it verbatim in the Authorization header.
pub struct AdminServer {
    bind_addr: SocketAddr,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
    authorization: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        gateway: Arc<Gateway>,
        shutdown_rx: watch::Receiver<bool>,
        authorization: String,
    ) -> Self {
        Self {
            bind_addr,
            gateway,
            shutdown_rx,
            authorization: Arc::new(authorization),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            let authorization = Arc::clone(&self.authorization);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, gateway, authorization).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    _addr: SocketAddr,
    gateway: Arc<Gateway>,
    authorization: Arc<String>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        let authorization = Arc::clone(&authorization);
        async move { handle_admin_request(req, &gateway, &authorization).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth<B>(req: &Request<B>, expected: &str) -> bool {
    !expected.is_empty()
        && req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|auth| auth == expected)
}

fn is_json<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("application/json"))
}

pub async fn handle_admin_request<B>(
    req: Request<B>,
    gateway: &Gateway,
    authorization: &str,
) -> Result<AdminResponse, hyper::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error>,
{
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    if method == Method::GET && path == "/health" {
        return Ok(response(StatusCode::OK, "ok"));
    }
    if method == Method::GET && path == "/version" {
        let version_info = serde_json::json!({
            "name": PKG_NAME,
            "version": VERSION,
        });
        return Ok(json_response(StatusCode::OK, &version_info));
    }

    if !check_auth(&req, authorization) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(error_response(GatewayErrorCode::Unauthorized, "Unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/configuration") => {
            let settings = gateway.settings().read().to_json();
            json_response(StatusCode::OK, &settings)
        }
        (&Method::PATCH, "/api/configuration") => patch_configuration(req, gateway).await?,
        (_, "/api/configuration") => method_not_allowed(),

        (&Method::GET, "/api/routes") => list_routes(gateway).await,
        (_, "/api/routes") => method_not_allowed(),

        (_, p) if p.starts_with(ROUTES_PREFIX) => {
            let name = &p[ROUTES_PREFIX.len()..];
            if !is_valid_route_name(name) {
                return Ok(error_response(
                    GatewayErrorCode::InvalidRequest,
                    "Route names must only contain [a-z0-9_-]",
                ));
            }
            match &method {
                &Method::GET => get_route(gateway, name),
                &Method::POST => put_route(req, gateway, name).await?,
                &Method::DELETE => delete_route(gateway, name).await,
                _ => method_not_allowed(),
            }
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn method_not_allowed() -> AdminResponse {
    error_response(GatewayErrorCode::MethodNotAllowed, "Method not allowed")
}

async fn read_json<B>(req: Request<B>) -> Result<Result<serde_json::Value, AdminResponse>, hyper::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error>,
{
    if !is_json(&req) {
        return Ok(Err(error_response(
            GatewayErrorCode::InvalidRequest,
            "Content-Type must be application/json",
        )));
    }
    let body = req.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body).map_err(|e| {
        error_response(
            GatewayErrorCode::InvalidRequest,
            format!("Invalid JSON body: {}", e),
        )
    }))
}

async fn patch_configuration<B>(req: Request<B>, gateway: &Gateway) -> Result<AdminResponse, hyper::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error>,
{
    let body = match read_json(req).await? {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };

    let patches = match SettingPatch::parse_all(&body) {
        Ok(patches) => patches,
        Err(e @ PatchError::UnknownKey(_)) => {
            return Ok(error_response(GatewayErrorCode::NotImplemented, e.to_string()))
        }
        Err(e) => return Ok(error_response(GatewayErrorCode::InvalidRequest, e.to_string())),
    };

    let settings = {
        let mut settings = gateway.settings().write();
        for patch in patches {
            info!(?patch, "Applying configuration patch");
            settings.apply(patch);
        }
        settings.to_json()
    };
    Ok(json_response(StatusCode::ACCEPTED, &settings))
}

async fn list_routes(gateway: &Gateway) -> AdminResponse {
    let now = Instant::now();
    let mut routes = Vec::new();
    for route in gateway.table().snapshot() {
        let state = route.state.read().await;
        routes.push(serde_json::json!({
            "name": route.name,
            "type": route.kind().as_str(),
            "container_id": state.container_id,
            "ip_address": state.ip_address,
            "idle_secs": state.last_request.map(|t| now.saturating_duration_since(t).as_secs()),
        }));
    }
    let stats = gateway.pool().stats();
    let body = serde_json::json!({
        "count": routes.len(),
        "routes": routes,
        "proxy": {
            "total_requests": stats.get_total_requests(),
            "failed_requests": stats.get_failed_requests(),
        },
    });
    json_response(StatusCode::OK, &body)
}

fn get_route(gateway: &Gateway, name: &str) -> AdminResponse {
    match gateway.table().get(name) {
        Some(route) => match serde_json::to_value(&route.config) {
            Ok(config) => json_response(StatusCode::OK, &config),
            Err(e) => error_response(GatewayErrorCode::ConfigurationError, e.to_string()),
        },
        None => error_response(GatewayErrorCode::UnknownRoute, "Unknown route"),
    }
}

async fn put_route<B>(req: Request<B>, gateway: &Gateway, name: &str) -> Result<AdminResponse, hyper::Error>
where
    B: Body<Data = Bytes, Error = hyper::Error>,
{
    let body = match read_json(req).await? {
        Ok(body) => body,
        Err(response) => return Ok(response),
    };
    let config: RouteConfig = match serde_json::from_value(body) {
        Ok(config) => config,
        Err(e) => {
            return Ok(error_response(
                GatewayErrorCode::InvalidRequest,
                format!("Invalid route definition: {}", e),
            ))
        }
    };
    if let Err(e) = config.validate(name) {
        return Ok(error_response(GatewayErrorCode::InvalidRequest, e));
    }

    let replaced = gateway.table().insert(name, config);
    info!(route = name, replaced = replaced.is_some(), "Route stored");
    if let Some(old) = replaced {
        if let Err(e) = gateway.orchestrator().retire(&old).await {
            warn!(route = name, error = %e, "Failed to retire replaced route");
        }
    }
    Ok(response(StatusCode::OK, "ok"))
}

async fn delete_route(gateway: &Gateway, name: &str) -> AdminResponse {
    let Some(old) = gateway.table().remove(name) else {
        return error_response(GatewayErrorCode::UnknownRoute, "Unknown route");
    };
    info!(route = name, "Route deleted");
    if let Err(e) = gateway.orchestrator().retire(&old).await {
        warn!(route = name, error = %e, "Failed to retire deleted route");
    }
    response(StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::combinators::BoxBody;
    use crate::config::{Config, Settings};
    use crate::docker::testing::MockRuntime;
    use crate::executor::Executor;
    use crate::pool::PoolConfig;
    use crate::route::RouteTable;

    const SECRET: &str = "Basic YWRtaW46YXplcnR5";

    fn gateway() -> (Gateway, Arc<MockRuntime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new());
        let gateway = Gateway::new(
            Arc::new(RouteTable::new()),
            Settings::from_config(&Config::default()).shared(),
            Executor::new(runtime.clone(), dir.path()),
            PoolConfig::default(),
        );
        (gateway, runtime, dir)
    }

    fn request(method: Method, uri: &str, body: Option<&str>) -> Request<BoxBody<Bytes, hyper::Error>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, SECRET);
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        let body = Bytes::from(body.unwrap_or("").to_string());
        builder
            .body(Full::new(body).map_err(|e| match e {}).boxed())
            .unwrap()
    }

    async fn call(gateway: &Gateway, req: Request<BoxBody<Bytes, hyper::Error>>) -> (StatusCode, String) {
        let response = handle_admin_request(req, gateway, SECRET).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_needs_no_auth() {
        let (gateway, _, _dir) = gateway();
        let req = Request::builder()
            .uri("/health")
            .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
            .unwrap();

        assert_eq!(call(&gateway, req).await, (StatusCode::OK, "ok".to_string()));
    }

    #[tokio::test]
    async fn test_requires_exact_authorization() {
        let (gateway, _, _dir) = gateway();
        let mut req = request(Method::GET, "/api/configuration", None);
        req.headers_mut()
            .insert(AUTHORIZATION, "Basic other".parse().unwrap());

        let (status, _) = call(&gateway, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_get_configuration() {
        let (gateway, _, _dir) = gateway();
        let (status, body) = call(&gateway, request(Method::GET, "/api/configuration", None)).await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["delay"], 10);
        assert_eq!(json["prefix"], "lambda");
    }

    #[tokio::test]
    async fn test_patch_configuration() {
        let (gateway, _, _dir) = gateway();

        let (status, _) = call(
            &gateway,
            request(Method::PATCH, "/api/configuration", Some(r#"{"delay": 30}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(gateway.settings().read().delay_secs, 30);

        let (status, _) = call(
            &gateway,
            request(Method::PATCH, "/api/configuration", Some(r#"{"delay": 61}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &gateway,
            request(Method::PATCH, "/api/configuration", Some(r#"{"prefix": "x"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(gateway.settings().read().prefix, "lambda");

        let (status, _) = call(
            &gateway,
            request(Method::PATCH, "/api/configuration", Some("{not json")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(gateway.settings().read().delay_secs, 30);
    }

    #[tokio::test]
    async fn test_patch_requires_json_content_type() {
        let (gateway, _, _dir) = gateway();
        let mut req = request(Method::PATCH, "/api/configuration", Some(r#"{"delay": 30}"#));
        req.headers_mut()
            .insert(CONTENT_TYPE, "text/plain".parse().unwrap());

        let (status, _) = call(&gateway, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_route_crud() {
        let (gateway, _, _dir) = gateway();
        let definition = r#"{"type":"service","image":"nginx","port":80}"#;

        let (status, _) = call(&gateway, request(Method::GET, "/api/routes/web", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&gateway, request(Method::POST, "/api/routes/web", Some(definition))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&gateway, request(Method::GET, "/api/routes/web", None)).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["image"], "nginx");
        assert_eq!(json["timeout_ms"], 1000);

        let (status, body) = call(&gateway, request(Method::GET, "/api/routes", None)).await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["count"], 1);
        assert_eq!(json["routes"][0]["type"], "service");
        assert_eq!(json["proxy"]["total_requests"], 0);
        assert_eq!(json["proxy"]["failed_requests"], 0);

        let (status, _) = call(&gateway, request(Method::DELETE, "/api/routes/web", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(gateway.table().get("web").is_none());

        let (status, _) = call(&gateway, request(Method::DELETE, "/api/routes/web", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_rejects_invalid_routes() {
        let (gateway, _, _dir) = gateway();

        let (status, _) = call(
            &gateway,
            request(Method::POST, "/api/routes/web", Some(r#"{"type":"service"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &gateway,
            request(Method::POST, "/api/routes/web", Some(r#"{"type":"lambda"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&gateway, request(Method::GET, "/api/routes/Bad.Name", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(gateway.table().is_empty());
    }

    #[tokio::test]
    async fn test_replacing_live_service_retires_old_container() {
        let (gateway, runtime, _dir) = gateway();
        gateway
            .table()
            .insert("web", RouteConfig::service("nginx", 80).with_timeout_ms(5));
        let old = gateway.table().get("web").unwrap();
        old.state.write().await.container_id = "old-id".to_string();

        let definition = r#"{"type":"service","image":"httpd","port":8080}"#;
        let (status, _) = call(&gateway, request(Method::POST, "/api/routes/web", Some(definition))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(runtime.calls(), vec!["stop old-id", "rm old-id"]);
        assert!(old.state.read().await.retired);
        assert_eq!(gateway.table().get("web").unwrap().config.port, 8080);
    }

    #[tokio::test]
    async fn test_method_not_allowed() {
        let (gateway, _, _dir) = gateway();
        let (status, _) = call(&gateway, request(Method::PUT, "/api/routes/web", None)).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);

        let (status, _) = call(&gateway, request(Method::DELETE, "/api/configuration", None)).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }
}
