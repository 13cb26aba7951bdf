//! Error taxonomy and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error carried by response bodies written to clients
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the gateway and admin API write
pub type ResponseBody = BoxBody<Bytes, BoxError>;

/// Errors raised by the dispatch and execution core
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("malformed route name in path: {0}")]
    MalformedRouteName(String),

    #[error("authorization mismatch for route {0}")]
    Unauthorized(String),

    #[error("container creation failed for route {route}: {detail}")]
    Creation { route: String, detail: String },

    #[error("route {0} has no container")]
    UnknownContainer(String),

    #[error("container for route {route} not running after {attempts} checks")]
    StartTimeout { route: String, attempts: u32 },

    #[error("runtime command `{command}` failed: {output}")]
    RuntimeCommand { command: String, output: String },

    #[error("runtime answered for container {actual} while {expected} was expected")]
    ContainerMismatch { expected: String, actual: String },

    #[error("execution failed for route {route}: {detail}")]
    Execution { route: String, detail: String },

    #[error("malformed function response: {0}")]
    MalformedResponse(String),

    #[error("could not build backend request: {0}")]
    ProxyConstruction(String),

    #[error("backend request failed: {0}")]
    ProxyTransport(String),
}

impl GatewayError {
    /// Client-facing code for this error
    pub fn code(&self) -> GatewayErrorCode {
        match self {
            GatewayError::Configuration(_) => GatewayErrorCode::ConfigurationError,
            GatewayError::UnknownRoute(_) => GatewayErrorCode::UnknownRoute,
            GatewayError::MalformedRouteName(_) => GatewayErrorCode::MalformedRouteName,
            GatewayError::Unauthorized(_) => GatewayErrorCode::Unauthorized,
            GatewayError::Creation { .. }
            | GatewayError::UnknownContainer(_)
            | GatewayError::StartTimeout { .. }
            | GatewayError::RuntimeCommand { .. }
            | GatewayError::ContainerMismatch { .. } => GatewayErrorCode::ContainerUnavailable,
            GatewayError::Execution { .. } | GatewayError::MalformedResponse(_) => {
                GatewayErrorCode::ExecutionFailed
            }
            GatewayError::ProxyConstruction(_) => GatewayErrorCode::BadGateway,
            GatewayError::ProxyTransport(_) => GatewayErrorCode::BackendRequestFailed,
        }
    }

    /// JSON error response carrying only the generic message for this error
    pub fn to_response(&self) -> Response<ResponseBody> {
        let code = self.code();
        json_error_response(code, code.default_message())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error codes exposed to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Path does not start with a valid route name
    MalformedRouteName,
    /// Authorization header does not match the route
    Unauthorized,
    /// No such route
    UnknownRoute,
    /// Service container could not be created or started
    ContainerUnavailable,
    /// Function or shell unit failed
    ExecutionFailed,
    /// Backend request could not be built
    BadGateway,
    /// Backend round trip failed
    BackendRequestFailed,
    /// Gateway misconfiguration
    ConfigurationError,
    /// Management request rejected
    InvalidRequest,
    /// Method not supported on this path
    MethodNotAllowed,
    /// Setting is unknown or not patchable
    NotImplemented,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::MalformedRouteName => StatusCode::BAD_REQUEST,
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            GatewayErrorCode::ContainerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ExecutionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::BadGateway => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BackendRequestFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::NotImplemented => StatusCode::NOT_IMPLEMENTED,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::MalformedRouteName => "MALFORMED_ROUTE_NAME",
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
            GatewayErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            GatewayErrorCode::ContainerUnavailable => "CONTAINER_UNAVAILABLE",
            GatewayErrorCode::ExecutionFailed => "EXECUTION_FAILED",
            GatewayErrorCode::BadGateway => "BAD_GATEWAY",
            GatewayErrorCode::BackendRequestFailed => "BACKEND_REQUEST_FAILED",
            GatewayErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            GatewayErrorCode::InvalidRequest => "INVALID_REQUEST",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::NotImplemented => "NOT_IMPLEMENTED",
        }
    }

    /// Generic client-facing message; runtime output never goes to clients
    pub fn default_message(&self) -> &'static str {
        match self {
            GatewayErrorCode::MalformedRouteName => "Malformed route name",
            GatewayErrorCode::Unauthorized => "Unauthorized",
            GatewayErrorCode::UnknownRoute => "Unknown route",
            GatewayErrorCode::ContainerUnavailable => "Service unavailable",
            GatewayErrorCode::ExecutionFailed => "Execution failed",
            GatewayErrorCode::BadGateway => "Bad gateway",
            GatewayErrorCode::BackendRequestFailed => "Backend request failed",
            GatewayErrorCode::ConfigurationError => "Gateway misconfigured",
            GatewayErrorCode::InvalidRequest => "Invalid request",
            GatewayErrorCode::MethodNotAllowed => "Method not allowed",
            GatewayErrorCode::NotImplemented => "Not implemented",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<ResponseBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
