//! One-shot function and shell invocation
//!
//! A unit receives the request body on stdin and answers on stdout with
//! a 4-byte big-endian length `N`, then `N` bytes of JSON
//! `{"code": <status>, "headers": {..}}`, then the response body.

use crate::config::RouteKind;
use crate::docker::FunctionSpec;
use crate::error::{GatewayError, ResponseBody, Result};
use crate::executor::Executor;
use crate::route::Route;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Prefix put in front of every header a unit returns, except Content-Type
pub const HEADER_PREFIX: &str = "x-faas-";

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Deserialize)]
struct FrameHeader {
    code: u16,
    #[serde(default)]
    headers: HashMap<String, String>,
}

/// Decoded answer of a function or shell unit
#[derive(Debug, Clone)]
pub struct FunctionResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Decode the framed stdout of a unit
///
/// Any short, empty or unparsable frame is rejected as a whole.
pub fn decode_function_output(output: &[u8]) -> Result<FunctionResponse> {
    if output.len() < LENGTH_PREFIX {
        return Err(GatewayError::MalformedResponse(format!(
            "output is {} bytes, shorter than the length prefix",
            output.len()
        )));
    }

    let (prefix, rest) = output.split_at(LENGTH_PREFIX);
    let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len == 0 {
        return Err(GatewayError::MalformedResponse(
            "header length is zero".to_string(),
        ));
    }
    if rest.len() < len {
        return Err(GatewayError::MalformedResponse(format!(
            "header announces {} bytes but only {} follow",
            len,
            rest.len()
        )));
    }

    let (header, body) = rest.split_at(len);
    let header: FrameHeader = serde_json::from_slice(header)
        .map_err(|e| GatewayError::MalformedResponse(format!("invalid header JSON: {}", e)))?;
    let status = StatusCode::from_u16(header.code).map_err(|_| {
        GatewayError::MalformedResponse(format!("invalid status code {}", header.code))
    })?;

    Ok(FunctionResponse {
        status,
        headers: forwarded_headers(&header.headers),
        body: Bytes::copy_from_slice(body),
    })
}

/// Map unit headers to response headers
///
/// Content-Type passes through as-is and defaults to application/json;
/// every other header is namespaced with [`HEADER_PREFIX`].
fn forwarded_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let Ok(value) = HeaderValue::from_str(value) else {
            warn!(header = %key, "Dropping function header with invalid value");
            continue;
        };
        if key.eq_ignore_ascii_case(CONTENT_TYPE.as_str()) {
            map.insert(CONTENT_TYPE, value);
            continue;
        }
        match HeaderName::from_bytes(format!("{}{}", HEADER_PREFIX, key).as_bytes()) {
            Ok(name) => {
                map.insert(name, value);
            }
            Err(_) => warn!(header = %key, "Dropping function header with invalid name"),
        }
    }
    if !map.contains_key(CONTENT_TYPE) {
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    map
}

impl FunctionResponse {
    pub fn into_response(self) -> Response<ResponseBody> {
        let mut response = Response::new(Full::new(self.body).map_err(|e| match e {}).boxed());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Runs function and shell routes, one process per request
#[derive(Clone)]
pub struct Invoker {
    executor: Executor,
}

impl Invoker {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    /// Run the route's unit with `body` on stdin and decode its answer
    ///
    /// The whole exchange is bounded by the route timeout; the process is
    /// killed when it runs out.
    pub async fn invoke<B>(&self, route: &Route, body: B) -> Result<FunctionResponse>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: std::fmt::Display,
    {
        let execution_error = |detail: String| GatewayError::Execution {
            route: route.name.clone(),
            detail,
        };

        let mut command = self.command(route).await?;
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| execution_error(format!("spawn failed: {}", e)))?;

        let (Some(stdin), Some(mut stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(execution_error("process pipes unavailable".to_string()));
        };

        let writer = write_body(stdin, body);
        let stderr_drain = async {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            while let Ok(n) = reader.read_until(b'\n', &mut line).await {
                if n == 0 {
                    break;
                }
                let text = String::from_utf8_lossy(&line);
                debug!(target: "function", route = %route.name, "{}", text.trim_end());
                line.clear();
            }
        };
        let waiter = async {
            let mut output = Vec::new();
            stdout.read_to_end(&mut output).await?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, output))
        };

        let outcome = tokio::time::timeout(route.config.timeout(), async {
            tokio::join!(writer, stderr_drain, waiter)
        })
        .await;

        let (written, (), waited) = match outcome {
            Ok(results) => results,
            Err(_) => {
                let _ = child.start_kill();
                return Err(execution_error(format!(
                    "timed out after {}ms",
                    route.config.timeout_ms
                )));
            }
        };

        if let Err(e) = written {
            return Err(execution_error(format!("writing stdin failed: {}", e)));
        }
        let (status, output) =
            waited.map_err(|e| execution_error(format!("reading stdout failed: {}", e)))?;
        if !status.success() {
            return Err(execution_error(format!("process exited with {}", status)));
        }

        decode_function_output(&output)
    }

    async fn command(&self, route: &Route) -> Result<Command> {
        let script = route.config.script.as_deref().unwrap_or(Path::new(""));
        match route.kind() {
            RouteKind::Shell => {
                let mut command = Command::new(script);
                command
                    .args(&route.config.cmd)
                    .env_clear()
                    .env("FAAS_ROUTE", &route.name)
                    .envs(&route.config.env);
                Ok(command)
            }
            RouteKind::Function => {
                let env_file = self.executor.cached_env_file(route).await.map_err(|e| {
                    GatewayError::Execution {
                        route: route.name.clone(),
                        detail: format!("writing env file failed: {}", e),
                    }
                })?;
                let spec = FunctionSpec {
                    name: &route.name,
                    image: route.config.image.as_deref().unwrap_or(""),
                    script,
                    env_file: &env_file,
                    cmd: &route.config.cmd,
                };
                Ok(self.executor.runtime().function_command(&spec))
            }
            RouteKind::Service => Err(GatewayError::Configuration(format!(
                "route {} is a service, not an invocable unit",
                route.name
            ))),
        }
    }
}

/// Stream a request body into the unit's stdin, closing it at the end
///
/// A unit that exits without reading all of its input is not an error.
async fn write_body<B>(mut stdin: tokio::process::ChildStdin, mut body: B) -> io::Result<()>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let Ok(data) = frame.into_data() else {
            continue;
        };
        match stdin.write_all(&data).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    match stdin.shutdown().await {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e),
        _ => Ok(()),
    }
}
