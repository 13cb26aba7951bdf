use crate::route::is_valid_route_name;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Lower bound of the reaper sweep interval in seconds
pub const DELAY_MIN_SECS: u64 = 5;
/// Upper bound of the reaper sweep interval in seconds
pub const DELAY_MAX_SECS: u64 = 60;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Idle reaper configuration
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Route definitions keyed by route name
    #[serde(default)]
    pub routes: HashMap<String, RouteConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port (default: 9090)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// URL prefix in front of every route name (default: "lambda")
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Port for the management API (default: 9091, set to 0 to disable)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Shared secret expected in the Authorization header of management calls.
    /// The management API is disabled when empty.
    #[serde(default)]
    pub authorization: String,

    /// Maximum idle connections per service container (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            prefix: default_prefix(),
            admin_port: default_admin_port(),
            authorization: String::new(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    /// The management API only runs with a secret and a port
    pub fn admin_enabled(&self) -> bool {
        !self.authorization.is_empty() && self.admin_port > 0
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Container runtime executable (default: docker)
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Global arguments placed before every runtime subcommand
    /// (e.g. `["--context", "remote"]`)
    #[serde(default)]
    pub args: Vec<String>,

    /// Ownership label attached to every container
    #[serde(default = "default_label")]
    pub label: String,

    /// Directory holding env files and per-route host directories
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Deadline for each container runtime command, image pulls excepted
    #[serde(default = "default_runtime_timeout")]
    pub timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            args: Vec::new(),
            label: default_label(),
            tmp_dir: default_tmp_dir(),
            timeout_secs: default_runtime_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Seconds between two idle sweeps, clamped to [5, 60]
    #[serde(default = "default_reaper_delay")]
    pub delay_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_reaper_delay(),
        }
    }
}

/// Kind of compute unit behind a route
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RouteKind {
    /// Long-lived container, reverse-proxied
    Service,
    /// One-shot container per request, framed stdin/stdout
    Function,
    /// One-shot local process per request, framed stdin/stdout
    Shell,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Service => "service",
            RouteKind::Function => "function",
            RouteKind::Shell => "shell",
        }
    }
}

/// Definition of a single route
///
/// # Security Warning
///
/// `shell` routes execute `script` directly on the host and `function`/`service`
/// routes run arbitrary images. Configuration files and the management API secret
/// must be protected accordingly.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RouteConfig {
    /// Route kind: "service", "function" or "shell"
    #[serde(rename = "type")]
    pub kind: RouteKind,

    /// Container image (service and function)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Script mounted at /function (function) or executable to run (shell)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,

    /// Command line passed to the unit
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    /// Environment injected into the unit
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Exact value expected in the Authorization header; empty means the
    /// header must be absent
    #[serde(default)]
    pub authorization: String,

    /// Per-request timeout, also the pause between start polls (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Number of status polls after a start (service only)
    #[serde(default = "default_retry")]
    pub retry: u32,

    /// Inactivity before the reaper stops the container (service only)
    #[serde(default = "default_idle_delay")]
    pub idle_delay_secs: u64,

    /// Port the service listens on inside its container
    #[serde(default)]
    pub port: u16,
}

impl RouteConfig {
    /// Create a service route definition with defaults
    pub fn service(image: &str, port: u16) -> Self {
        Self {
            kind: RouteKind::Service,
            image: Some(image.to_string()),
            script: None,
            cmd: Vec::new(),
            env: BTreeMap::new(),
            authorization: String::new(),
            timeout_ms: default_timeout_ms(),
            retry: default_retry(),
            idle_delay_secs: default_idle_delay(),
            port,
        }
    }

    /// Create a function route definition with defaults
    pub fn function(image: &str, script: impl Into<PathBuf>, cmd: Vec<String>) -> Self {
        Self {
            kind: RouteKind::Function,
            image: Some(image.to_string()),
            script: Some(script.into()),
            cmd,
            ..Self::service(image, 0)
        }
    }

    /// Create a shell route definition with defaults
    pub fn shell(script: impl Into<PathBuf>, cmd: Vec<String>) -> Self {
        Self {
            kind: RouteKind::Shell,
            image: None,
            script: Some(script.into()),
            cmd,
            ..Self::service("", 0)
        }
    }

    /// Set the expected authorization (builder pattern)
    pub fn with_authorization(mut self, authorization: &str) -> Self {
        self.authorization = authorization.to_string();
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set the timeout in milliseconds (builder pattern)
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.idle_delay_secs)
    }

    pub fn is_service(&self) -> bool {
        self.kind == RouteKind::Service
    }

    /// Validate the route definition
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if !is_valid_route_name(name) {
            return Err(format!(
                "Route '{}': name must only contain [a-z0-9_-]",
                name
            ));
        }

        let has_image = self.image.as_deref().is_some_and(|i| !i.is_empty());
        let has_script = self
            .script
            .as_deref()
            .is_some_and(|s| !s.as_os_str().is_empty());

        match self.kind {
            RouteKind::Service => {
                if !has_image {
                    return Err(format!("Route '{}': service route requires 'image' field", name));
                }
                if self.port == 0 {
                    return Err(format!(
                        "Route '{}': service route requires 'port' greater than 0",
                        name
                    ));
                }
            }
            RouteKind::Function => {
                if !has_image {
                    return Err(format!("Route '{}': function route requires 'image' field", name));
                }
                if !has_script {
                    return Err(format!("Route '{}': function route requires 'script' field", name));
                }
            }
            RouteKind::Shell => {
                if !has_script {
                    return Err(format!("Route '{}': shell route requires 'script' field", name));
                }
            }
        }

        if self.timeout_ms == 0 {
            return Err(format!(
                "Route '{}': 'timeout_ms' must be greater than 0",
                name
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    9090
}

fn default_prefix() -> String {
    "lambda".to_string()
}

fn default_admin_port() -> u16 {
    9091
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_runtime_command() -> String {
    "docker".to_string()
}

fn default_label() -> String {
    "faass=true".to_string()
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

fn default_runtime_timeout() -> u64 {
    30
}

fn default_reaper_delay() -> u64 {
    10
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_retry() -> u32 {
    3
}

fn default_idle_delay() -> u64 {
    60
}

/// Clamp a reaper delay into the accepted window
pub fn clamp_delay(delay_secs: u64) -> u64 {
    delay_secs.clamp(DELAY_MIN_SECS, DELAY_MAX_SECS)
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.clamp();
        config.validate()?;
        Ok(config)
    }

    /// Bring out-of-range tunables back into their window
    pub fn clamp(&mut self) {
        let clamped = clamp_delay(self.reaper.delay_secs);
        if clamped != self.reaper.delay_secs {
            warn!(
                configured = self.reaper.delay_secs,
                applied = clamped,
                min = DELAY_MIN_SECS,
                max = DELAY_MAX_SECS,
                "Reaper delay out of range, clamped"
            );
            self.reaper.delay_secs = clamped;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Server: 'port' must be greater than 0".to_string());
        }

        if self.server.prefix.is_empty() || self.server.prefix.contains('/') {
            errors.push("Server: 'prefix' must be a non-empty path segment".to_string());
        }

        if self.runtime.command.is_empty() {
            errors.push("Runtime: 'command' must not be empty".to_string());
        }

        if self.runtime.timeout_secs == 0 {
            errors.push("Runtime: 'timeout_secs' must be greater than 0".to_string());
        }

        for (name, route) in &self.routes {
            if let Err(e) = route.validate(name) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Gateway settings readable (and partly patchable) at runtime
#[derive(Debug, Clone)]
pub struct Settings {
    pub prefix: String,
    pub delay_secs: u64,
    pub tmp_dir: PathBuf,
    pub runtime_command: String,
    pub label: String,
}

/// Shared reference to settings (patched through the management API)
pub type SharedSettings = Arc<RwLock<Settings>>;

impl Settings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefix: config.server.prefix.clone(),
            delay_secs: clamp_delay(config.reaper.delay_secs),
            tmp_dir: config.runtime.tmp_dir.clone(),
            runtime_command: config.runtime.command.clone(),
            label: config.runtime.label.clone(),
        }
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    /// Read a single exposed setting
    pub fn get(&self, key: SettingKey) -> serde_json::Value {
        match key {
            SettingKey::Prefix => self.prefix.clone().into(),
            SettingKey::Delay => self.delay_secs.into(),
            SettingKey::TmpDir => self.tmp_dir.display().to_string().into(),
            SettingKey::RuntimeCommand => self.runtime_command.clone().into(),
            SettingKey::Label => self.label.clone().into(),
        }
    }

    /// All exposed settings as a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = SettingKey::ALL
            .iter()
            .map(|key| (key.as_str().to_string(), self.get(*key)))
            .collect();
        serde_json::Value::Object(map)
    }

    pub fn apply(&mut self, patch: SettingPatch) {
        match patch {
            SettingPatch::Delay(delay) => self.delay_secs = delay,
        }
    }
}

/// Settings exposed by the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    Prefix,
    Delay,
    TmpDir,
    RuntimeCommand,
    Label,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] = [
        SettingKey::Prefix,
        SettingKey::Delay,
        SettingKey::TmpDir,
        SettingKey::RuntimeCommand,
        SettingKey::Label,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::Prefix => "prefix",
            SettingKey::Delay => "delay",
            SettingKey::TmpDir => "tmp_dir",
            SettingKey::RuntimeCommand => "runtime_command",
            SettingKey::Label => "label",
        }
    }
}

/// A single validated change to a patchable setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingPatch {
    /// Reaper sweep interval in seconds
    Delay(u64),
}

/// Why a patch was refused
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("unknown or read-only setting '{0}'")]
    UnknownKey(String),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("patch body must be a JSON object")]
    NotAnObject,
}

impl SettingPatch {
    /// Parse one key/value pair of a patch body
    pub fn parse(key: &str, value: &serde_json::Value) -> Result<Self, PatchError> {
        match key {
            "delay" => {
                let delay = value.as_u64().ok_or_else(|| PatchError::InvalidValue {
                    key: key.to_string(),
                    reason: "expected a positive integer".to_string(),
                })?;
                if !(DELAY_MIN_SECS..=DELAY_MAX_SECS).contains(&delay) {
                    return Err(PatchError::InvalidValue {
                        key: key.to_string(),
                        reason: format!(
                            "must be between {} and {} (seconds)",
                            DELAY_MIN_SECS, DELAY_MAX_SECS
                        ),
                    });
                }
                Ok(SettingPatch::Delay(delay))
            }
            other => Err(PatchError::UnknownKey(other.to_string())),
        }
    }

    /// Parse a whole patch body; nothing is applied unless every key is valid
    pub fn parse_all(body: &serde_json::Value) -> Result<Vec<Self>, PatchError> {
        let object = body.as_object().ok_or(PatchError::NotAnObject)?;
        object
            .iter()
            .map(|(key, value)| Self::parse(key, value))
            .collect()
    }
}
