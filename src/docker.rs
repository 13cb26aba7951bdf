//! Container runtime access through a docker-compatible CLI

use crate::config::RuntimeConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// Inspect template yielding the container address
pub const IP_ADDRESS_TEMPLATE: &str = "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}";
/// Inspect template yielding the container status
pub const STATUS_TEMPLATE: &str = "{{.State.Status}}";

/// Default deadline of a runtime command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalized container status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    /// Status could not be read or is not recognised
    Undetermined,
}

impl ContainerStatus {
    pub fn parse(status: &str) -> Self {
        match status.trim() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "restarting" => ContainerStatus::Restarting,
            "paused" => ContainerStatus::Paused,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Undetermined,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Undetermined => "undetermined",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a service container is created from
#[derive(Debug, Clone, Copy)]
pub struct CreateSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub env_file: &'a Path,
    pub host_dir: &'a Path,
}

/// What a one-shot function container runs
#[derive(Debug, Clone, Copy)]
pub struct FunctionSpec<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub script: &'a Path,
    pub env_file: &'a Path,
    pub cmd: &'a [String],
}

/// Low-level operations against a container runtime
///
/// Implementations only deal with ids; bookkeeping of which route owns
/// which container lives in [`crate::executor::Executor`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (without starting) a container, returning its id
    async fn create(&self, spec: &CreateSpec<'_>) -> Result<String>;

    /// Inspect a container with a Go template
    async fn inspect(&self, id: &str, template: &str) -> Result<String>;

    async fn restart(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn pull(&self, image: &str) -> Result<()>;

    /// Command running a function container attached to stdin/stdout/stderr
    fn function_command(&self, spec: &FunctionSpec<'_>) -> Command;
}

/// Runtime driven by a docker-compatible executable (docker, podman, nerdctl)
#[derive(Debug, Clone)]
pub struct DockerCli {
    command: String,
    args: Vec<String>,
    label: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(command: impl Into<String>, args: Vec<String>, label: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args,
            label: label.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.args.clone(),
            config.label.clone(),
        )
        .with_timeout(Duration::from_secs(config.timeout_secs))
    }

    /// Deadline applied to every subcommand except image pulls
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd
    }

    fn describe(&self, args: &[&str]) -> String {
        let mut parts = vec![self.command.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        parts.extend_from_slice(args);
        parts.join(" ")
    }

    /// Run a runtime subcommand under the command deadline
    async fn exec(&self, args: &[&str]) -> Result<String> {
        self.exec_within(args, Some(self.timeout)).await
    }

    /// Run a runtime subcommand, returning its trimmed stdout
    ///
    /// A non-zero exit surfaces stderr and stdout together as the error detail.
    /// A command outliving `deadline` is killed.
    async fn exec_within(&self, args: &[&str], deadline: Option<Duration>) -> Result<String> {
        debug!(command = %self.describe(args), "Running container runtime");

        let mut command = self.base_command();
        command.args(args).stdin(Stdio::null()).kill_on_drop(true);
        let output = match deadline {
            Some(deadline) => match tokio::time::timeout(deadline, command.output()).await {
                Ok(output) => output,
                Err(_) => {
                    return Err(GatewayError::RuntimeCommand {
                        command: self.describe(args),
                        output: format!("timed out after {}s", deadline.as_secs_f64()),
                    })
                }
            },
            None => command.output().await,
        }
        .map_err(|e| GatewayError::RuntimeCommand {
            command: self.describe(args),
            output: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let combined = format!("{}\n{}", stderr.trim(), stdout);
            return Err(GatewayError::RuntimeCommand {
                command: self.describe(args),
                output: combined.trim().to_string(),
            });
        }

        Ok(stdout)
    }

    /// Run a `container <action> <id>` command and verify the echoed id
    async fn exec_on(&self, action: &str, id: &str) -> Result<()> {
        let echoed = self.exec(&["container", action, id]).await?;
        let echoed = echoed.lines().next().unwrap_or("").trim();
        if echoed != id {
            return Err(GatewayError::ContainerMismatch {
                expected: id.to_string(),
                actual: echoed.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &CreateSpec<'_>) -> Result<String> {
        if spec.name.is_empty() || spec.image.is_empty() {
            return Err(GatewayError::Creation {
                route: spec.name.to_string(),
                detail: "route name and image are required".to_string(),
            });
        }

        let mount = format!(
            "type=bind,source={},target=/hostdir",
            spec.host_dir.display()
        );
        let env_file = spec.env_file.display().to_string();
        let args = [
            "container",
            "create",
            "--label",
            self.label.as_str(),
            "--mount",
            mount.as_str(),
            "--hostname",
            spec.name,
            "--env-file",
            env_file.as_str(),
            spec.image,
        ];

        let id = self.exec(&args).await.map_err(|e| match e {
            GatewayError::RuntimeCommand { output, .. } => GatewayError::Creation {
                route: spec.name.to_string(),
                detail: output,
            },
            other => other,
        })?;

        // The id is the last line; pulls may print progress before it
        let id = id.lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(GatewayError::Creation {
                route: spec.name.to_string(),
                detail: "runtime returned no container id".to_string(),
            });
        }

        info!(route = spec.name, container_id = %id, image = spec.image, "Created container");
        Ok(id)
    }

    async fn inspect(&self, id: &str, template: &str) -> Result<String> {
        self.exec(&["container", "inspect", "-f", template, id]).await
    }

    async fn restart(&self, id: &str) -> Result<()> {
        self.exec_on("restart", id).await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.exec_on("stop", id).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.exec_on("rm", id).await
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "Pulling image");
        // Pulls are bounded by nothing but the registry
        self.exec_within(&["image", "pull", image], None).await?;
        Ok(())
    }

    fn function_command(&self, spec: &FunctionSpec<'_>) -> Command {
        let mut cmd = self.base_command();
        cmd.args(["run", "-i", "--rm", "-a", "stderr", "-a", "stdout", "-a", "stdin"])
            .arg("--label")
            .arg(&self.label)
            .arg("--mount")
            .arg(format!(
                "type=bind,source={},target=/function,readonly",
                spec.script.display()
            ))
            .arg("--hostname")
            .arg(spec.name)
            .arg("--env-file")
            .arg(spec.env_file)
            .arg(spec.image)
            .args(spec.cmd);
        cmd
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const FAKE_RUNTIME: &str = r#"
echo "$*" >> "$(dirname "$0")/calls.log"
case "$1 $2" in
  "container create") echo "cafe01" ;;
  "container inspect")
    case "$4" in
      *State.Status*) echo running ;;
      *) echo 127.0.0.1 ;;
    esac ;;
  "container restart"|"container rm") echo "$3" ;;
  "container stop") echo "other" ;;
  "container kill") sleep 5; echo "$3" ;;
  "image pull")
    if [ "$3" = "missing" ]; then echo "manifest unknown" >&2; exit 1; fi ;;
  *) echo "unknown command" >&2; exit 1 ;;
esac
"#;

    fn fake_runtime(dir: &Path) -> DockerCli {
        let script = dir.join("runtime.sh");
        std::fs::write(&script, FAKE_RUNTIME).unwrap();
        DockerCli::new(
            "sh",
            vec![script.display().to_string()],
            "faass=true",
        )
    }

    fn calls(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("calls.log")).unwrap_or_default()
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(ContainerStatus::parse("running\n"), ContainerStatus::Running);
        assert_eq!(ContainerStatus::parse("exited"), ContainerStatus::Exited);
        assert_eq!(ContainerStatus::parse("created"), ContainerStatus::Created);
        assert_eq!(ContainerStatus::parse(""), ContainerStatus::Undetermined);
        assert_eq!(ContainerStatus::parse("weird"), ContainerStatus::Undetermined);
        assert_eq!(ContainerStatus::Undetermined.to_string(), "undetermined");
    }

    #[tokio::test]
    async fn test_create_runs_container_create() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path());
        let env_file = dir.path().join("web.env");
        let host_dir = dir.path().join("web");

        let id = runtime
            .create(&CreateSpec {
                name: "web",
                image: "nginx",
                env_file: &env_file,
                host_dir: &host_dir,
            })
            .await
            .unwrap();

        assert_eq!(id, "cafe01");
        let log = calls(dir.path());
        assert!(log.contains("container create --label faass=true --mount type=bind,source="));
        assert!(log.contains("target=/hostdir --hostname web --env-file"));
        assert!(log.trim_end().ends_with("nginx"));
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path());
        let path = PathBuf::from("/tmp/none");

        let err = runtime
            .create(&CreateSpec {
                name: "web",
                image: "",
                env_file: &path,
                host_dir: &path,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Creation { .. }));
        assert!(calls(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_inspect_with_templates() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path());

        let status = runtime.inspect("cafe01", STATUS_TEMPLATE).await.unwrap();
        assert_eq!(ContainerStatus::parse(&status), ContainerStatus::Running);

        let ip = runtime.inspect("cafe01", IP_ADDRESS_TEMPLATE).await.unwrap();
        assert_eq!(ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_echoed_id_is_verified() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path());

        runtime.restart("cafe01").await.unwrap();
        runtime.remove("cafe01").await.unwrap();

        let err = runtime.stop("cafe01").await.unwrap_err();
        match err {
            GatewayError::ContainerMismatch { expected, actual } => {
                assert_eq!(expected, "cafe01");
                assert_eq!(actual, "other");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failure_surfaces_runtime_output() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path());

        runtime.pull("nginx").await.unwrap();
        let err = runtime.pull("missing").await.unwrap_err();
        match err {
            GatewayError::RuntimeCommand { command, output } => {
                assert!(command.ends_with("image pull missing"));
                assert!(output.contains("manifest unknown"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hung_command_hits_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path()).with_timeout(Duration::from_millis(200));
        let start = std::time::Instant::now();

        let err = runtime.exec_on("kill", "cafe01").await.unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(4));
        match err {
            GatewayError::RuntimeCommand { command, output } => {
                assert!(command.ends_with("container kill cafe01"));
                assert!(output.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_config_uses_runtime_timeout() {
        let config = RuntimeConfig {
            timeout_secs: 7,
            ..RuntimeConfig::default()
        };
        assert_eq!(DockerCli::from_config(&config).timeout, Duration::from_secs(7));
        assert_eq!(
            DockerCli::new("docker", vec![], "faass=true").timeout,
            DEFAULT_COMMAND_TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let runtime = DockerCli::new("/nonexistent/faasgate-runtime", vec![], "faass=true");
        let err = runtime.restart("cafe01").await.unwrap_err();
        assert!(matches!(err, GatewayError::RuntimeCommand { .. }));
    }

    #[test]
    fn test_function_command_args() {
        let runtime = DockerCli::new("docker", vec!["--context".into(), "edge".into()], "faass=true");
        let cmd_args = vec!["python3".to_string(), "/function".to_string()];
        let cmd = runtime.function_command(&FunctionSpec {
            name: "hello",
            image: "python:3",
            script: Path::new("/srv/hello.py"),
            env_file: Path::new("tmp/hello.env"),
            cmd: &cmd_args,
        });

        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "docker");
        assert_eq!(
            args,
            vec![
                "--context",
                "edge",
                "run",
                "-i",
                "--rm",
                "-a",
                "stderr",
                "-a",
                "stdout",
                "-a",
                "stdin",
                "--label",
                "faass=true",
                "--mount",
                "type=bind,source=/srv/hello.py,target=/function,readonly",
                "--hostname",
                "hello",
                "--env-file",
                "tmp/hello.env",
                "python:3",
                "python3",
                "/function",
            ]
        );
    }
}
