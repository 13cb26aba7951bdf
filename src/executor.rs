//! Container lifecycle operations for a single route

use crate::docker::{ContainerRuntime, ContainerStatus, CreateSpec, IP_ADDRESS_TEMPLATE, STATUS_TEMPLATE};
use crate::error::{GatewayError, Result};
use crate::route::{ContainerState, Route};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Runs lifecycle intents for routes against a container runtime
///
/// The executor keeps no per-route state. Callers hand in the route's
/// [`ContainerState`] already locked, so operations on one route serialize
/// while different routes proceed in parallel.
#[derive(Clone)]
pub struct Executor {
    runtime: Arc<dyn ContainerRuntime>,
    tmp_dir: PathBuf,
}

impl Executor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            tmp_dir: tmp_dir.into(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn env_file_path(&self, name: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.env", name))
    }

    pub fn host_dir(&self, name: &str) -> PathBuf {
        self.tmp_dir.join(name)
    }

    /// Write the route environment as a `KEY=value` env file
    pub async fn write_env_file(&self, route: &Route) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.tmp_dir).await?;
        let path = self.env_file_path(&route.name);
        let content: String = route
            .config
            .env
            .iter()
            .map(|(key, value)| format!("{}={}\n", key, value))
            .collect();
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }

    /// Env file of the route, written once and reused afterwards
    pub async fn cached_env_file(&self, route: &Route) -> std::io::Result<PathBuf> {
        route
            .env_file
            .get_or_try_init(|| self.write_env_file(route))
            .await
            .cloned()
    }

    /// Create (without starting) the container backing a service route
    pub async fn create(&self, route: &Route, state: &mut ContainerState) -> Result<()> {
        let image = route.config.image.as_deref().unwrap_or("");
        if route.name.is_empty() || image.is_empty() {
            return Err(GatewayError::Creation {
                route: route.name.clone(),
                detail: "route name and image are required".to_string(),
            });
        }

        let creation_error = |e: std::io::Error| GatewayError::Creation {
            route: route.name.clone(),
            detail: e.to_string(),
        };
        let env_file = self.write_env_file(route).await.map_err(creation_error)?;
        let host_dir = self.host_dir(&route.name);
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(creation_error)?;

        let id = self
            .runtime
            .create(&CreateSpec {
                name: &route.name,
                image,
                env_file: &env_file,
                host_dir: &host_dir,
            })
            .await?;
        state.container_id = id;

        state.ip_address = self.get_infos(route, state, IP_ADDRESS_TEMPLATE).await?;
        debug!(route = %route.name, container_id = %state.container_id, ip = %state.ip_address, "Container ready to start");
        Ok(())
    }

    /// Current status of the route's container
    pub async fn check(&self, route: &Route, state: &ContainerState) -> Result<ContainerStatus> {
        let id = Self::require_id(route, state)?;
        let status = self.runtime.inspect(id, STATUS_TEMPLATE).await?;
        Ok(ContainerStatus::parse(&status))
    }

    pub async fn start(&self, route: &Route, state: &ContainerState) -> Result<()> {
        let id = Self::require_id(route, state)?;
        self.runtime.restart(id).await?;
        info!(route = %route.name, container_id = %id, "Started container");
        Ok(())
    }

    pub async fn stop(&self, route: &Route, state: &ContainerState) -> Result<()> {
        let id = Self::require_id(route, state)?;
        self.runtime.stop(id).await?;
        info!(route = %route.name, container_id = %id, "Stopped container");
        Ok(())
    }

    /// Remove the container; the route forgets its id on success
    pub async fn remove(&self, route: &Route, state: &mut ContainerState) -> Result<()> {
        let id = Self::require_id(route, state)?;
        self.runtime.remove(id).await?;
        info!(route = %route.name, container_id = %id, "Removed container");
        state.container_id.clear();
        state.ip_address.clear();
        Ok(())
    }

    /// Inspect the route's container with a template
    pub async fn get_infos(
        &self,
        route: &Route,
        state: &ContainerState,
        template: &str,
    ) -> Result<String> {
        let id = Self::require_id(route, state)?;
        self.runtime.inspect(id, template).await
    }

    fn require_id<'a>(route: &Route, state: &'a ContainerState) -> Result<&'a str> {
        if state.container_id.is_empty() {
            return Err(GatewayError::UnknownContainer(route.name.clone()));
        }
        Ok(&state.container_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use crate::docker::testing::MockRuntime;
    use std::collections::BTreeMap;

    fn executor(dir: &Path) -> (Arc<MockRuntime>, Executor) {
        let runtime = Arc::new(MockRuntime::new());
        let executor = Executor::new(runtime.clone(), dir);
        (runtime, executor)
    }

    fn service(name: &str) -> Route {
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hello".to_string());
        env.insert("MODE".to_string(), "test".to_string());
        Route::new(name, RouteConfig::service("nginx", 80).with_env(env))
    }

    #[tokio::test]
    async fn test_create_records_id_and_address() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, executor) = executor(dir.path());
        let route = service("web");
        let mut state = ContainerState::default();

        executor.create(&route, &mut state).await.unwrap();

        assert_eq!(state.container_id, "web-1");
        assert_eq!(state.ip_address, "10.0.0.2");
        assert_eq!(runtime.calls(), vec!["create web", "address web-1"]);

        let env = std::fs::read_to_string(dir.path().join("web.env")).unwrap();
        assert_eq!(env, "GREETING=hello\nMODE=test\n");
        assert!(dir.path().join("web").is_dir());
    }

    #[tokio::test]
    async fn test_create_requires_image() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, executor) = executor(dir.path());
        let mut config = RouteConfig::service("nginx", 80);
        config.image = None;
        let route = Route::new("web", config);
        let mut state = ContainerState::default();

        let err = executor.create(&route, &mut state).await.unwrap_err();
        assert!(matches!(err, GatewayError::Creation { .. }));
        assert_eq!(MockRuntime::count(&runtime.creates), 0);
        assert!(!state.has_container());
    }

    #[tokio::test]
    async fn test_operations_need_container_id() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, executor) = executor(dir.path());
        let route = service("web");
        let mut state = ContainerState::default();

        assert!(matches!(
            executor.check(&route, &state).await,
            Err(GatewayError::UnknownContainer(_))
        ));
        assert!(matches!(
            executor.start(&route, &state).await,
            Err(GatewayError::UnknownContainer(_))
        ));
        assert!(matches!(
            executor.stop(&route, &state).await,
            Err(GatewayError::UnknownContainer(_))
        ));
        assert!(matches!(
            executor.remove(&route, &mut state).await,
            Err(GatewayError::UnknownContainer(_))
        ));
        assert!(matches!(
            executor.get_infos(&route, &state, IP_ADDRESS_TEMPLATE).await,
            Err(GatewayError::UnknownContainer(_))
        ));
        assert!(runtime.calls().is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_id() {
        let dir = tempfile::tempdir().unwrap();
        let (runtime, executor) = executor(dir.path());
        let route = service("web");
        let mut state = ContainerState::default();

        executor.create(&route, &mut state).await.unwrap();
        executor.stop(&route, &state).await.unwrap();
        executor.remove(&route, &mut state).await.unwrap();

        assert!(!state.has_container());
        assert!(state.ip_address.is_empty());
        assert_eq!(MockRuntime::count(&runtime.removes), 1);
    }

    #[tokio::test]
    async fn test_check_parses_status() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(MockRuntime::new().with_statuses(&[ContainerStatus::Exited]));
        let executor = Executor::new(runtime.clone(), dir.path());
        let route = service("web");
        let state = ContainerState {
            container_id: "abc".to_string(),
            ..Default::default()
        };

        assert_eq!(
            executor.check(&route, &state).await.unwrap(),
            ContainerStatus::Exited
        );
        assert_eq!(
            executor.check(&route, &state).await.unwrap(),
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn test_cached_env_file_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let (_runtime, executor) = executor(dir.path());
        let route = service("fn");

        let first = executor.cached_env_file(&route).await.unwrap();
        std::fs::write(&first, "EDITED=1\n").unwrap();
        let second = executor.cached_env_file(&route).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "EDITED=1\n");
    }
}
