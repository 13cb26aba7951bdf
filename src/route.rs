//! Route entities and the route table
//!
//! Locking comes in two tiers. The table lock (`parking_lot`, never held
//! across an await) guards the name → route map. Each route carries its own
//! async lock guarding its container state. The table lock must never be
//! acquired while a route lock is held.

use crate::config::{RouteConfig, RouteKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Length of the route name at the start of `path`
///
/// Counts the leading run of `[a-z0-9_-]` characters.
pub fn route_name_len(path: &str) -> usize {
    path.bytes()
        .take_while(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-'))
        .count()
}

/// Whether `name` is entirely made of route name characters
pub fn is_valid_route_name(name: &str) -> bool {
    !name.is_empty() && route_name_len(name) == name.len()
}

/// Mutable runtime state of a service route
#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    /// Runtime container id, empty when no container exists
    pub container_id: String,
    /// Address of the container, meaningful once inspected
    pub ip_address: String,
    /// Last time a request asked for this container
    pub last_request: Option<Instant>,
    /// Set once the route left the table; no container may be created anymore
    pub retired: bool,
}

impl ContainerState {
    pub fn has_container(&self) -> bool {
        !self.container_id.is_empty()
    }

    /// Whether the container has been idle for at least `idle_delay`
    ///
    /// A container that never served a request counts as idle.
    pub fn is_idle(&self, idle_delay: Duration, now: Instant) -> bool {
        match self.last_request {
            Some(last) => now.saturating_duration_since(last) >= idle_delay,
            None => true,
        }
    }
}

/// A named route and its runtime state
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub config: RouteConfig,
    pub state: tokio::sync::RwLock<ContainerState>,
    /// Env file written on first function/shell invocation
    pub(crate) env_file: tokio::sync::OnceCell<PathBuf>,
}

impl Route {
    pub fn new(name: impl Into<String>, config: RouteConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: tokio::sync::RwLock::new(ContainerState::default()),
            env_file: tokio::sync::OnceCell::new(),
        }
    }

    pub fn kind(&self) -> RouteKind {
        self.config.kind
    }

    /// Check an inbound Authorization header against the route
    ///
    /// An empty route authorization only admits requests without the header.
    pub fn authorize(&self, header: Option<&str>) -> bool {
        let header = header.unwrap_or("");
        if self.config.authorization.is_empty() {
            header.is_empty()
        } else {
            header == self.config.authorization
        }
    }
}

/// Process-wide map from route name to route
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<HashMap<String, Arc<Route>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &HashMap<String, RouteConfig>) -> Self {
        let table = Self::new();
        {
            let mut map = table.routes.write();
            for (name, config) in routes {
                map.insert(name.clone(), Arc::new(Route::new(name, config.clone())));
            }
        }
        table
    }

    pub fn get(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.read().get(name).cloned()
    }

    /// Insert or replace a route, returning the replaced entry
    pub fn insert(&self, name: &str, config: RouteConfig) -> Option<Arc<Route>> {
        self.routes
            .write()
            .insert(name.to_string(), Arc::new(Route::new(name, config)))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Route>> {
        self.routes.write().remove(name)
    }

    /// Current routes sorted by name
    pub fn snapshot(&self) -> Vec<Arc<Route>> {
        let mut routes: Vec<_> = self.routes.read().values().cloned().collect();
        routes.sort_by(|a, b| a.name.cmp(&b.name));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_name_len() {
        assert_eq!(route_name_len("my-route/a/b"), 8);
        assert_eq!(route_name_len("fn_2?x=1"), 4);
        assert_eq!(route_name_len("Upper"), 0);
        assert_eq!(route_name_len(""), 0);
        assert_eq!(route_name_len("/leading"), 0);
    }

    #[test]
    fn test_is_valid_route_name() {
        assert!(is_valid_route_name("example-service"));
        assert!(is_valid_route_name("a_b-9"));
        assert!(!is_valid_route_name(""));
        assert!(!is_valid_route_name("Example"));
        assert!(!is_valid_route_name("a.b"));
    }

    #[test]
    fn test_authorize_empty_rejects_any_header() {
        let route = Route::new("open", RouteConfig::shell("/bin/cat", vec![]));
        assert!(route.authorize(None));
        assert!(route.authorize(Some("")));
        assert!(!route.authorize(Some("Basic abc")));
    }

    #[test]
    fn test_authorize_requires_exact_match() {
        let config = RouteConfig::shell("/bin/cat", vec![]).with_authorization("Basic abc");
        let route = Route::new("closed", config);
        assert!(route.authorize(Some("Basic abc")));
        assert!(!route.authorize(Some("basic abc")));
        assert!(!route.authorize(Some("Basic abc ")));
        assert!(!route.authorize(None));
    }

    #[test]
    fn test_is_idle() {
        let now = Instant::now();
        let idle_delay = Duration::from_secs(8);

        let mut state = ContainerState::default();
        assert!(state.is_idle(idle_delay, now));

        state.last_request = Some(now);
        let later = now + Duration::from_secs(9);
        assert!(state.is_idle(idle_delay, later));

        let soon = now + Duration::from_secs(5);
        assert!(!state.is_idle(idle_delay, soon));
    }

    #[test]
    fn test_table_insert_replace_remove() {
        let table = RouteTable::new();
        assert!(table.is_empty());

        assert!(table
            .insert("web", RouteConfig::service("nginx", 80))
            .is_none());
        let replaced = table
            .insert("web", RouteConfig::service("httpd", 8080))
            .unwrap();
        assert_eq!(replaced.config.port, 80);
        assert_eq!(table.get("web").unwrap().config.port, 8080);
        assert_eq!(table.len(), 1);

        assert!(table.remove("web").is_some());
        assert!(table.get("web").is_none());
        assert!(table.remove("web").is_none());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let mut routes = HashMap::new();
        routes.insert("zeta".to_string(), RouteConfig::shell("/bin/true", vec![]));
        routes.insert("alpha".to_string(), RouteConfig::shell("/bin/true", vec![]));
        routes.insert("mid".to_string(), RouteConfig::service("nginx", 80));

        let table = RouteTable::from_config(&routes);
        let names: Vec<_> = table.snapshot().iter().map(|r| r.name.clone()).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_replaced_route_keeps_own_state() {
        let table = RouteTable::new();
        table.insert("web", RouteConfig::service("nginx", 80));
        let old = table.get("web").unwrap();
        old.state.write().await.container_id = "abc".to_string();

        table.insert("web", RouteConfig::service("nginx", 80));
        let new = table.get("web").unwrap();

        assert!(old.state.read().await.has_container());
        assert!(!new.state.read().await.has_container());
    }
}
