//! Bringing service containers up on demand and taking them down

use crate::docker::{ContainerStatus, IP_ADDRESS_TEMPLATE};
use crate::error::{GatewayError, Result};
use crate::executor::Executor;
use crate::route::Route;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Makes sure a service route is backed by a running container
#[derive(Clone)]
pub struct Orchestrator {
    executor: Executor,
}

impl Orchestrator {
    pub fn new(executor: Executor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Ensure the route's container is running and return its address
    ///
    /// Creation and start happen under the route's write lock. The lock is
    /// then downgraded and the status is polled `retry` times, sleeping
    /// `timeout_ms` before each poll. A container already running is left
    /// untouched.
    pub async fn run(&self, route: &Route) -> Result<String> {
        let mut state = route.state.write().await;
        if state.retired {
            return Err(GatewayError::UnknownRoute(route.name.clone()));
        }

        if !state.has_container() {
            self.executor.create(route, &mut state).await?;
        }
        state.last_request = Some(Instant::now());

        if self.executor.check(route, &state).await? == ContainerStatus::Running {
            return Ok(state.ip_address.clone());
        }

        self.executor.start(route, &state).await?;
        let ip_address = self
            .executor
            .get_infos(route, &state, IP_ADDRESS_TEMPLATE)
            .await?;
        state.ip_address = ip_address;

        let state = state.downgrade();
        let retry = route.config.retry;
        for attempt in 1..=retry {
            tokio::time::sleep(route.config.timeout()).await;
            let status = self.executor.check(route, &state).await?;
            if status == ContainerStatus::Running {
                debug!(route = %route.name, attempt, "Container is running");
                return Ok(state.ip_address.clone());
            }
            debug!(route = %route.name, attempt, %status, "Container not running yet");
        }

        Err(GatewayError::StartTimeout {
            route: route.name.clone(),
            attempts: retry,
        })
    }

    /// Take a route out of service for good
    ///
    /// The route is marked retired so no request can recreate its container,
    /// then a live container is stopped and, after `timeout_ms`, removed.
    /// A failed stop leaves the container in place. Returns whether a
    /// container was removed.
    pub async fn retire(&self, route: &Route) -> Result<bool> {
        let mut state = route.state.write().await;
        state.retired = true;
        if !state.has_container() {
            return Ok(false);
        }

        if let Err(e) = self.executor.stop(route, &state).await {
            warn!(route = %route.name, container_id = %state.container_id, error = %e, "Failed to stop container");
            return Err(e);
        }
        tokio::time::sleep(route.config.timeout()).await;
        self.executor.remove(route, &mut state).await?;
        info!(route = %route.name, "Route retired");
        Ok(true)
    }
}
