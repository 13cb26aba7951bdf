//! Idle service reaper and shutdown drain

use crate::config::SharedSettings;
use crate::docker::ContainerStatus;
use crate::error::Result;
use crate::lifecycle::Orchestrator;
use crate::route::{Route, RouteTable};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Outcome of a drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub removed: usize,
    pub failed: usize,
}

/// Stops idle service containers and removes all of them on shutdown
pub struct Reaper {
    table: Arc<RouteTable>,
    settings: SharedSettings,
    orchestrator: Orchestrator,
}

impl Reaper {
    pub fn new(table: Arc<RouteTable>, settings: SharedSettings, orchestrator: Orchestrator) -> Self {
        Self {
            table,
            settings,
            orchestrator,
        }
    }

    /// Sweep every `delay` seconds until shutdown, then drain
    ///
    /// The delay is read again before each sleep so a patched value applies
    /// from the next tick on. Completion of this future means every drain
    /// attempt has finished.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> DrainSummary {
        loop {
            let delay = self.settings.read().delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.sweep().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Reaper draining containers");
        let summary = self.drain().await;
        info!(removed = summary.removed, failed = summary.failed, "Drain complete");
        summary
    }

    /// Stop every idle service container, returning how many were stopped
    ///
    /// A failure on one route is logged and does not stop the sweep.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut stopped = 0;

        for route in self.table.snapshot() {
            if !route.config.is_service() {
                continue;
            }
            match self.sweep_route(&route, now).await {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!(route = %route.name, error = %e, "Idle check failed"),
            }
        }

        if stopped > 0 {
            info!(count = stopped, "Stopped idle containers");
        }
        stopped
    }

    async fn sweep_route(&self, route: &Route, now: Instant) -> Result<bool> {
        let executor = self.orchestrator.executor();
        let state = route.state.write().await;
        if !state.has_container() || state.retired {
            return Ok(false);
        }
        if !state.is_idle(route.config.idle_delay(), now) {
            return Ok(false);
        }

        let status = executor.check(route, &state).await?;
        if status == ContainerStatus::Exited {
            return Ok(false);
        }

        debug!(route = %route.name, %status, "Stopping idle container");
        executor.stop(route, &state).await?;
        Ok(true)
    }

    /// Retire every service route, all routes concurrently
    ///
    /// Routes without a container are retired too, so a request still in
    /// flight cannot create one after the drain.
    pub async fn drain(&self) -> DrainSummary {
        let routes: Vec<_> = self
            .table
            .snapshot()
            .into_iter()
            .filter(|route| route.config.is_service())
            .collect();

        let results = join_all(routes.iter().map(|route| self.orchestrator.retire(route))).await;

        let mut summary = DrainSummary::default();
        for (route, result) in routes.iter().zip(results) {
            match result {
                Ok(true) => summary.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(route = %route.name, error = %e, "Drain failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}
