use crate::config::HealthConfig;
use crate::error::{Error, Result};
use crate::server::lifecycle::{HealthStatus, ServerState};
use crate::server::probe::{HealthProbe, probe_from_config};
use crate::server::supervisor::Supervisor;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Health monitor
///
/// Runs each server's probe with a bounded timeout and reports results to the
/// supervisor, which owns the resulting state change (`Starting` → `Running`).
/// The monitor itself never mutates instance state.
pub struct HealthMonitor {
    /// Supervisor whose instances are probed
    supervisor: Supervisor,
    /// Probe per server name
    probes: HashMap<String, Arc<dyn HealthProbe>>,
    /// Polling cadence and probe timeout
    config: HealthConfig,
    /// Background liveness task
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Create a monitor using each definition's configured probe, except where
    /// `overrides` supplies one for that server.
    pub fn new(
        supervisor: Supervisor,
        config: HealthConfig,
        mut overrides: HashMap<String, Arc<dyn HealthProbe>>,
    ) -> Self {
        let probes = supervisor
            .registry()
            .list()
            .into_iter()
            .map(|definition| {
                let probe = overrides
                    .remove(&definition.name)
                    .unwrap_or_else(|| probe_from_config(&definition.probe));
                (definition.name.clone(), probe)
            })
            .collect();

        Self {
            supervisor,
            probes,
            config,
            watch_task: Mutex::new(None),
        }
    }

    /// Probe one server now.
    ///
    /// Live servers are probed and the result recorded. Servers in `Error` or
    /// `Failed` report `Unhealthy` without probing; anything else (`Stopped`,
    /// `Restarting`) reports `Unknown`.
    pub async fn check(&self, name: &str) -> Result<HealthStatus> {
        let target = self.supervisor.probe_target(name)?;
        let run_id = match (target.state, target.run_id) {
            (ServerState::Starting | ServerState::Running, Some(run_id)) => run_id,
            (ServerState::Error | ServerState::Failed, _) => return Ok(HealthStatus::Unhealthy),
            _ => return Ok(HealthStatus::Unknown),
        };

        let probe = self
            .probes
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        let result = match time::timeout(self.config.probe_timeout(), probe.check(&target)).await {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(e)) => {
                tracing::debug!(server = %name, error = %e, "Probe reported unhealthy");
                HealthStatus::Unhealthy
            }
            Err(_) => {
                tracing::debug!(server = %name, timeout = ?self.config.probe_timeout(), "Probe timed out");
                HealthStatus::Unhealthy
            }
        };

        self.supervisor.record_health(name, run_id, result)?;
        Ok(result)
    }

    /// Wait until every named server is `Running` (i.e. has passed a probe).
    ///
    /// Fails fast with `DependencyFailed` as soon as any of them reaches
    /// `Failed`, with `ShutdownRequested` if shutdown begins, and with
    /// `Timeout` once `timeout` elapses.
    #[tracing::instrument(skip(self), fields(servers = ?names))]
    pub async fn wait_until_healthy(&self, names: &[String], timeout: Duration) -> Result<()> {
        for name in names {
            self.supervisor.state(name)?;
        }

        let shutdown = self.supervisor.shutdown_token();
        let deadline = Instant::now() + timeout;

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown requested while waiting for health");
                Err(Error::ShutdownRequested)
            }
            server = self.wait_for_failure(names) => {
                tracing::warn!(server = %server, "Server failed while waiting for health");
                Err(Error::DependencyFailed { server })
            }
            result = self.poll_until_running(names) => result,
            _ = time::sleep_until(deadline) => {
                let servers = self.not_running(names);
                tracing::warn!(?servers, ?timeout, "Timed out waiting for health");
                Err(Error::Timeout { servers, waited: timeout })
            }
        }
    }

    async fn wait_for_failure(&self, names: &[String]) -> String {
        let mut changes = self.supervisor.subscribe_changes();
        loop {
            if let Some(name) = names
                .iter()
                .find(|name| matches!(self.supervisor.state(name), Ok(ServerState::Failed)))
            {
                return name.clone();
            }
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    async fn poll_until_running(&self, names: &[String]) -> Result<()> {
        let mut changes = self.supervisor.subscribe_changes();
        loop {
            let pending = self.not_running(names);
            if pending.is_empty() {
                return Ok(());
            }

            let results = join_all(pending.iter().map(|name| self.check(name))).await;
            for result in results {
                result?;
            }

            if self.not_running(names).is_empty() {
                return Ok(());
            }

            tokio::select! {
                _ = time::sleep(self.config.poll_interval()) => {}
                changed = changes.changed() => {
                    if changed.is_err() {
                        time::sleep(self.config.poll_interval()).await;
                    }
                }
            }
        }
    }

    fn not_running(&self, names: &[String]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !matches!(self.supervisor.state(name), Ok(ServerState::Running)))
            .cloned()
            .collect()
    }

    /// Start periodic liveness probing of `Running` servers.
    ///
    /// Results land in each server's `lastHealthCheck*` fields. The task ends
    /// when shutdown begins or [`stop_liveness_watch`](Self::stop_liveness_watch)
    /// is called.
    pub fn start_liveness_watch(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let mut task = self
            .watch_task
            .lock()
            .map_err(|_| Error::Other("Failed to lock liveness task".to_string()))?;

        if task.is_some() {
            return Ok(());
        }

        let monitor = Arc::clone(self);
        let shutdown = self.supervisor.shutdown_token();
        tracing::info!(?interval, "Starting liveness watch");

        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let running: Vec<String> = match monitor.supervisor.status() {
                    Ok(statuses) => statuses
                        .into_iter()
                        .filter(|status| status.state == ServerState::Running)
                        .map(|status| status.name)
                        .collect(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Liveness watch could not read status");
                        continue;
                    }
                };

                let results = join_all(running.iter().map(|name| monitor.check(name))).await;
                for (name, result) in running.iter().zip(results) {
                    match result {
                        Ok(HealthStatus::Unhealthy) => {
                            tracing::warn!(server = %name, "Liveness probe failed")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(server = %name, error = %e, "Liveness check error"),
                    }
                }
            }
            tracing::debug!("Liveness watch stopped");
        }));

        Ok(())
    }

    /// Stop the liveness task if it is running.
    pub fn stop_liveness_watch(&self) -> Result<()> {
        let mut task = self
            .watch_task
            .lock()
            .map_err(|_| Error::Other("Failed to lock liveness task".to_string()))?;

        if let Some(task) = task.take() {
            task.abort();
        }

        Ok(())
    }

    pub fn is_watching(&self) -> bool {
        self.watch_task
            .lock()
            .map(|task| task.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}
