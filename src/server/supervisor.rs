//! Process supervisor: the single writer of every server instance.
//!
//! The supervisor owns the instance table. It spawns processes, stops them
//! with SIGTERM and a SIGKILL fallback, and observes each process exit exactly
//! once. Whether an unexpected exit leads to a restart is decided by the
//! server's [`RestartPolicy`](crate::server::RestartPolicy); the supervisor
//! only applies the decision.
//!
//! Every state change is published on the [`EventBus`] while the table lock is
//! held, which keeps each server's events in transition order, and bumps a
//! `watch` generation counter so waiters can re-evaluate promptly.

use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::registry::{ServerDefinition, ServerRegistry};
use crate::server::lifecycle::{
    HealthStatus, ServerInstance, ServerState, ServerStatus, StopOutcome,
};
use crate::server::probe::ProbeTarget;
use crate::server::process::{self, RunId};
use crate::server::restart::RestartDecision;
use async_process::Child;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

/// How long to wait for the exit notification after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Handle to the supervisor. Clones share the same instance table.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<ServerRegistry>,
    instances: Mutex<HashMap<String, ServerInstance>>,
    events: EventBus,
    changes: watch::Sender<u64>,
    critical: watch::Sender<Option<String>>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create one `Stopped` instance per registry definition.
    pub fn new(registry: Arc<ServerRegistry>, events: EventBus) -> Self {
        let instances = registry
            .list()
            .into_iter()
            .map(|definition| (definition.name.clone(), ServerInstance::new(definition)))
            .collect();

        Self {
            inner: Arc::new(Inner {
                registry,
                instances: Mutex::new(instances),
                events,
                changes: watch::channel(0).0,
                critical: watch::channel(None).0,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Token cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel pending restarts and refuse new starts from now on.
    pub fn begin_shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Shutdown requested; cancelling pending restarts");
            self.inner.shutdown.cancel();
        }
    }

    /// Receiver whose value changes on every state transition.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Receiver carrying the name of the last critical server to fail.
    pub fn critical_failures(&self) -> watch::Receiver<Option<String>> {
        self.inner.critical.subscribe()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ServerInstance>>> {
        self.inner
            .instances
            .lock()
            .map_err(|_| Error::Other("Failed to lock server instances".to_string()))
    }

    fn transitioned(&self) {
        self.inner.changes.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    /// Snapshot of every instance, ordered by tier then name.
    pub fn status(&self) -> Result<Vec<ServerStatus>> {
        let instances = self.lock()?;
        let mut statuses: Vec<ServerStatus> =
            instances.values().map(ServerInstance::snapshot).collect();
        statuses.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        Ok(statuses)
    }

    pub fn server_status(&self, name: &str) -> Result<ServerStatus> {
        let instances = self.lock()?;
        instances
            .get(name)
            .map(ServerInstance::snapshot)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    pub fn state(&self, name: &str) -> Result<ServerState> {
        let instances = self.lock()?;
        instances
            .get(name)
            .map(|instance| instance.state)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    pub(crate) fn probe_target(&self, name: &str) -> Result<ProbeTarget> {
        let instances = self.lock()?;
        let instance = instances
            .get(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        Ok(ProbeTarget {
            name: name.to_string(),
            state: instance.state,
            pid: instance.pid,
            run_id: instance.run_id,
            started_at: instance.started_at,
        })
    }

    /// Spawn the server's process.
    ///
    /// The instance moves to `Starting`; it becomes `Running` after its first
    /// healthy probe. A spawn failure leaves the instance in `Error` and is
    /// handed to the restart policy like any other unexpected exit.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn start(&self, name: &str) -> Result<RunId> {
        if self.is_shutting_down() {
            return Err(Error::ShutdownRequested);
        }

        let definition = {
            let mut instances = self.lock()?;
            let instance = instances
                .get_mut(name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

            if instance.spawning || instance.state.is_live() {
                tracing::debug!(state = ?instance.state, "Server already running");
                return Err(Error::AlreadyRunning(name.to_string()));
            }

            instance.cancel_pending_restart();
            instance.spawning = true;
            instance.stop_requested = false;
            Arc::clone(&instance.definition)
        };

        tracing::info!(command = %definition.command, "Starting server");
        self.spawn_instance(definition)
    }

    fn spawn_instance(&self, definition: Arc<ServerDefinition>) -> Result<RunId> {
        let name = definition.name.clone();
        let spawned = process::spawn(&definition);

        let mut instances = self.lock()?;
        let instance = instances
            .get_mut(&name)
            .ok_or_else(|| Error::ServerNotFound(name.clone()))?;
        instance.spawning = false;

        let spawned = match spawned {
            Ok(spawned) => spawned,
            Err(source) => {
                tracing::error!(server = %name, error = %source, "Failed to spawn server process");
                instance.clear_process(None);
                if instance.stop_requested {
                    instance.stop_requested = false;
                    instance.state = ServerState::Stopped;
                    self.inner.events.publish(EventKind::ServerStopped {
                        server: name.clone(),
                        forced: false,
                        exit_code: None,
                    });
                    for waiter in instance.stop_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                } else {
                    instance.state = ServerState::Error;
                    self.handle_unplanned_exit(instance);
                }
                self.transitioned();
                return Err(Error::Spawn {
                    server: name,
                    source,
                });
            }
        };

        let pid = spawned.pid;
        let run_id = RunId::new();
        instance.state = ServerState::Starting;
        instance.pid = Some(pid);
        instance.run_id = Some(run_id);
        instance.started_at = Some(SystemTime::now());
        instance.last_health = HealthStatus::Unknown;
        instance.last_health_check_at = None;
        instance.last_stop_forced = false;

        let stop_now = instance.stop_requested || self.is_shutting_down();
        instance.stop_requested = stop_now;

        tracing::info!(server = %name, pid, run_id = %run_id, "Server process spawned");
        self.inner.events.publish(EventKind::ServerStarting {
            server: name.clone(),
            pid,
        });
        self.transitioned();
        drop(instances);

        self.observe_exit(name.clone(), run_id, spawned.child);

        if stop_now {
            tracing::info!(server = %name, pid, "Stop requested while spawning; terminating");
            if let Err(e) = process::terminate(pid) {
                tracing::warn!(server = %name, error = %e, "Failed to terminate freshly spawned process");
            }
        }

        Ok(run_id)
    }

    /// The single exit observer for one process lifetime.
    fn observe_exit(&self, name: String, run_id: RunId, mut child: Child) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            let exit_code = match child.status().await {
                Ok(status) => status
                    .code()
                    .or_else(|| status.signal().map(|signal| 128 + signal)),
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "Failed to wait for server process");
                    None
                }
            };
            supervisor.on_exit(&name, run_id, exit_code);
        });
    }

    fn on_exit(&self, name: &str, run_id: RunId, exit_code: Option<i32>) {
        let mut instances = match self.lock() {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!(server = %name, error = %e, "Dropping exit notification");
                return;
            }
        };
        let Some(instance) = instances.get_mut(name) else {
            return;
        };
        if instance.run_id != Some(run_id) {
            tracing::debug!(server = %name, run_id = %run_id, "Ignoring exit of a superseded process");
            return;
        }

        instance.clear_process(exit_code);

        if instance.stop_requested {
            instance.stop_requested = false;
            instance.state = ServerState::Stopped;
            tracing::info!(server = %name, ?exit_code, forced = instance.last_stop_forced, "Server stopped");
            self.inner.events.publish(EventKind::ServerStopped {
                server: name.to_string(),
                forced: instance.last_stop_forced,
                exit_code,
            });
            for waiter in instance.stop_waiters.drain(..) {
                let _ = waiter.send(());
            }
        } else {
            tracing::warn!(server = %name, ?exit_code, "Server exited unexpectedly");
            instance.state = ServerState::Error;
            self.handle_unplanned_exit(instance);
        }

        self.transitioned();
    }

    /// Apply the restart policy to an instance that just entered `Error`.
    fn handle_unplanned_exit(&self, instance: &mut ServerInstance) {
        let name = instance.name().to_string();

        if self.is_shutting_down() {
            tracing::info!(server = %name, "Shutdown in progress; not restarting");
            return;
        }

        match instance.definition.restart.decide(instance.restart_count) {
            RestartDecision::Restart { attempt, delay } => {
                instance.restart_count = attempt;
                instance.state = ServerState::Restarting;
                tracing::info!(
                    server = %name,
                    attempt,
                    max_restarts = instance.definition.restart.max_restarts,
                    ?delay,
                    "Scheduling restart"
                );
                self.inner.events.publish(EventKind::ServerRestarting {
                    server: name.clone(),
                    attempt,
                    exit_code: instance.last_exit_code,
                });

                let token = self.inner.shutdown.child_token();
                instance.pending_restart = Some(token.clone());
                self.schedule_restart(name, delay, token);
            }
            RestartDecision::GiveUp => {
                instance.state = ServerState::Failed;
                tracing::error!(
                    server = %name,
                    restarts = instance.restart_count,
                    critical = instance.definition.critical,
                    "Restart budget exhausted; server failed"
                );
                self.inner.events.publish(EventKind::ServerFailed {
                    server: name.clone(),
                    restarts: instance.restart_count,
                    exit_code: instance.last_exit_code,
                });
                if instance.definition.critical {
                    self.inner.critical.send_replace(Some(name));
                }
            }
        }
    }

    fn schedule_restart(&self, name: String, delay: Duration, token: CancellationToken) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(server = %name, "Pending restart cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    supervisor.restart_now(&name, &token);
                }
            }
        });
    }

    fn restart_now(&self, name: &str, token: &CancellationToken) {
        let definition = {
            let mut instances = match self.lock() {
                Ok(instances) => instances,
                Err(e) => {
                    tracing::error!(server = %name, error = %e, "Dropping scheduled restart");
                    return;
                }
            };
            let Some(instance) = instances.get_mut(name) else {
                return;
            };
            // A manual start or stop cancels the token under this same lock.
            if token.is_cancelled() || instance.state != ServerState::Restarting {
                return;
            }
            instance.pending_restart = None;
            instance.spawning = true;
            instance.stop_requested = false;
            tracing::info!(server = %name, attempt = instance.restart_count, "Restarting server");
            Arc::clone(&instance.definition)
        };

        if let Err(e) = self.spawn_instance(definition) {
            tracing::debug!(server = %name, error = %e, "Restart attempt did not spawn");
        }
    }

    /// Stop the server: SIGTERM, wait up to `timeout`, then SIGKILL.
    ///
    /// Always ends in `Stopped` on success. A pending restart is cancelled and
    /// the instance marked `Stopped` without signalling anything.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn stop(&self, name: &str, timeout: Duration) -> Result<StopOutcome> {
        let (pid, mut exited) = {
            let mut instances = self.lock()?;
            let instance = instances
                .get_mut(name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

            if !instance.spawning {
                match instance.state {
                    ServerState::Starting | ServerState::Running => {}
                    ServerState::Restarting => {
                        instance.cancel_pending_restart();
                        instance.state = ServerState::Stopped;
                        tracing::info!("Cancelled pending restart; server stopped");
                        self.inner.events.publish(EventKind::ServerStopped {
                            server: name.to_string(),
                            forced: false,
                            exit_code: instance.last_exit_code,
                        });
                        self.transitioned();
                        return Ok(StopOutcome::Graceful);
                    }
                    ServerState::Stopped | ServerState::Error | ServerState::Failed => {
                        return Err(Error::NotRunning(name.to_string()));
                    }
                }
            }

            instance.cancel_pending_restart();
            instance.stop_requested = true;
            let (tx, rx) = oneshot::channel();
            instance.stop_waiters.push(tx);
            (instance.pid, rx)
        };

        if let Some(pid) = pid {
            tracing::info!(pid, "Sending SIGTERM");
            process::terminate(pid)?;
        }

        if tokio::time::timeout(timeout, &mut exited).await.is_ok() {
            return Ok(StopOutcome::Graceful);
        }

        tracing::warn!(?timeout, "Server did not exit in time; sending SIGKILL");
        let pid = {
            let mut instances = self.lock()?;
            let instance = instances
                .get_mut(name)
                .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
            // Exit notifications are delivered under this lock.
            if exited.try_recv().is_ok() {
                tracing::debug!("Server exited just after the stop timeout");
                return Ok(StopOutcome::Graceful);
            }
            instance.last_stop_forced = true;
            instance.pid
        };
        if let Some(pid) = pid {
            process::kill(pid)?;
        }

        match tokio::time::timeout(KILL_GRACE, exited).await {
            Ok(_) => Ok(StopOutcome::Forced),
            Err(_) => Err(Error::Timeout {
                servers: vec![name.to_string()],
                waited: timeout + KILL_GRACE,
            }),
        }
    }

    /// Record a probe result for the process identified by `run_id`.
    ///
    /// Results for a superseded process are ignored. The first healthy result
    /// moves a `Starting` instance to `Running`.
    pub(crate) fn record_health(
        &self,
        name: &str,
        run_id: RunId,
        result: HealthStatus,
    ) -> Result<ServerState> {
        let mut instances = self.lock()?;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;

        if instance.run_id != Some(run_id) {
            tracing::debug!(server = %name, run_id = %run_id, "Ignoring probe result for a superseded process");
            return Ok(instance.state);
        }

        instance.last_health = result;
        instance.last_health_check_at = Some(SystemTime::now());

        if let (HealthStatus::Healthy, ServerState::Starting, Some(pid)) =
            (result, instance.state, instance.pid)
        {
            instance.state = ServerState::Running;
            tracing::info!(server = %name, pid, "Server is healthy and running");
            self.inner.events.publish(EventKind::ServerStarted {
                server: name.to_string(),
                pid,
            });
            self.transitioned();
        }

        Ok(instance.state)
    }

    /// Administrative reset of the restart counter.
    ///
    /// Does not leave `Failed`; an explicit start is still required.
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub fn reset_restarts(&self, name: &str) -> Result<()> {
        let mut instances = self.lock()?;
        let instance = instances
            .get_mut(name)
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))?;
        tracing::info!(previous = instance.restart_count, "Resetting restart count");
        instance.restart_count = 0;
        self.transitioned();
        Ok(())
    }
}
