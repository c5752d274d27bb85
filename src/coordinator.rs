//! Tiered startup and ordered shutdown.
//!
//! Startup walks the registry's tiers in ascending order. All servers of a
//! tier are started concurrently, then the whole tier must become healthy
//! within the tier timeout before the next tier begins. A tier that times
//! out, loses a member to `Failed`, or sees a critical server fail anywhere
//! aborts the run: everything still running is stopped, highest tier first,
//! and a single [`Error::StartupFailed`] is returned naming the servers that
//! caused it. The coordinator never retries on its own.

use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::server::{HealthMonitor, ServerState, StopOutcome, Supervisor};
use futures::future::join_all;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Progress of tiered startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum CoordinatorState {
    /// Startup has not been requested
    Idle,
    /// Waiting for tier `tier` to become healthy
    StartingTier { tier: u32 },
    /// Every tier is healthy
    AllStarted,
    /// Startup gave up at `tier`
    Aborted { tier: u32 },
}

/// Sequences bring-up across tiers and tear-down in reverse.
pub struct Coordinator {
    supervisor: Supervisor,
    monitor: Arc<HealthMonitor>,
    events: EventBus,
    tier_timeout: Duration,
    stop_timeout: Duration,
    state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new(
        supervisor: Supervisor,
        monitor: Arc<HealthMonitor>,
        tier_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        let events = supervisor.events().clone();
        Self {
            supervisor,
            monitor,
            events,
            tier_timeout,
            stop_timeout,
            state: Mutex::new(CoordinatorState::Idle),
        }
    }

    pub fn state(&self) -> Result<CoordinatorState> {
        self.state
            .lock()
            .map(|state| *state)
            .map_err(|_| Error::Other("Failed to lock coordinator state".to_string()))
    }

    fn set_state(&self, next: CoordinatorState) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Other("Failed to lock coordinator state".to_string()))?;
        tracing::debug!(from = ?*state, to = ?next, "Coordinator transition");
        *state = next;
        Ok(())
    }

    /// Bring every tier up in order.
    ///
    /// May be re-invoked after an abort. Returns immediately if everything has
    /// already started.
    #[tracing::instrument(skip(self))]
    pub async fn start_all(&self) -> Result<()> {
        let tiers = self.supervisor.registry().tiers();
        let first_tier = tiers.first().map_or(0, |(tier, _)| *tier);

        {
            let mut state = self
                .state
                .lock()
                .map_err(|_| Error::Other("Failed to lock coordinator state".to_string()))?;
            match *state {
                CoordinatorState::AllStarted => return Ok(()),
                CoordinatorState::StartingTier { .. } => {
                    return Err(Error::Other("Startup is already in progress".to_string()));
                }
                CoordinatorState::Idle | CoordinatorState::Aborted { .. } => {
                    *state = CoordinatorState::StartingTier { tier: first_tier };
                }
            }
        }

        if self.supervisor.is_shutting_down() {
            return Err(self.abort(first_tier, &[], Error::ShutdownRequested).await);
        }

        let mut critical = self.supervisor.critical_failures();
        critical.borrow_and_update();

        if let Some(server) = self.failed_critical_server()? {
            return Err(self
                .abort(first_tier, &[], Error::DependencyFailed { server })
                .await);
        }

        for (tier, definitions) in tiers {
            let names: Vec<String> = definitions.iter().map(|d| d.name.clone()).collect();
            self.set_state(CoordinatorState::StartingTier { tier })?;
            tracing::info!(tier, servers = ?names, "Starting tier");

            let started = join_all(names.iter().map(|name| self.supervisor.start(name))).await;
            for (name, result) in names.iter().zip(started) {
                match result {
                    Ok(_) | Err(Error::AlreadyRunning(_)) => {}
                    Err(Error::ShutdownRequested) => {
                        return Err(self.abort(tier, &names, Error::ShutdownRequested).await);
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, error = %e, "Start failed; restart budget applies");
                    }
                }
            }

            let outcome = tokio::select! {
                result = self.monitor.wait_until_healthy(&names, self.tier_timeout) => result,
                server = wait_for_critical(&mut critical) => Err(Error::DependencyFailed { server }),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!(tier, "Tier healthy");
                    self.events.publish(EventKind::TierHealthy { tier });
                }
                Err(e) => return Err(self.abort(tier, &names, e).await),
            }
        }

        self.set_state(CoordinatorState::AllStarted)?;
        tracing::info!("All tiers started");
        Ok(())
    }

    fn failed_critical_server(&self) -> Result<Option<String>> {
        Ok(self
            .supervisor
            .status()?
            .into_iter()
            .find(|status| status.critical && status.state == ServerState::Failed)
            .map(|status| status.name))
    }

    async fn abort(&self, tier: u32, names: &[String], cause: Error) -> Error {
        let reason = cause.to_string();

        if matches!(cause, Error::ShutdownRequested) {
            tracing::info!(tier, "Startup interrupted by shutdown");
            if let Err(e) = self.set_state(CoordinatorState::Aborted { tier }) {
                tracing::error!(error = %e, "Failed to record abort");
            }
            self.events
                .publish(EventKind::StartupAborted { tier, reason });
            return Error::ShutdownRequested;
        }

        // Offenders are fixed before anything is stopped.
        let servers = match cause {
            Error::Timeout { servers, .. } => servers,
            Error::DependencyFailed { server } => vec![server],
            _ => names
                .iter()
                .filter(|name| !matches!(self.supervisor.state(name), Ok(ServerState::Running)))
                .cloned()
                .collect(),
        };

        tracing::error!(tier, %reason, ?servers, "Aborting startup");
        let forced = self.stop_descending(self.stop_timeout).await;
        if !forced.is_empty() {
            tracing::warn!(?forced, "Servers force-killed during abort");
        }

        if let Err(e) = self.set_state(CoordinatorState::Aborted { tier }) {
            tracing::error!(error = %e, "Failed to record abort");
        }
        self.events.publish(EventKind::StartupAborted {
            tier,
            reason: reason.clone(),
        });

        Error::StartupFailed {
            tier,
            servers,
            reason,
        }
    }

    /// Stop every running server, highest tier first, and cancel pending
    /// restarts. Returns the servers that had to be force-killed.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_all(&self, timeout: Duration) -> Result<Vec<String>> {
        self.supervisor.begin_shutdown();
        self.monitor.stop_liveness_watch()?;
        let forced = self.stop_descending(timeout).await;
        tracing::info!(?forced, "Shutdown complete");
        Ok(forced)
    }

    /// Best-effort stop in strictly descending tier order. Servers within a
    /// tier are stopped concurrently; a tier is fully stopped before the next
    /// lower tier receives any signal.
    async fn stop_descending(&self, timeout: Duration) -> Vec<String> {
        let mut forced = Vec::new();

        for (tier, definitions) in self.supervisor.registry().tiers().into_iter().rev() {
            let names: Vec<String> = definitions
                .iter()
                .map(|d| d.name.clone())
                .filter(|name| {
                    matches!(
                        self.supervisor.state(name),
                        Ok(ServerState::Starting | ServerState::Running | ServerState::Restarting)
                    )
                })
                .collect();

            if names.is_empty() {
                continue;
            }

            tracing::info!(tier, servers = ?names, "Stopping tier");
            let results = join_all(names.iter().map(|name| self.supervisor.stop(name, timeout))).await;

            for (name, result) in names.into_iter().zip(results) {
                match result {
                    Ok(StopOutcome::Graceful) | Err(Error::NotRunning(_)) => {}
                    Ok(StopOutcome::Forced) => forced.push(name),
                    Err(e) => tracing::warn!(server = %name, error = %e, "Failed to stop server"),
                }
            }
        }

        forced
    }
}

async fn wait_for_critical(critical: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if critical.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if let Some(server) = critical.borrow_and_update().clone() {
            return server;
        }
    }
}
