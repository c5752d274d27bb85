use crate::registry::ServerDefinition;
use crate::server::process::RunId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a server instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerState {
    /// No process; initial state and the result of a planned stop
    Stopped,
    /// Process spawned, waiting for the first healthy probe
    Starting,
    /// Process spawned and confirmed healthy
    Running,
    /// Process exited unexpectedly and the restart policy is deciding
    Error,
    /// A restart is scheduled
    Restarting,
    /// Restart budget exhausted; not left automatically
    Failed,
}

impl ServerState {
    /// Whether a process is (or may still be) alive in this state.
    pub fn is_live(self) -> bool {
        matches!(self, ServerState::Starting | ServerState::Running)
    }
}

/// Result of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    /// Probe succeeded
    Healthy,
    /// Probe failed or timed out, or the server is in an error state
    Unhealthy,
    /// Not probed, or nothing to probe
    Unknown,
}

/// How a planned stop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopOutcome {
    /// Exited after SIGTERM within the timeout
    Graceful,
    /// Had to be killed with SIGKILL
    Forced,
}

/// Mutable runtime record for one server, owned by the supervisor.
pub(crate) struct ServerInstance {
    pub(crate) definition: Arc<ServerDefinition>,
    pub(crate) state: ServerState,
    pub(crate) pid: Option<u32>,
    pub(crate) run_id: Option<RunId>,
    pub(crate) started_at: Option<SystemTime>,
    pub(crate) last_exit_code: Option<i32>,
    pub(crate) restart_count: u32,
    pub(crate) last_health_check_at: Option<SystemTime>,
    pub(crate) last_health: HealthStatus,
    pub(crate) last_stop_forced: bool,
    /// A spawn is in flight; guards against concurrent starts
    pub(crate) spawning: bool,
    /// The current process is being stopped by an operator
    pub(crate) stop_requested: bool,
    pub(crate) stop_waiters: Vec<oneshot::Sender<()>>,
    pub(crate) pending_restart: Option<CancellationToken>,
}

impl ServerInstance {
    pub(crate) fn new(definition: Arc<ServerDefinition>) -> Self {
        Self {
            definition,
            state: ServerState::Stopped,
            pid: None,
            run_id: None,
            started_at: None,
            last_exit_code: None,
            restart_count: 0,
            last_health_check_at: None,
            last_health: HealthStatus::Unknown,
            last_stop_forced: false,
            spawning: false,
            stop_requested: false,
            stop_waiters: Vec::new(),
            pending_restart: None,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.definition.name
    }

    /// Forget the current process after it has exited.
    pub(crate) fn clear_process(&mut self, exit_code: Option<i32>) {
        self.pid = None;
        self.run_id = None;
        self.last_exit_code = exit_code;
    }

    pub(crate) fn cancel_pending_restart(&mut self) {
        if let Some(token) = self.pending_restart.take() {
            token.cancel();
        }
    }

    pub(crate) fn snapshot(&self) -> ServerStatus {
        ServerStatus {
            name: self.definition.name.clone(),
            tier: self.definition.tier,
            critical: self.definition.critical,
            state: self.state,
            pid: self.pid,
            run_id: self.run_id,
            started_at: self.started_at,
            restart_count: self.restart_count,
            max_restarts: self.definition.restart.max_restarts,
            last_exit_code: self.last_exit_code,
            last_health_check_at: self.last_health_check_at,
            last_health_check_result: self.last_health,
            last_stop_forced: self.last_stop_forced,
        }
    }
}

/// Point-in-time view of one server, suitable for dashboards
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub tier: u32,
    pub critical: bool,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub run_id: Option<RunId>,
    pub started_at: Option<SystemTime>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub last_exit_code: Option<i32>,
    pub last_health_check_at: Option<SystemTime>,
    pub last_health_check_result: HealthStatus,
    /// The most recent planned stop needed SIGKILL
    pub last_stop_forced: bool,
}
