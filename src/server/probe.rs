//! Pluggable readiness/liveness probes.
//!
//! A probe answers one question for one live process: is it healthy right
//! now? `Ok(())` means healthy; any error means unhealthy, and the error text
//! is only used for logging. The health monitor bounds every call with its
//! configured probe timeout, so probes need not enforce one themselves.

use crate::config::ProbeConfig;
use crate::error::{Error, Result};
use crate::server::lifecycle::ServerState;
use crate::server::process::{self, RunId};
use async_process::{Command, Stdio};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;

/// What a probe is asked to check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    /// Server name
    pub name: String,
    /// State at the time the probe was scheduled
    pub state: ServerState,
    /// Pid of the live process
    pub pid: Option<u32>,
    /// Process lifetime being probed
    pub run_id: Option<RunId>,
    /// When the process was spawned
    pub started_at: Option<SystemTime>,
}

impl ProbeTarget {
    /// Time since spawn, zero if unknown.
    pub fn uptime(&self) -> Duration {
        self.started_at
            .and_then(|started| started.elapsed().ok())
            .unwrap_or_default()
    }
}

/// A black-box health check for one server.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check the target; `Ok(())` means healthy.
    async fn check(&self, target: &ProbeTarget) -> Result<()>;
}

/// Healthy while the process exists and has been up for `min_uptime`.
///
/// A process that exits before `min_uptime` elapses is never reported
/// healthy, so a server that crashes right after spawn cannot pass its tier.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    pub min_uptime: Duration,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self {
            min_uptime: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl HealthProbe for ProcessProbe {
    async fn check(&self, target: &ProbeTarget) -> Result<()> {
        let pid = target
            .pid
            .ok_or_else(|| Error::NotRunning(target.name.clone()))?;

        if !process::is_alive(pid) {
            return Err(Error::NotRunning(target.name.clone()));
        }

        let uptime = target.uptime();
        if uptime < self.min_uptime {
            return Err(Error::Other(format!(
                "Server '{}' up for {:?}, needs {:?}",
                target.name, uptime, self.min_uptime
            )));
        }

        Ok(())
    }
}

/// Healthy when the command exits with status 0.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    pub command: String,
    pub args: Vec<String>,
}

#[async_trait]
impl HealthProbe for CommandProbe {
    async fn check(&self, target: &ProbeTarget) -> Result<()> {
        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(pid) = target.pid {
            command.env("SERVER_PID", pid.to_string());
        }
        command.env("SERVER_NAME", &target.name);

        let status = command
            .status()
            .await
            .map_err(|e| Error::Other(format!("Failed to run probe '{}': {}", self.command, e)))?;

        if status.success() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "Probe '{}' exited with {}",
                self.command, status
            )))
        }
    }
}

/// Healthy when a TCP connection to `address` can be opened.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub address: String,
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self, _target: &ProbeTarget) -> Result<()> {
        TcpStream::connect(self.address.as_str())
            .await
            .map(|_| ())
            .map_err(|e| Error::Other(format!("Connect to {} failed: {}", self.address, e)))
    }
}

/// Build the probe described by a configuration entry.
pub fn probe_from_config(config: &ProbeConfig) -> Arc<dyn HealthProbe> {
    match config {
        ProbeConfig::Process { min_uptime_ms } => Arc::new(ProcessProbe {
            min_uptime: Duration::from_millis(*min_uptime_ms),
        }),
        ProbeConfig::Command { command, args } => Arc::new(CommandProbe {
            command: command.clone(),
            args: args.clone(),
        }),
        ProbeConfig::Tcp { address } => Arc::new(TcpProbe {
            address: address.clone(),
        }),
    }
}
