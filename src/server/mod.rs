/// Server supervision module for the tier orchestrator.
///
/// This module owns everything that happens to an individual server: spawning
/// and signalling its process, tracking its lifecycle state, probing its
/// health, and deciding whether to restart it after an unexpected exit.
///
/// # Components
///
/// * `lifecycle` - Server states, health results and status snapshots
/// * `monitor` - Health probing, readiness waits and the liveness watch
/// * `probe` - The `HealthProbe` trait and built-in probes
/// * `process` - OS process spawning and signals
/// * `restart` - The restart budget and its decision rule
/// * `supervisor` - The single owner of every server instance
///
/// # Examples
///
/// Deciding whether to restart:
///
/// ```
/// use tier_orchestrator::server::{RestartDecision, RestartPolicy};
/// use std::time::Duration;
///
/// let policy = RestartPolicy::new(2, Duration::from_millis(500));
/// assert!(matches!(policy.decide(0), RestartDecision::Restart { attempt: 1, .. }));
/// assert_eq!(policy.decide(2), RestartDecision::GiveUp);
/// ```
///
/// Plugging in a custom probe:
///
/// ```
/// use async_trait::async_trait;
/// use tier_orchestrator::Result;
/// use tier_orchestrator::server::{HealthProbe, ProbeTarget};
///
/// struct ReadyFile(std::path::PathBuf);
///
/// #[async_trait]
/// impl HealthProbe for ReadyFile {
///     async fn check(&self, _target: &ProbeTarget) -> Result<()> {
///         if self.0.exists() {
///             Ok(())
///         } else {
///             Err(tier_orchestrator::Error::Other("not ready".to_string()))
///         }
///     }
/// }
/// ```
pub mod lifecycle;
pub mod monitor;
pub mod probe;
mod process;
pub mod restart;
pub mod supervisor;

pub use lifecycle::{HealthStatus, ServerState, ServerStatus, StopOutcome};
pub use monitor::HealthMonitor;
pub use probe::{CommandProbe, HealthProbe, ProbeTarget, ProcessProbe, TcpProbe, probe_from_config};
pub use process::RunId;
pub use restart::{RestartDecision, RestartPolicy};
pub use supervisor::Supervisor;
