/*!
 # Tier Orchestrator

 A Rust library for supervising a set of long-running server processes that
 depend on each other.

 ## Overview

 Tier Orchestrator provides functionality to:
 - Declare servers, their launch parameters, dependency tier and criticality
 - Start tiers in order, gating each tier on the previous one being healthy
 - Probe readiness and liveness with pluggable health probes
 - Restart servers that exit unexpectedly, within a bounded budget
 - Stop everything gracefully, highest tier first
 - Broadcast every lifecycle transition to external observers

 ## Basic Usage

 ```no_run
 use tier_orchestrator::{Orchestrator, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Load and validate the registry
     let orchestrator = Orchestrator::from_config_file("orchestrator.json")?;

     // Watch lifecycle events
     let mut events = orchestrator.subscribe(|_| true);
     tokio::spawn(async move {
         use futures::StreamExt;
         while let Some(event) = events.next().await {
             println!("{}", event.to_json());
         }
     });

     // Bring every tier up
     orchestrator.start_all().await?;

     for status in orchestrator.status()? {
         println!("{} {:?} restarts={}", status.name, status.state, status.restart_count);
     }

     // Stop everything, highest tier first
     let forced = orchestrator.shutdown().await?;
     println!("Force-killed: {:?}", forced);
     Ok(())
 }
 ```

 ## Features

 - **Tiered Startup**: Tier N+1 starts only once all of tier N is healthy
 - **Restart Budget**: Fixed-delay restarts up to `maxRestarts`, then `Failed`
 - **Critical Servers**: Permanent failure of a critical server aborts startup
 - **Graceful Shutdown**: SIGTERM with a SIGKILL fallback, in reverse tier order
 - **Event Stream**: Ordered per-server lifecycle events for dashboards
 - **Async Support**: Built on Tokio; every public async method is traced

 The orchestrator is Unix-only: processes are stopped with POSIX signals.

 ## License

 This project is licensed under the terms in the LICENSE file.
*/

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod registry;
pub mod server;

pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorState};
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, OrchestratorEvent};
pub use registry::{ServerDefinition, ServerRegistry};
pub use server::{
    HealthMonitor, HealthProbe, HealthStatus, RunId, ServerState, ServerStatus, StopOutcome,
    Supervisor,
};

use futures::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Supervise a registry of tiered servers
///
/// This struct is the main entry point. It is constructed once, explicitly,
/// and shared by reference (or `Arc`) with every consumer; all methods take
/// `&self`, so startup, shutdown and status queries may run concurrently.
/// All public async methods are instrumented with `tracing` spans.
pub struct Orchestrator {
    /// Configuration snapshot
    config: Config,
    /// Validated server definitions
    registry: Arc<ServerRegistry>,
    /// Owner of all server instances
    supervisor: Supervisor,
    /// Health probing
    monitor: Arc<HealthMonitor>,
    /// Tiered startup and shutdown
    coordinator: Coordinator,
    /// Lifecycle event fan-out
    events: EventBus,
}

impl Orchestrator {
    /// Create an orchestrator from a configuration file path (JSON or YAML)
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let config = Config::from_file(path)?;
        Self::new(config)
    }

    /// Create an orchestrator from a JSON configuration string
    #[tracing::instrument(skip(config))]
    pub fn from_config_str(config: &str) -> Result<Self> {
        tracing::info!("Loading configuration from string");
        let config = Config::parse_from_str(config)?;
        Self::new(config)
    }

    /// Create an orchestrator from a configuration
    ///
    /// Fails with [`Error::Configuration`] if the registry is invalid.
    pub fn new(config: Config) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building an orchestrator, e.g. to supply custom health probes
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            probes: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Bring all tiers up in order
    ///
    /// On success, starts the liveness watch if one is configured.
    #[tracing::instrument(skip(self))]
    pub async fn start_all(&self) -> Result<()> {
        self.coordinator.start_all().await?;

        if let Some(interval) = self.config.health.liveness_interval() {
            self.monitor.start_liveness_watch(interval)?;
        }

        Ok(())
    }

    /// Stop every server, highest tier first, using `stopTimeoutMs` per server
    ///
    /// Returns the servers that had to be force-killed. Shutdown is terminal:
    /// the orchestrator refuses to start servers afterwards.
    pub async fn shutdown(&self) -> Result<Vec<String>> {
        self.shutdown_all(self.config.startup.stop_timeout()).await
    }

    /// Stop every server, highest tier first, waiting up to `timeout` each
    #[tracing::instrument(skip(self))]
    pub async fn shutdown_all(&self, timeout: Duration) -> Result<Vec<String>> {
        self.coordinator.shutdown_all(timeout).await
    }

    /// Start one server, bypassing tier gating
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn start_server(&self, name: &str) -> Result<RunId> {
        self.supervisor.start(name).await
    }

    /// Stop one server using `stopTimeoutMs`
    #[tracing::instrument(skip(self), fields(server = %name))]
    pub async fn stop_server(&self, name: &str) -> Result<StopOutcome> {
        self.supervisor
            .stop(name, self.config.startup.stop_timeout())
            .await
    }

    /// Probe one server now
    pub async fn check_health(&self, name: &str) -> Result<HealthStatus> {
        self.monitor.check(name).await
    }

    /// Zero a server's restart counter
    pub fn reset_restarts(&self, name: &str) -> Result<()> {
        self.supervisor.reset_restarts(name)
    }

    /// Synchronous snapshot of every server, ordered by tier then name
    pub fn status(&self) -> Result<Vec<ServerStatus>> {
        self.supervisor.status()
    }

    pub fn server_status(&self, name: &str) -> Result<ServerStatus> {
        self.supervisor.server_status(name)
    }

    pub fn coordinator_state(&self) -> Result<CoordinatorState> {
        self.coordinator.state()
    }

    /// Stream of future events matching `predicate`
    pub fn subscribe<F>(&self, predicate: F) -> BoxStream<'static, OrchestratorEvent>
    where
        F: Fn(&OrchestratorEvent) -> bool + Send + Sync + 'static,
    {
        self.events.subscribe(predicate)
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: Config,
    probes: HashMap<String, Arc<dyn HealthProbe>>,
}

impl OrchestratorBuilder {
    /// Use `probe` for `server` instead of its configured probe
    pub fn probe(mut self, server: impl Into<String>, probe: impl HealthProbe + 'static) -> Self {
        self.probes.insert(server.into(), Arc::new(probe));
        self
    }

    /// Validate the configuration and assemble the orchestrator
    #[tracing::instrument(skip(self), fields(num_servers = self.config.servers.len()))]
    pub fn build(self) -> Result<Orchestrator> {
        let registry = Arc::new(ServerRegistry::from_config(&self.config)?);

        if let Some(unknown) = self.probes.keys().find(|name| !registry.contains(name)) {
            return Err(Error::Configuration(format!(
                "Probe supplied for unknown server '{}'",
                unknown
            )));
        }

        let events = EventBus::new(self.config.events.capacity);
        let supervisor = Supervisor::new(Arc::clone(&registry), events.clone());
        let monitor = Arc::new(HealthMonitor::new(
            supervisor.clone(),
            self.config.health,
            self.probes,
        ));
        let coordinator = Coordinator::new(
            supervisor.clone(),
            Arc::clone(&monitor),
            self.config.startup.tier_timeout(),
            self.config.startup.stop_timeout(),
        );

        tracing::info!(tiers = registry.tiers().len(), "Orchestrator ready");
        Ok(Orchestrator {
            config: self.config,
            registry,
            supervisor,
            monitor,
            coordinator,
            events,
        })
    }
}
