// Shared helpers for the integration tests. Each test crate uses a subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;
use tier_orchestrator::config::{
    Config, EventConfig, HealthConfig, ProbeConfig, RestartConfig, ServerConfig, StartupConfig,
};
use tier_orchestrator::{EventKind, Orchestrator, OrchestratorEvent, ServerState};
use tokio::sync::broadcast;

/// A server running `script` under `sh -c`.
pub fn sh(script: &str) -> ServerConfig {
    ServerConfig {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: HashMap::new(),
        tier: 0,
        dependencies: vec![],
        critical: false,
        health: None,
        restart: None,
    }
}

/// A long-running server that exits promptly on SIGTERM.
pub fn sleeper() -> ServerConfig {
    sh("exec sleep 30")
}

pub fn in_tier(mut server: ServerConfig, tier: u32, dependencies: &[&str]) -> ServerConfig {
    server.tier = tier;
    server.dependencies = dependencies.iter().map(|d| d.to_string()).collect();
    server
}

pub fn with_restart(mut server: ServerConfig, max_restarts: u32, restart_delay_ms: u64) -> ServerConfig {
    server.restart = Some(RestartConfig {
        max_restarts,
        restart_delay_ms,
    });
    server
}

pub fn with_probe(mut server: ServerConfig, probe: ProbeConfig) -> ServerConfig {
    server.health = Some(probe);
    server
}

/// A probe that never succeeds.
pub fn never_healthy() -> ProbeConfig {
    ProbeConfig::Command {
        command: "false".to_string(),
        args: vec![],
    }
}

/// Fast timings suitable for tests.
pub fn config(servers: Vec<(&str, ServerConfig)>) -> Config {
    Config {
        servers: servers
            .into_iter()
            .map(|(name, server)| (name.to_string(), server))
            .collect(),
        restart: RestartConfig {
            max_restarts: 3,
            restart_delay_ms: 0,
        },
        health: HealthConfig {
            poll_interval_ms: 20,
            probe_timeout_ms: 1000,
            liveness_interval_ms: None,
        },
        startup: StartupConfig {
            tier_timeout_ms: 10_000,
            stop_timeout_ms: 2_000,
        },
        events: EventConfig { capacity: 1024 },
    }
}

/// Poll until `name` reaches `state`, or give up after `timeout`.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    name: &str,
    state: ServerState,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if orchestrator
            .server_status(name)
            .map(|status| status.state == state)
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Everything currently buffered in `rx`.
pub fn drain(rx: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<EventKind> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.kind);
    }
    events
}

/// `pid` is present exactly while the server is live.
pub fn assert_pid_invariant(orchestrator: &Orchestrator) {
    for status in orchestrator.status().unwrap() {
        assert_eq!(
            status.pid.is_some(),
            status.state.is_live(),
            "pid/state mismatch for {}: {:?}",
            status.name,
            status
        );
    }
}
