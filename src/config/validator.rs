use crate::config::{Config, ProbeConfig, ServerConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Validates a single server configuration in isolation
pub fn validate_server_config(name: &str, config: &ServerConfig) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::Configuration("Server name must not be empty".to_string()));
    }

    if config.command.trim().is_empty() {
        return Err(Error::Configuration(format!(
            "Server '{}' has empty command",
            name
        )));
    }

    match &config.health {
        Some(ProbeConfig::Command { command, .. }) if command.trim().is_empty() => {
            return Err(Error::Configuration(format!(
                "Server '{}' has an empty health probe command",
                name
            )));
        }
        Some(ProbeConfig::Tcp { address }) if address.trim().is_empty() => {
            return Err(Error::Configuration(format!(
                "Server '{}' has an empty health probe address",
                name
            )));
        }
        _ => {}
    }

    Ok(())
}

/// Checks that every dependency exists and sits in a strictly lower tier.
///
/// A strictly decreasing tier along every dependency edge rules out cycles,
/// self-dependencies and same-tier dependencies in one pass.
pub fn validate_dependencies(servers: &HashMap<String, ServerConfig>) -> Result<()> {
    for (name, config) in servers {
        for dependency in &config.dependencies {
            let target = servers.get(dependency).ok_or_else(|| {
                Error::Configuration(format!(
                    "Server '{}' depends on unknown server '{}'",
                    name, dependency
                ))
            })?;

            if target.tier >= config.tier {
                return Err(Error::Configuration(format!(
                    "Server '{}' (tier {}) depends on '{}' (tier {}), which is not in a lower tier",
                    name, config.tier, dependency, target.tier
                )));
            }
        }
    }

    Ok(())
}

/// Full configuration validation
pub fn validate_config(config: &Config) -> Result<()> {
    if config.servers.is_empty() {
        return Err(Error::Configuration("No servers configured".to_string()));
    }

    for (name, server) in &config.servers {
        validate_server_config(name, server)?;
    }

    validate_dependencies(&config.servers)?;

    if config.startup.tier_timeout_ms == 0 {
        return Err(Error::Configuration(
            "startup.tierTimeoutMs must be greater than zero".to_string(),
        ));
    }
    if config.health.poll_interval_ms == 0 {
        return Err(Error::Configuration(
            "health.pollIntervalMs must be greater than zero".to_string(),
        ));
    }
    if config.health.probe_timeout_ms == 0 {
        return Err(Error::Configuration(
            "health.probeTimeoutMs must be greater than zero".to_string(),
        ));
    }
    if config.health.liveness_interval_ms == Some(0) {
        return Err(Error::Configuration(
            "health.livenessIntervalMs must be greater than zero when set".to_string(),
        ));
    }
    if config.events.capacity == 0 {
        return Err(Error::Configuration(
            "events.capacity must be greater than zero".to_string(),
        ));
    }

    Ok(())
}
