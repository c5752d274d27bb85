//! Static catalogue of the servers an orchestrator manages.
//!
//! The registry is built once from a [`Config`] snapshot and validated
//! eagerly: unknown dependencies, dependencies that do not point to a strictly
//! lower tier, and unresolvable `${NAME}` secret references are all reported
//! as [`Error::Configuration`] at load time.

use crate::config::{Config, ProbeConfig, expand_env, validate_config};
use crate::error::{Error, Result};
use crate::server::RestartPolicy;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Immutable launch parameters for one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDefinition {
    /// Unique key
    pub name: String,
    /// Executable
    pub command: String,
    /// Ordered argument vector
    pub args: Vec<String>,
    /// Environment with secret references already resolved
    pub env: HashMap<String, String>,
    /// Dependency tier
    pub tier: u32,
    /// Servers in lower tiers that must be healthy first
    pub dependencies: BTreeSet<String>,
    /// Permanent failure aborts startup
    pub critical: bool,
    /// Readiness probe
    pub probe: ProbeConfig,
    /// Restart budget
    pub restart: RestartPolicy,
}

/// Validated set of server definitions.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    definitions: BTreeMap<String, Arc<ServerDefinition>>,
}

impl ServerRegistry {
    /// Build a registry, resolving secrets from the process environment.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::from_config_with_env(config, |name| std::env::var(name).ok())
    }

    /// Build a registry with an explicit lookup for `${NAME}` references.
    #[tracing::instrument(skip_all, fields(num_servers = config.servers.len()))]
    pub fn from_config_with_env(
        config: &Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        validate_config(config)?;

        let mut definitions = BTreeMap::new();
        for (name, server) in &config.servers {
            let mut env = HashMap::with_capacity(server.env.len());
            for (key, value) in &server.env {
                let resolved = expand_env(value, &lookup).map_err(|e| {
                    Error::Configuration(format!("Server '{}', env '{}': {}", name, key, e))
                })?;
                env.insert(key.clone(), resolved);
            }

            let definition = ServerDefinition {
                name: name.clone(),
                command: server.command.clone(),
                args: server.args.clone(),
                env,
                tier: server.tier,
                dependencies: server.dependencies.iter().cloned().collect(),
                critical: server.critical,
                probe: server.health.clone().unwrap_or_default(),
                restart: config.restart_for(server).into(),
            };
            definitions.insert(name.clone(), Arc::new(definition));
        }

        tracing::debug!(tiers = ?definitions.values().map(|d| d.tier).collect::<BTreeSet<_>>(), "Registry loaded");
        Ok(Self { definitions })
    }

    /// All definitions, ordered by name.
    pub fn list(&self) -> Vec<Arc<ServerDefinition>> {
        self.definitions.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Result<Arc<ServerDefinition>> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Definitions grouped by tier, tiers ascending, names ascending within a tier.
    pub fn tiers(&self) -> Vec<(u32, Vec<Arc<ServerDefinition>>)> {
        let mut tiers: BTreeMap<u32, Vec<Arc<ServerDefinition>>> = BTreeMap::new();
        for definition in self.definitions.values() {
            tiers
                .entry(definition.tier)
                .or_default()
                .push(Arc::clone(definition));
        }
        tiers.into_iter().collect()
    }
}
