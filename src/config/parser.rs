use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration for a single supervised server.
///
/// This structure defines how to launch one server process, where it sits in
/// the startup order, and how its readiness is determined.
///
/// # Examples
///
/// ```
/// use tier_orchestrator::config::{ProbeConfig, ServerConfig};
/// use std::collections::HashMap;
///
/// let mut env = HashMap::new();
/// env.insert("DATABASE_URL".to_string(), "postgres://${DB_USER}@localhost/app".to_string());
///
/// let api = ServerConfig {
///     command: "api-server".to_string(),
///     args: vec!["--port".to_string(), "8080".to_string()],
///     env,
///     tier: 1,
///     dependencies: vec!["db".to_string()],
///     critical: true,
///     health: Some(ProbeConfig::Tcp { address: "127.0.0.1:8080".to_string() }),
///     restart: None,
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Command to execute when starting the server.
    /// This can be an absolute path or a command available in the PATH.
    pub command: String,

    /// Command-line arguments to pass to the server.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set when launching the server.
    /// Values may reference the orchestrator's environment as `${NAME}`.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Dependency tier. Tier 0 starts first.
    #[serde(default)]
    pub tier: u32,

    /// Servers that must be healthy before this one starts. All of them must
    /// live in a strictly lower tier.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Whether permanent failure of this server aborts tiered startup.
    #[serde(default)]
    pub critical: bool,

    /// Readiness probe. Defaults to a process liveness probe.
    #[serde(default)]
    pub health: Option<ProbeConfig>,

    /// Per-server restart budget, overriding the global one.
    #[serde(default)]
    pub restart: Option<RestartConfig>,
}

/// How the health monitor decides that a server is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ProbeConfig {
    /// Healthy while the process is alive and has been up for `min_uptime_ms`.
    #[serde(rename_all = "camelCase")]
    Process {
        #[serde(default = "default_min_uptime_ms")]
        min_uptime_ms: u64,
    },
    /// Healthy when the command exits with status 0.
    Command {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Healthy when a TCP connection to `address` succeeds.
    Tcp { address: String },
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::Process {
            min_uptime_ms: default_min_uptime_ms(),
        }
    }
}

/// Restart budget applied when a server exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartConfig {
    /// Automatic restarts allowed before the server is marked failed.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Fixed delay before each restart, in milliseconds.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl RestartConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

/// Health monitor cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    /// Delay between probe rounds while waiting for readiness.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single probe invocation.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// When set, running servers are probed at this interval after startup.
    #[serde(default)]
    pub liveness_interval_ms: Option<u64>,
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Option<Duration> {
        self.liveness_interval_ms.map(Duration::from_millis)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            liveness_interval_ms: None,
        }
    }
}

/// Timeouts for tiered startup and shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupConfig {
    /// How long a whole tier may take to become healthy.
    #[serde(default = "default_tier_timeout_ms")]
    pub tier_timeout_ms: u64,
    /// Grace period between SIGTERM and SIGKILL when stopping a server.
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl StartupConfig {
    pub fn tier_timeout(&self) -> Duration {
        Duration::from_millis(self.tier_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            tier_timeout_ms: default_tier_timeout_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

/// Event bus sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventConfig {
    /// Events buffered per subscriber, and retained in history.
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

fn default_min_uptime_ms() -> u64 {
    500
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_tier_timeout_ms() -> u64 {
    30_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

fn default_event_capacity() -> usize {
    256
}

/// Main configuration for the orchestrator.
///
/// # JSON Schema
///
/// ```json
/// {
///   "servers": {
///     "db": {
///       "command": "postgres",
///       "args": ["-D", "/var/lib/postgres"],
///       "critical": true,
///       "health": { "type": "tcp", "address": "127.0.0.1:5432" }
///     },
///     "api": {
///       "command": "api-server",
///       "tier": 1,
///       "dependencies": ["db"],
///       "env": { "DB_PASSWORD": "${DB_PASSWORD}" },
///       "restart": { "maxRestarts": 5, "restartDelayMs": 500 }
///     }
///   },
///   "restart": { "maxRestarts": 3, "restartDelayMs": 1000 },
///   "health": { "pollIntervalMs": 250, "probeTimeoutMs": 2000 },
///   "startup": { "tierTimeoutMs": 30000, "stopTimeoutMs": 10000 },
///   "events": { "capacity": 256 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Map of server names to their configurations.
    pub servers: HashMap<String, ServerConfig>,

    /// Default restart budget.
    #[serde(default)]
    pub restart: RestartConfig,

    /// Health monitor cadence.
    #[serde(default)]
    pub health: HealthConfig,

    /// Startup and shutdown timeouts.
    #[serde(default)]
    pub startup: StartupConfig,

    /// Event bus sizing.
    #[serde(default)]
    pub events: EventConfig,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, anything else as
    /// JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not conform to the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Restart budget for `server`, falling back to the global default.
    pub fn restart_for(&self, server: &ServerConfig) -> RestartConfig {
        server.restart.unwrap_or(self.restart)
    }
}

/// Expands `${NAME}` references in `value` using `lookup`.
///
/// A reference that `lookup` cannot resolve, or an unterminated `${`, is a
/// configuration error. Text outside references is copied verbatim.
///
/// ```
/// use tier_orchestrator::config::expand_env;
///
/// let value = expand_env("user=${USER_NAME}", |name| {
///     (name == "USER_NAME").then(|| "admin".to_string())
/// }).unwrap();
/// assert_eq!(value, "user=admin");
/// ```
pub fn expand_env(value: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        expanded.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            Error::Configuration(format!("Unterminated '${{' in value '{}'", value))
        })?;
        let name = &after[..end];
        if name.is_empty() {
            return Err(Error::Configuration(format!(
                "Empty variable reference in value '{}'",
                value
            )));
        }
        let resolved = lookup(name).ok_or_else(|| {
            Error::Configuration(format!("Environment variable '{}' is not set", name))
        })?;
        expanded.push_str(&resolved);
        rest = &after[end + 1..];
    }
    expanded.push_str(rest);

    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config_str = r#"{
            "servers": {
                "cache": {
                    "command": "redis-server",
                    "args": ["--port", "6380"]
                }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        assert_eq!(config.servers.len(), 1);
        let cache = &config.servers["cache"];
        assert_eq!(cache.command, "redis-server");
        assert_eq!(cache.args, vec!["--port", "6380"]);
        assert_eq!(cache.tier, 0);
        assert!(!cache.critical);
        assert!(cache.dependencies.is_empty());
        assert_eq!(cache.health, None);
        assert_eq!(config.restart, RestartConfig::default());
        assert_eq!(config.startup.tier_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_probe_variants() {
        let config_str = r#"{
            "servers": {
                "a": { "command": "a", "health": { "type": "tcp", "address": "127.0.0.1:9000" } },
                "b": { "command": "b", "health": { "type": "command", "command": "pg_isready" } },
                "c": { "command": "c", "health": { "type": "process", "minUptimeMs": 2000 } },
                "d": { "command": "d", "health": { "type": "process" } }
            }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        assert_eq!(
            config.servers["a"].health,
            Some(ProbeConfig::Tcp {
                address: "127.0.0.1:9000".to_string()
            })
        );
        assert_eq!(
            config.servers["b"].health,
            Some(ProbeConfig::Command {
                command: "pg_isready".to_string(),
                args: vec![]
            })
        );
        assert_eq!(
            config.servers["c"].health,
            Some(ProbeConfig::Process { min_uptime_ms: 2000 })
        );
        assert_eq!(config.servers["d"].health, Some(ProbeConfig::default()));
        assert_eq!(
            ProbeConfig::default(),
            ProbeConfig::Process { min_uptime_ms: 500 }
        );
    }

    #[test]
    fn test_restart_override() {
        let config_str = r#"{
            "servers": {
                "flaky": { "command": "flaky", "restart": { "maxRestarts": 10 } },
                "steady": { "command": "steady" }
            },
            "restart": { "maxRestarts": 1, "restartDelayMs": 50 }
        }"#;

        let config = Config::parse_from_str(config_str).unwrap();

        let flaky = config.restart_for(&config.servers["flaky"]);
        assert_eq!(flaky.max_restarts, 10);
        assert_eq!(flaky.restart_delay_ms, 1000);

        let steady = config.restart_for(&config.servers["steady"]);
        assert_eq!(steady.max_restarts, 1);
        assert_eq!(steady.restart_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_expand_env() {
        let lookup = |name: &str| match name {
            "USER" => Some("svc".to_string()),
            "PASS" => Some("s3cret".to_string()),
            _ => None,
        };

        assert_eq!(expand_env("plain", lookup).unwrap(), "plain");
        assert_eq!(
            expand_env("${USER}:${PASS}@db", lookup).unwrap(),
            "svc:s3cret@db"
        );
        assert!(matches!(
            expand_env("${MISSING}", lookup),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            expand_env("broken ${USER", lookup),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            expand_env("${}", lookup),
            Err(Error::Configuration(_))
        ));
    }
}
