/// Error handling module for the tier orchestrator.
///
/// This module defines the error types used throughout the library. The
/// variants follow the orchestrator's failure taxonomy: configuration errors
/// are fatal at load time, spawn errors are retried under the restart budget,
/// tier-level errors abort a startup attempt, and `ShutdownRequested` is a
/// cooperative cancellation outcome rather than a failure.
///
/// # Example
///
/// ```
/// use tier_orchestrator::error::{Error, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Startup completed"),
///         Err(Error::StartupFailed { tier, servers, .. }) => {
///             println!("Tier {} failed: {:?}", tier, servers)
///         }
///         Err(Error::ShutdownRequested) => println!("Shutdown interrupted startup"),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the tier-orchestrator library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to read or parse configuration from a file or string.
    ///
    /// This error occurs when:
    /// - The configuration file cannot be read
    /// - The JSON or YAML is malformed
    /// - Field types are incorrect
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but describes an invalid registry.
    ///
    /// This error occurs when:
    /// - A dependency references an unknown server
    /// - A dependency is not in a strictly lower tier
    /// - A secret reference in `env` cannot be resolved
    /// - A timeout or capacity is zero
    ///
    /// Configuration errors are never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Requested server is not part of the registry.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server already has a live (or spawning) process.
    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    /// The server has no live process to act on.
    #[error("Server '{0}' is not running")]
    NotRunning(String),

    /// The operating system refused to create the process.
    ///
    /// Spawn failures are handed to the restart policy like any other
    /// unexpected exit.
    #[error("Failed to spawn server '{server}': {source}")]
    Spawn {
        /// Server name
        server: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Sending a signal to a server process failed.
    #[error("Signal error: {0}")]
    Signal(String),

    /// A set of servers did not become healthy in time.
    #[error("Timed out after {waited:?} waiting for servers to become healthy: {servers:?}")]
    Timeout {
        /// Servers that were still not healthy
        servers: Vec<String>,
        /// How long the wait lasted
        waited: Duration,
    },

    /// A server being waited on reached the terminal `Failed` state.
    #[error("Dependency '{server}' failed permanently")]
    DependencyFailed {
        /// Server that failed
        server: String,
    },

    /// The orchestrator is shutting down; the operation was cancelled.
    #[error("Shutdown requested")]
    ShutdownRequested,

    /// Tiered startup was aborted.
    ///
    /// Surfaced once per aborted run, naming the tier that could not become
    /// healthy and the servers in it that were not running.
    #[error("Startup failed at tier {tier} ({servers:?}): {reason}")]
    StartupFailed {
        /// Tier index that failed
        tier: u32,
        /// Servers in that tier that did not reach `Running`
        servers: Vec<String>,
        /// Underlying cause
        reason: String,
    },

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for tier-orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;
