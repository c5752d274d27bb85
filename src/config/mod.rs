//! Configuration module for the tier orchestrator.
//!
//! This module handles parsing, validation, and access to configuration
//! settings for supervised servers. It supports loading configurations from
//! files or strings in JSON or YAML format.
//!
//! # Examples
//!
//! Loading a configuration from a file:
//!
//! ```no_run
//! use tier_orchestrator::config::Config;
//!
//! let config = Config::from_file("orchestrator.json").unwrap();
//! println!("Loaded configuration with {} servers", config.servers.len());
//! ```
//!
//! Parsing a configuration from a string:
//!
//! ```
//! use tier_orchestrator::config::Config;
//!
//! let config = Config::parse_from_str(r#"{
//!     "servers": {
//!         "db": { "command": "postgres", "args": ["-D", "/var/lib/pg"], "critical": true },
//!         "api": { "command": "api-server", "tier": 1, "dependencies": ["db"] }
//!     }
//! }"#).unwrap();
//!
//! assert_eq!(config.servers["api"].tier, 1);
//! assert_eq!(config.restart.max_restarts, 3);
//! ```
mod parser;
pub mod validator;

pub use parser::{
    Config, EventConfig, HealthConfig, ProbeConfig, RestartConfig, ServerConfig, StartupConfig,
    expand_env,
};
pub use validator::validate_config;
