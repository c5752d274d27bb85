//! Restart policy for servers that exit unexpectedly.
//!
//! The policy only decides; the supervisor applies the decision. Keeping the
//! rule free of process handles and locks lets it be tested on its own.

use crate::config::RestartConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded restart budget with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Automatic restarts allowed before giving up
    pub max_restarts: u32,
    /// Delay before each restart
    pub restart_delay: Duration,
}

/// Outcome of applying the policy to an unexpected exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`; `attempt` is the new restart count (1-based)
    Restart { attempt: u32, delay: Duration },
    /// Budget exhausted; the server becomes `Failed`
    GiveUp,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, restart_delay: Duration) -> Self {
        Self {
            max_restarts,
            restart_delay,
        }
    }

    /// Decide what to do after an unexpected exit, given how many automatic
    /// restarts have already been spent.
    pub fn decide(&self, restart_count: u32) -> RestartDecision {
        if restart_count < self.max_restarts {
            RestartDecision::Restart {
                attempt: restart_count + 1,
                delay: self.restart_delay,
            }
        } else {
            RestartDecision::GiveUp
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartConfig::default().into()
    }
}

impl From<RestartConfig> for RestartPolicy {
    fn from(config: RestartConfig) -> Self {
        Self::new(config.max_restarts, config.restart_delay())
    }
}
