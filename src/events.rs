//! Lifecycle event broadcasting.
//!
//! This module publishes orchestrator state transitions to any number of
//! observers (dashboards, API layers). It is built on a Tokio broadcast
//! channel: every subscriber has a bounded buffer of `capacity` events, and a
//! subscriber that falls further behind loses the oldest events; the loss is
//! logged as a warning and the stream carries on with newer events.
//!
//! Events for one server are published while its state is being changed, so
//! each subscriber sees a server's events in the order its state machine
//! actually transitioned. No ordering is promised across servers.

use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio::sync::broadcast;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum EventKind {
    /// A process was spawned and is waiting for its first healthy probe
    ServerStarting { server: String, pid: u32 },
    /// First successful health probe; the server is running
    ServerStarted { server: String, pid: u32 },
    /// Planned stop completed
    ServerStopped {
        server: String,
        forced: bool,
        exit_code: Option<i32>,
    },
    /// Unexpected exit; a restart is scheduled
    ServerRestarting {
        server: String,
        attempt: u32,
        exit_code: Option<i32>,
    },
    /// Restart budget exhausted
    ServerFailed {
        server: String,
        restarts: u32,
        exit_code: Option<i32>,
    },
    /// Every server in the tier is healthy
    TierHealthy { tier: u32 },
    /// Tiered startup gave up at `tier`
    StartupAborted { tier: u32, reason: String },
}

impl EventKind {
    /// Wire name of the event, e.g. `server-restarting`.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::ServerStarting { .. } => "server-starting",
            EventKind::ServerStarted { .. } => "server-started",
            EventKind::ServerStopped { .. } => "server-stopped",
            EventKind::ServerRestarting { .. } => "server-restarting",
            EventKind::ServerFailed { .. } => "server-failed",
            EventKind::TierHealthy { .. } => "tier-healthy",
            EventKind::StartupAborted { .. } => "startup-aborted",
        }
    }

    /// Server the event concerns, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            EventKind::ServerStarting { server, .. }
            | EventKind::ServerStarted { server, .. }
            | EventKind::ServerStopped { server, .. }
            | EventKind::ServerRestarting { server, .. }
            | EventKind::ServerFailed { server, .. } => Some(server),
            EventKind::TierHealthy { .. } | EventKind::StartupAborted { .. } => None,
        }
    }
}

/// A published event with its wall-clock time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub timestamp: SystemTime,
}

impl OrchestratorEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            timestamp: SystemTime::now(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }

    pub fn server(&self) -> Option<&str> {
        self.kind.server()
    }

    /// JSON rendering for external consumers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize orchestrator event");
            serde_json::Value::Null
        })
    }
}

/// Fan-out of orchestrator events with a bounded replay history.
///
/// Cloning is cheap; all clones publish to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
    history: Arc<Mutex<VecDeque<OrchestratorEvent>>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; configuration validation rejects that.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Publish an event to all current subscribers and the history.
    pub fn publish(&self, kind: EventKind) {
        let event = OrchestratorEvent::new(kind);
        tracing::debug!(event = event.event_type(), server = ?event.server(), "Publishing event");

        match self.history.lock() {
            Ok(mut history) => {
                if history.len() == self.capacity {
                    history.pop_front();
                }
                history.push_back(event.clone());
            }
            Err(_) => tracing::error!("Failed to lock event history"),
        }

        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers, event not broadcast");
        }
    }

    /// Raw receiver for every event published from now on.
    pub fn subscribe_all(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    /// Stream of future events matching `predicate`.
    ///
    /// The stream ends only when every publisher has been dropped. If the
    /// subscriber lags, skipped events are reported with a warning and the
    /// stream resumes with the oldest event still buffered.
    pub fn subscribe<F>(&self, predicate: F) -> BoxStream<'static, OrchestratorEvent>
    where
        F: Fn(&OrchestratorEvent) -> bool + Send + Sync + 'static,
    {
        let mut rx = self.sender.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if predicate(&event) {
                            yield event;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event subscriber fell behind; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Most recent events, oldest first, at most `limit` of them.
    pub fn recent(&self, limit: Option<usize>) -> Vec<OrchestratorEvent> {
        let history = match self.history.lock() {
            Ok(history) => history,
            Err(_) => {
                tracing::error!("Failed to lock event history");
                return Vec::new();
            }
        };
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
