use chrono::{DateTime, Utc};
use mcsm_common::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a managed game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// No process exists; the server can be started.
    Stopped,
    /// Resources reserved, process launch in flight.
    Starting,
    /// Process confirmed alive and serving.
    Running,
    /// Shutdown escalation in progress.
    Stopping,
    /// Shutdown escalation failed; waiting for operator acknowledgment.
    Error,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerStatus::Stopped => write!(f, "stopped"),
            ServerStatus::Starting => write!(f, "starting"),
            ServerStatus::Running => write!(f, "running"),
            ServerStatus::Stopping => write!(f, "stopping"),
            ServerStatus::Error => write!(f, "error"),
        }
    }
}

impl ServerStatus {
    /// A server in an active status holds (or is about to hold) a process
    /// handle plus a memory reservation and a port lease.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ServerStatus::Starting | ServerStatus::Running | ServerStatus::Stopping
        )
    }

    /// Statuses reconciliation inspects for dead processes.
    pub fn claims_process(&self) -> bool {
        matches!(self, ServerStatus::Starting | ServerStatus::Running)
    }
}

/// One recorded status transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: ServerStatus,
    pub to: ServerStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Per-server status machine enforcing the valid transition table.
///
/// The machine is deliberately strict: any edge not listed in
/// `is_valid_transition` is rejected with a `Conflict` error so a caller
/// bug shows up at the transition site instead of as a stuck record.
#[derive(Debug, Clone)]
pub struct StatusMachine {
    server_id: String,
    current: ServerStatus,
    history: Vec<StatusTransition>,
    last_transition_time: DateTime<Utc>,
}

const HISTORY_LIMIT: usize = 64;

impl StatusMachine {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            current: ServerStatus::Stopped,
            history: Vec::new(),
            last_transition_time: Utc::now(),
        }
    }

    /// Rebuild a machine from a persisted status, e.g. after manager restart.
    pub fn from_status(server_id: &str, status: ServerStatus) -> Self {
        Self {
            server_id: server_id.to_string(),
            current: status,
            history: Vec::new(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn current(&self) -> ServerStatus {
        self.current
    }

    pub fn history(&self) -> &[StatusTransition] {
        &self.history
    }

    pub fn last_transition_time(&self) -> DateTime<Utc> {
        self.last_transition_time
    }

    /// Check whether moving to `target` is allowed from the current status.
    pub fn is_valid_transition(&self, target: ServerStatus) -> bool {
        use ServerStatus::*;
        match (self.current, target) {
            (Stopped, Starting) => true,

            (Starting, Running) => true,
            // Spawn failure rolls straight back to Stopped.
            (Starting, Stopped) => true,

            (Running, Stopping) => true,
            // Crash detected by a liveness probe; no Stopping phase.
            (Running, Stopped) => true,

            (Stopping, Stopped) => true,
            (Stopping, Error) => true,

            // Operator acknowledgment clears the error.
            (Error, Stopped) => true,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    /// Transition to `target`, recording the edge and an optional reason.
    pub fn transition_to(&mut self, target: ServerStatus, reason: Option<String>) -> Result<()> {
        if !self.is_valid_transition(target) {
            return Err(ManagerError::conflict(
                self.server_id.as_str(),
                format!("transition to {}", target),
                self.current.to_string(),
            ));
        }

        let now = Utc::now();
        self.history.push(StatusTransition {
            from: self.current,
            to: target,
            timestamp: now,
            reason,
        });
        if self.history.len() > HISTORY_LIMIT {
            self.history.remove(0);
        }

        tracing::debug!(
            "Server {} status {} -> {}",
            self.server_id,
            self.current,
            target
        );

        self.current = target;
        self.last_transition_time = now;
        Ok(())
    }

    pub fn can_start(&self) -> bool {
        self.current == ServerStatus::Stopped
    }

    pub fn can_stop(&self) -> bool {
        self.current == ServerStatus::Running
    }

    pub fn time_in_current_status(&self) -> chrono::Duration {
        Utc::now() - self.last_transition_time
    }
}
