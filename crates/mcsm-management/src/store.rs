//! Status persistence port.
//!
//! The manager's in-memory state is authoritative; the store is a mirror
//! the external persistence layer keeps for display and for recovering
//! records after a manager restart. The port is injected into the
//! [`crate::LifecycleManager`] constructor — no ambient global session.

use mcsm_common::{Result, ServerId};
use mcsm_state::ServerStatus;
use std::collections::HashMap;
use std::sync::RwLock;

/// Receives every status transition the manager performs.
pub trait StatusStore: Send + Sync {
    fn record_status(&self, server_id: &ServerId, status: ServerStatus) -> Result<()>;
}

/// In-memory store, used by tests and by deployments that keep server
/// records elsewhere entirely.
#[derive(Default)]
pub struct InMemoryStatusStore {
    statuses: RwLock<HashMap<ServerId, ServerStatus>>,
    history: RwLock<Vec<(ServerId, ServerStatus)>>,
}

impl InMemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status_of(&self, server_id: &ServerId) -> Option<ServerStatus> {
        self.statuses.read().unwrap().get(server_id).copied()
    }

    /// Every recorded transition in order, for assertions.
    pub fn history(&self) -> Vec<(ServerId, ServerStatus)> {
        self.history.read().unwrap().clone()
    }
}

impl StatusStore for InMemoryStatusStore {
    fn record_status(&self, server_id: &ServerId, status: ServerStatus) -> Result<()> {
        self.statuses
            .write()
            .unwrap()
            .insert(server_id.clone(), status);
        self.history
            .write()
            .unwrap()
            .push((server_id.clone(), status));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_mirrors_latest_status() {
        let store = InMemoryStatusStore::new();
        let id = ServerId::from("alpha");

        store.record_status(&id, ServerStatus::Starting).unwrap();
        store.record_status(&id, ServerStatus::Running).unwrap();

        assert_eq!(store.status_of(&id), Some(ServerStatus::Running));
        assert_eq!(store.history().len(), 2);
    }
}
