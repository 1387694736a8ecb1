//! Lifecycle orchestration for managed game servers.
//!
//! The [`LifecycleManager`] ties the resource ledger, port allocator,
//! process supervisor, and backup archiver together behind the operations
//! an external request layer calls: start, stop, send_command, status,
//! list_running, create_backup, restore_backup.

pub mod config;
pub mod launch;
pub mod manager;
pub mod record;
pub mod store;

pub use config::{ConfigFile, ConfigViolation, ManagerConfig};
pub use manager::LifecycleManager;
pub use record::{GameRules, ServerRecord};
pub use store::{InMemoryStatusStore, StatusStore};
