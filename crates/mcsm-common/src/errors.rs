//! Error types for server lifecycle management.
//!
//! One error enum covers the whole workspace. Variants carry enough context
//! to answer the caller's first question (which server, how much memory,
//! which port range) without a round trip to the logs.

use crate::types::ServerId;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Main error type for server lifecycle operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// No server record is registered under this id.
    #[error("Server not found: {id}")]
    NotFound { id: ServerId },

    /// A live process handle already exists for this server.
    #[error("Server already running: {id}")]
    AlreadyRunning { id: ServerId },

    /// The operation requires a live process and there is none.
    #[error("Server not running: {id}")]
    NotRunning { id: ServerId },

    /// The requested transition is not valid from the server's current status.
    #[error("Invalid operation '{operation}' for server {id} in status {status}")]
    Conflict {
        id: ServerId,
        operation: String,
        status: String,
    },

    /// Admitting the request would push committed memory past the ceiling.
    #[error(
        "Insufficient memory: requested {requested_mb} MB with {committed_mb} MB committed (ceiling {ceiling_mb} MB)"
    )]
    InsufficientMemory {
        requested_mb: u64,
        committed_mb: u64,
        ceiling_mb: u64,
    },

    /// The per-server memory request is outside the configured bounds.
    #[error("Memory request out of range: {requested_mb} MB (allowed {min_mb}..={max_mb} MB)")]
    MemoryOutOfRange {
        requested_mb: u64,
        min_mb: u64,
        max_mb: u64,
    },

    /// Every port in the configured range is leased or externally occupied.
    #[error("No port available in range {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },

    /// The child process could not be started, or died inside the startup
    /// grace window.
    #[error("Spawn failed for server {id}: {reason}")]
    SpawnFailed { id: ServerId, reason: String },

    /// The process survived the full graceful/forced/kill escalation.
    #[error("Stop failed for server {id}: {reason}")]
    StopFailed { id: ServerId, reason: String },

    /// The filesystem ran out of space mid-write.
    #[error("Disk full while writing {path}")]
    DiskFull { path: PathBuf },

    /// Archive extraction hit a malformed or unsafe entry.
    #[error("Corrupt archive: {reason}")]
    CorruptArchive { reason: String },

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration detected at startup.
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Internal invariant violation; not expected in normal operation.
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Coarse classification used when deciding how an error is surfaced.
///
/// Resource and conflict errors go straight back to the requesting user;
/// environment errors are operator-facing and may park the record in the
/// `Error` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Memory or port temporarily unavailable; the user can retry later.
    ResourceExhausted,
    /// Invalid state transition; retrying without a state change won't help.
    Conflict,
    /// Spawn/stop problem in the process environment.
    Environment,
    /// Backup subsystem failure.
    Backup,
    /// Everything else.
    Internal,
}

impl ManagerError {
    pub fn not_found(id: impl Into<ServerId>) -> Self {
        Self::NotFound { id: id.into() }
    }

    pub fn already_running(id: impl Into<ServerId>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    pub fn not_running(id: impl Into<ServerId>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    pub fn conflict(
        id: impl Into<ServerId>,
        operation: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            id: id.into(),
            operation: operation.into(),
            status: status.into(),
        }
    }

    pub fn spawn_failed(id: impl Into<ServerId>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn stop_failed(id: impl Into<ServerId>, reason: impl Into<String>) -> Self {
        Self::StopFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn corrupt_archive(reason: impl Into<String>) -> Self {
        Self::CorruptArchive {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Classify the error for propagation decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InsufficientMemory { .. }
            | Self::MemoryOutOfRange { .. }
            | Self::NoPortAvailable { .. } => ErrorCategory::ResourceExhausted,
            Self::Conflict { .. } | Self::AlreadyRunning { .. } | Self::NotRunning { .. } => {
                ErrorCategory::Conflict
            }
            Self::SpawnFailed { .. } | Self::StopFailed { .. } => ErrorCategory::Environment,
            Self::DiskFull { .. } | Self::CorruptArchive { .. } => ErrorCategory::Backup,
            _ => ErrorCategory::Internal,
        }
    }
}
