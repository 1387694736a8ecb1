//! Core domain identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one manageable game server.
///
/// The id originates from the persistence layer that owns the server
/// records; inside the manager it is treated as an opaque key.
///
/// # Example
/// ```
/// use mcsm_common::ServerId;
///
/// let id = ServerId::from("survival-1");
/// assert_eq!(id.as_str(), "survival-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    /// Creates a new ServerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
