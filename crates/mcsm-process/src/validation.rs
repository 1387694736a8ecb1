//! Input validation helpers.

use mcsm_common::{ManagerError, Result};

/// Validate a server id before it is used as a map key, a file name stem,
/// or part of a backup archive name.
pub fn validate_server_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(ManagerError::configuration("Server id cannot be empty"));
    }

    if id.len() > 64 {
        return Err(ManagerError::configuration(format!(
            "Server id too long (max 64 characters): {}",
            id
        )));
    }

    if !id.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(ManagerError::configuration(format!(
            "Server id can only contain alphanumeric characters, hyphens, and underscores: {}",
            id
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        assert!(validate_server_id("survival-1").is_ok());
        assert!(validate_server_id("creative_world_2").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        assert!(validate_server_id("").is_err());
        assert!(validate_server_id("bad/../path").is_err());
        assert!(validate_server_id(&"x".repeat(65)).is_err());
    }
}
