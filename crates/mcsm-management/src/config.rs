//! Manager configuration.
//!
//! One immutable struct, resolved once at startup. Each field follows the
//! same precedence: explicit value from the config file, then the
//! `MCSM_*` environment variable, then the documented default. Validation
//! is a pure function over the resolved struct returning every violation
//! found, so an operator sees the full list in one pass instead of fixing
//! errors one restart at a time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Optional overrides read from the YAML config file. Absent fields fall
/// through to the environment and then to defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub max_total_memory_mb: Option<u64>,
    pub min_server_memory_mb: Option<u64>,
    pub max_server_memory_mb: Option<u64>,
    pub default_server_memory_mb: Option<u64>,
    pub port_range_start: Option<u16>,
    pub port_range_end: Option<u16>,
    pub graceful_stop_timeout_secs: Option<u64>,
    pub forced_stop_timeout_secs: Option<u64>,
    pub kill_timeout_secs: Option<u64>,
    pub startup_grace_ms: Option<u64>,
    pub java_binary: Option<String>,
    pub servers_root: Option<PathBuf>,
    pub backup_dir: Option<PathBuf>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
        let config: ConfigFile = serde_yaml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e))?;
        Ok(config)
    }
}

/// Fully resolved, immutable manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Ceiling on the summed declared memory of all admitted servers.
    pub max_total_memory_mb: u64,
    pub min_server_memory_mb: u64,
    pub max_server_memory_mb: u64,
    /// Used when a record declares no memory allocation.
    pub default_server_memory_mb: u64,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Wait after the graceful console command before escalating.
    pub graceful_stop_timeout: Duration,
    /// Wait after the forced termination signal.
    pub forced_stop_timeout: Duration,
    /// Wait after the unconditional kill.
    pub kill_timeout: Duration,
    /// Window in which an early child exit fails the spawn.
    pub startup_grace: Duration,
    pub java_binary: String,
    /// Server data directories live under `<servers_root>/<id>`.
    pub servers_root: PathBuf,
    pub backup_dir: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_total_memory_mb: 8192,
            min_server_memory_mb: 512,
            max_server_memory_mb: 4096,
            default_server_memory_mb: 1024,
            port_range_start: 25565,
            port_range_end: 26565,
            graceful_stop_timeout: Duration::from_secs(30),
            forced_stop_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            startup_grace: Duration::from_millis(1500),
            java_binary: "java".to_string(),
            servers_root: PathBuf::from("servers"),
            backup_dir: PathBuf::from("backups"),
        }
    }
}

/// One configuration problem found during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn env_value<T: FromStr>(env: &HashMap<String, String>, key: &str) -> Option<T> {
    let raw = env.get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparseable environment override {}={}", key, raw);
            None
        }
    }
}

impl ManagerConfig {
    /// Resolve the configuration from an optional config file and the
    /// process environment.
    pub fn resolve(file: Option<&ConfigFile>) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::resolve_with_env(file, &env)
    }

    /// Resolution against an explicit environment map (testable without
    /// mutating the process environment).
    pub fn resolve_with_env(file: Option<&ConfigFile>, env: &HashMap<String, String>) -> Self {
        let defaults = Self::default();
        let file = file.cloned().unwrap_or_default();

        let secs = Duration::from_secs;

        Self {
            max_total_memory_mb: file
                .max_total_memory_mb
                .or_else(|| env_value(env, "MCSM_MAX_TOTAL_MEMORY_MB"))
                .unwrap_or(defaults.max_total_memory_mb),
            min_server_memory_mb: file
                .min_server_memory_mb
                .or_else(|| env_value(env, "MCSM_MIN_SERVER_MEMORY_MB"))
                .unwrap_or(defaults.min_server_memory_mb),
            max_server_memory_mb: file
                .max_server_memory_mb
                .or_else(|| env_value(env, "MCSM_MAX_SERVER_MEMORY_MB"))
                .unwrap_or(defaults.max_server_memory_mb),
            default_server_memory_mb: file
                .default_server_memory_mb
                .or_else(|| env_value(env, "MCSM_DEFAULT_SERVER_MEMORY_MB"))
                .unwrap_or(defaults.default_server_memory_mb),
            port_range_start: file
                .port_range_start
                .or_else(|| env_value(env, "MCSM_PORT_RANGE_START"))
                .unwrap_or(defaults.port_range_start),
            port_range_end: file
                .port_range_end
                .or_else(|| env_value(env, "MCSM_PORT_RANGE_END"))
                .unwrap_or(defaults.port_range_end),
            graceful_stop_timeout: file
                .graceful_stop_timeout_secs
                .or_else(|| env_value(env, "MCSM_GRACEFUL_STOP_TIMEOUT_SECS"))
                .map(secs)
                .unwrap_or(defaults.graceful_stop_timeout),
            forced_stop_timeout: file
                .forced_stop_timeout_secs
                .or_else(|| env_value(env, "MCSM_FORCED_STOP_TIMEOUT_SECS"))
                .map(secs)
                .unwrap_or(defaults.forced_stop_timeout),
            kill_timeout: file
                .kill_timeout_secs
                .or_else(|| env_value(env, "MCSM_KILL_TIMEOUT_SECS"))
                .map(secs)
                .unwrap_or(defaults.kill_timeout),
            startup_grace: file
                .startup_grace_ms
                .or_else(|| env_value(env, "MCSM_STARTUP_GRACE_MS"))
                .map(Duration::from_millis)
                .unwrap_or(defaults.startup_grace),
            java_binary: file
                .java_binary
                .or_else(|| env.get("MCSM_JAVA_BINARY").cloned())
                .unwrap_or(defaults.java_binary),
            servers_root: file
                .servers_root
                .or_else(|| env.get("MCSM_SERVERS_ROOT").map(PathBuf::from))
                .unwrap_or(defaults.servers_root),
            backup_dir: file
                .backup_dir
                .or_else(|| env.get("MCSM_BACKUP_DIR").map(PathBuf::from))
                .unwrap_or(defaults.backup_dir),
        }
    }

    /// Pure validation: every violation in the resolved configuration.
    pub fn validate(&self) -> Vec<ConfigViolation> {
        let mut violations = Vec::new();
        let mut violation = |field: &'static str, message: String| {
            violations.push(ConfigViolation { field, message });
        };

        if self.min_server_memory_mb == 0 {
            violation(
                "min_server_memory_mb",
                "must be greater than 0".to_string(),
            );
        }
        if self.min_server_memory_mb > self.max_server_memory_mb {
            violation(
                "min_server_memory_mb",
                format!(
                    "must not exceed max_server_memory_mb ({} > {})",
                    self.min_server_memory_mb, self.max_server_memory_mb
                ),
            );
        }
        if self.default_server_memory_mb < self.min_server_memory_mb
            || self.default_server_memory_mb > self.max_server_memory_mb
        {
            violation(
                "default_server_memory_mb",
                format!(
                    "must lie within {}..={}",
                    self.min_server_memory_mb, self.max_server_memory_mb
                ),
            );
        }
        if self.max_server_memory_mb > self.max_total_memory_mb {
            violation(
                "max_server_memory_mb",
                format!(
                    "a single server could exceed the cluster ceiling ({} > {})",
                    self.max_server_memory_mb, self.max_total_memory_mb
                ),
            );
        }
        if self.port_range_start > self.port_range_end {
            violation(
                "port_range_start",
                format!(
                    "range is empty ({} > {})",
                    self.port_range_start, self.port_range_end
                ),
            );
        }
        if self.port_range_start == 0 {
            violation("port_range_start", "port 0 is not allocatable".to_string());
        }
        if self.graceful_stop_timeout.is_zero() {
            violation(
                "graceful_stop_timeout_secs",
                "must be greater than 0".to_string(),
            );
        }
        if self.kill_timeout.is_zero() {
            violation("kill_timeout_secs", "must be greater than 0".to_string());
        }
        if self.java_binary.is_empty() {
            violation("java_binary", "must not be empty".to_string());
        }

        violations
    }

    pub fn port_range(&self) -> std::ops::RangeInclusive<u16> {
        self.port_range_start..=self.port_range_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_empty());
        assert_eq!(config.port_range_start, 25565);
        assert_eq!(config.port_range_end, 26565);
    }

    #[test]
    fn test_precedence_explicit_over_env_over_default() {
        let file = ConfigFile {
            max_total_memory_mb: Some(2048),
            ..ConfigFile::default()
        };
        let env = HashMap::from([
            ("MCSM_MAX_TOTAL_MEMORY_MB".to_string(), "4096".to_string()),
            ("MCSM_MIN_SERVER_MEMORY_MB".to_string(), "256".to_string()),
        ]);

        let config = ManagerConfig::resolve_with_env(Some(&file), &env);

        // Explicit beats env.
        assert_eq!(config.max_total_memory_mb, 2048);
        // Env beats default.
        assert_eq!(config.min_server_memory_mb, 256);
        // Default when neither is set.
        assert_eq!(config.max_server_memory_mb, 4096);
    }

    #[test]
    fn test_unparseable_env_falls_back() {
        let env = HashMap::from([(
            "MCSM_MAX_TOTAL_MEMORY_MB".to_string(),
            "plenty".to_string(),
        )]);
        let config = ManagerConfig::resolve_with_env(None, &env);
        assert_eq!(config.max_total_memory_mb, 8192);
    }

    #[test]
    fn test_validation_collects_every_violation() {
        let config = ManagerConfig {
            min_server_memory_mb: 4096,
            max_server_memory_mb: 512,
            default_server_memory_mb: 64,
            port_range_start: 26000,
            port_range_end: 25000,
            graceful_stop_timeout: Duration::ZERO,
            ..ManagerConfig::default()
        };

        let violations = config.validate();
        let fields: Vec<_> = violations.iter().map(|v| v.field).collect();
        assert!(fields.contains(&"min_server_memory_mb"));
        assert!(fields.contains(&"default_server_memory_mb"));
        assert!(fields.contains(&"port_range_start"));
        assert!(fields.contains(&"graceful_stop_timeout_secs"));
        assert!(violations.len() >= 4);
    }

    #[test]
    fn test_duration_fields_resolve_from_env() {
        let env = HashMap::from([
            ("MCSM_GRACEFUL_STOP_TIMEOUT_SECS".to_string(), "7".to_string()),
            ("MCSM_STARTUP_GRACE_MS".to_string(), "250".to_string()),
        ]);
        let config = ManagerConfig::resolve_with_env(None, &env);
        assert_eq!(config.graceful_stop_timeout, Duration::from_secs(7));
        assert_eq!(config.startup_grace, Duration::from_millis(250));
    }
}
