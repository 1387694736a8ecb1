//! Server records: the declared configuration of one manageable server.

use mcsm_common::ServerId;
use mcsm_state::ServerStatus;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_gamemode() -> String {
    "survival".to_string()
}

fn default_difficulty() -> String {
    "normal".to_string()
}

fn default_motd() -> String {
    "A Minecraft Server".to_string()
}

fn default_status() -> ServerStatus {
    ServerStatus::Stopped
}

/// Game rule fields. The manager passes these through to the launched
/// server verbatim; none of them are interpreted by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRules {
    #[serde(default = "default_gamemode")]
    pub gamemode: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: String,
    #[serde(default)]
    pub hardcore: bool,
    #[serde(default = "default_true")]
    pub pvp: bool,
    #[serde(default = "default_true")]
    pub spawn_monsters: bool,
    #[serde(default = "default_motd")]
    pub motd: String,
    #[serde(default)]
    pub level_seed: Option<String>,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            gamemode: default_gamemode(),
            difficulty: default_difficulty(),
            hardcore: false,
            pvp: true,
            spawn_monsters: true,
            motd: default_motd(),
            level_seed: None,
        }
    }
}

/// Identity and declared configuration of one manageable game server.
///
/// Records are owned by the external persistence layer; the manager
/// receives them at registration and mutates `status` and `port` as the
/// lifecycle progresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    /// Unique across the system.
    pub name: String,
    /// Game version string, passed through to the launch layout.
    pub version: String,
    /// Declared memory allocation in MB.
    pub memory_mb: u64,
    /// Preferred port; allocated on start, cleared on stop.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_status")]
    pub status: ServerStatus,
    /// Opaque reference to the owning user.
    pub owner: String,
    /// Auto-start this server when the daemon boots.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: GameRules,
}
