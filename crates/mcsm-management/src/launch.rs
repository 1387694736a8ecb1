//! Launch layout: the files and command line a server process starts with.
//!
//! Before spawn, the manager renders `server.properties` (game rules plus
//! the allocated port) and `eula.txt` into the server's data directory,
//! then builds the JVM command line from the declared memory allocation.

use crate::config::ManagerConfig;
use crate::record::ServerRecord;
use mcsm_common::Result;
use mcsm_supervisor::LaunchSpec;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Data directory for one server.
pub fn data_dir(config: &ManagerConfig, record: &ServerRecord) -> PathBuf {
    config.servers_root.join(record.id.as_str())
}

/// Render `server.properties` content. Values are passed through verbatim
/// from the record's game rules.
pub fn render_properties(record: &ServerRecord, port: u16) -> String {
    let rules = &record.rules;
    let mut lines = vec![
        format!("server-port={}", port),
        format!("gamemode={}", rules.gamemode),
        format!("difficulty={}", rules.difficulty),
        format!("hardcore={}", rules.hardcore),
        format!("pvp={}", rules.pvp),
        format!("spawn-monsters={}", rules.spawn_monsters),
        format!("motd={}", rules.motd),
    ];
    if let Some(ref seed) = rules.level_seed {
        lines.push(format!("level-seed={}", seed));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Write the launch files into the data directory.
pub fn write_launch_files(dir: &Path, record: &ServerRecord, port: u16) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    std::fs::write(dir.join("eula.txt"), "eula=true\n")?;
    std::fs::write(dir.join("server.properties"), render_properties(record, port))?;
    Ok(())
}

/// JVM command line for the server process.
pub fn build_launch_spec(
    config: &ManagerConfig,
    record: &ServerRecord,
    port: u16,
    dir: &Path,
) -> LaunchSpec {
    let memory_arg = format!("{}M", record.memory_mb);
    LaunchSpec {
        program: config.java_binary.clone(),
        args: vec![
            format!("-Xms{}", memory_arg),
            format!("-Xmx{}", memory_arg),
            "-jar".to_string(),
            "server.jar".to_string(),
            "--nogui".to_string(),
            "--port".to_string(),
            port.to_string(),
        ],
        working_dir: Some(dir.to_path_buf()),
        env: HashMap::new(),
    }
}
