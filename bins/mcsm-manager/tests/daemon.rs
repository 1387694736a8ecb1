//! End-to-end checks of the daemon binary: argument handling, config
//! validation at startup, and the register/auto-start/shutdown flow.

use std::path::Path;
use std::process::{Command, Output};

fn run_daemon(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mcsm-manager"))
        .args(args)
        .output()
        .expect("failed to run mcsm-manager binary")
}

fn write_file(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
}

#[test]
fn test_empty_manifest_starts_and_shuts_down() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("servers.yaml");
    write_file(&manifest, "[]\n");

    let output = run_daemon(&[
        "--manifest",
        manifest.to_str().unwrap(),
        "--run-duration",
        "0",
    ]);

    assert!(output.status.success(), "daemon exited with failure");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Loaded manifest with 0 server(s)"));
    assert!(stdout.contains("Server manager shut down"));
}

#[test]
fn test_invalid_config_refuses_to_start() {
    let tmp = tempfile::tempdir().unwrap();
    let manifest = tmp.path().join("servers.yaml");
    write_file(&manifest, "[]\n");

    let config = tmp.path().join("config.yaml");
    write_file(
        &config,
        "min_server_memory_mb: 4096\nmax_server_memory_mb: 512\n",
    );

    let output = run_daemon(&[
        "--config",
        config.to_str().unwrap(),
        "--manifest",
        manifest.to_str().unwrap(),
        "--run-duration",
        "0",
    ]);

    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration violation"));
}

#[test]
fn test_failed_auto_start_does_not_kill_the_daemon() {
    let tmp = tempfile::tempdir().unwrap();

    // A java binary that exits immediately makes every spawn fail inside
    // the startup grace window.
    let config = tmp.path().join("config.yaml");
    write_file(
        &config,
        &format!(
            "java_binary: /bin/false\nservers_root: {root}/servers\nbackup_dir: {root}/backups\nstartup_grace_ms: 200\n",
            root = tmp.path().display()
        ),
    );

    let manifest = tmp.path().join("servers.yaml");
    write_file(
        &manifest,
        r#"
- id: survival-1
  name: Survival One
  version: "1.21.1"
  memory_mb: 1024
  owner: user-1
  enabled: true
"#,
    );

    let output = run_daemon(&[
        "--config",
        config.to_str().unwrap(),
        "--manifest",
        manifest.to_str().unwrap(),
        "--run-duration",
        "0",
    ]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Auto-start of survival-1 failed"));
    assert!(stdout.contains("Server manager shut down"));
}
