//! Process launching behind the [`ProcessLauncher`] capability.
//!
//! The real implementation spawns through tokio and wires three background
//! tasks per child: a stdin writer feeding console commands, stdout/stderr
//! drains, and an exit monitor that reaps the child so no zombie is left
//! behind. Fakes construct a [`SpawnedChild`] directly from channels they
//! control.

use async_trait::async_trait;
use mcsm_common::{ManagerError, Result, ServerId};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Everything needed to launch one server process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

/// How a child process ended. `code` is `None` when the process was
/// killed by a signal before it could exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to a launched child: its PID, a console input channel, and an
/// exit watcher fed by the exit monitor task.
#[derive(Clone)]
pub struct SpawnedChild {
    pid: u32,
    stdin_tx: mpsc::Sender<String>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl SpawnedChild {
    pub fn new(
        pid: u32,
        stdin_tx: mpsc::Sender<String>,
        exit_rx: watch::Receiver<Option<ExitOutcome>>,
    ) -> Self {
        Self {
            pid,
            stdin_tx,
            exit_rx,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue one line for the child's stdin. A missing trailing newline is
    /// added; the console protocol is line-oriented.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let line = if line.ends_with('\n') {
            line.to_string()
        } else {
            format!("{}\n", line)
        };
        self.stdin_tx
            .send(line)
            .await
            .map_err(|_| ManagerError::internal("console input channel closed"))
    }

    /// The recorded exit, if the child has already terminated.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        *self.exit_rx.borrow()
    }

    pub fn exit_watcher(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_rx.clone()
    }
}

/// Capability for creating and signalling OS processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process described by `spec`.
    async fn launch(&self, server_id: &ServerId, spec: &LaunchSpec) -> Result<SpawnedChild>;

    /// Polite termination signal (the forced level of the stop escalation).
    fn terminate(&self, pid: u32) -> Result<()>;

    /// Unconditional kill (the last level of the stop escalation).
    fn kill(&self, pid: u32) -> Result<()>;
}

/// Real launcher backed by `tokio::process`.
pub struct TokioProcessLauncher;

#[async_trait]
impl ProcessLauncher for TokioProcessLauncher {
    async fn launch(&self, server_id: &ServerId, spec: &LaunchSpec) -> Result<SpawnedChild> {
        info!("Spawning process for server {}: {}", server_id, spec.program);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);

        if let Some(ref dir) = spec.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            ManagerError::spawn_failed(server_id.clone(), format!("failed to spawn: {}", e))
        })?;

        let pid = child.id().ok_or_else(|| {
            ManagerError::spawn_failed(server_id.clone(), "child exited before a PID was read")
        })?;

        // Console input writer task.
        let mut stdin = child.stdin.take().ok_or_else(|| {
            ManagerError::spawn_failed(server_id.clone(), "stdin pipe unavailable")
        })?;
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(64);
        let writer_id = server_id.clone();
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!("Console write to {} failed: {}", writer_id, e);
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!("Console flush to {} failed: {}", writer_id, e);
                    break;
                }
            }
            debug!("Console writer for {} exited", writer_id);
        });

        // Output drains. Server chatter is debug-level; stderr may carry
        // crash information and is kept at warn.
        if let Some(stdout) = child.stdout.take() {
            let drain_id = server_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{}] {}", drain_id, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let drain_id = server_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[{}] {}", drain_id, line);
                }
            });
        }

        // Exit monitor: owns the child, waits for it (reaping it on Unix),
        // and publishes the outcome.
        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor_id = server_id.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    if status.success() {
                        info!("Process for {} (PID {}) exited cleanly", monitor_id, pid);
                    } else {
                        warn!(
                            "Process for {} (PID {}) exited with status {:?}",
                            monitor_id,
                            pid,
                            status.code()
                        );
                    }
                    let _ = exit_tx.send(Some(ExitOutcome {
                        code: status.code(),
                    }));
                }
                Err(e) => {
                    error!("Failed to wait for {} (PID {}): {}", monitor_id, pid, e);
                    let _ = exit_tx.send(Some(ExitOutcome { code: None }));
                }
            }
        });

        info!("Process for {} spawned (PID {})", server_id, pid);
        Ok(SpawnedChild::new(pid, stdin_tx, exit_rx))
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        mcsm_process::terminate_gracefully(pid)
    }

    fn kill(&self, pid: u32) -> Result<()> {
        mcsm_process::force_kill(pid)
    }
}
