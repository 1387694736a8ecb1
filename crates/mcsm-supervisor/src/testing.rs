//! In-memory launcher/prober pair for tests.
//!
//! The pair shares one [`FakeProcessTable`] standing in for the OS process
//! table, so a "process" started through the fake launcher is visible to
//! the fake prober, reacts to console commands and signals according to
//! its scripted [`FakeBehavior`], and can be crashed or PID-recycled from
//! test code.

use crate::launcher::{ExitOutcome, LaunchSpec, ProcessLauncher, SpawnedChild};
use crate::prober::LivenessProber;
use async_trait::async_trait;
use chrono::Utc;
use mcsm_common::{Result, ServerId};
use mcsm_resources::{ProcessIdentity, ResourceSample};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// How a fake process reacts to the world.
#[derive(Clone, Copy)]
pub struct FakeBehavior {
    /// Exit with this code as soon as the process starts.
    pub exit_immediately: Option<i32>,
    /// React to the graceful console command.
    pub obey_graceful: bool,
    /// React to the forced termination signal.
    pub obey_terminate: bool,
    /// React to the unconditional kill.
    pub obey_kill: bool,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            exit_immediately: None,
            obey_graceful: true,
            obey_terminate: true,
            obey_kill: true,
        }
    }
}

/// Shared fake process table.
#[derive(Default)]
pub struct FakeProcessTable {
    children: Mutex<HashMap<u32, Arc<watch::Sender<Option<ExitOutcome>>>>>,
    recycled: Mutex<Vec<u32>>,
    sent_lines: Mutex<Vec<(u32, String)>>,
}

impl FakeProcessTable {
    fn exit_sender(&self, pid: u32) -> Option<Arc<watch::Sender<Option<ExitOutcome>>>> {
        let children = self.children.lock().unwrap();
        children.get(&pid).cloned()
    }

    /// End the fake process with the given exit code.
    pub fn force_exit(&self, pid: u32, code: Option<i32>) {
        if let Some(tx) = self.exit_sender(pid) {
            let _ = tx.send(Some(ExitOutcome { code }));
        }
    }

    /// Simulate the OS handing the PID to an unrelated process.
    pub fn recycle_pid(&self, pid: u32) {
        self.recycled.lock().unwrap().push(pid);
    }

    /// Console lines delivered to any fake process, in order.
    pub fn sent_lines(&self) -> Vec<(u32, String)> {
        self.sent_lines.lock().unwrap().clone()
    }

    fn record_line(&self, pid: u32, line: String) {
        self.sent_lines.lock().unwrap().push((pid, line));
    }

    fn is_running(&self, pid: u32) -> bool {
        if self.recycled.lock().unwrap().contains(&pid) {
            return false;
        }
        match self.exit_sender(pid) {
            Some(tx) => tx.borrow().is_none(),
            None => false,
        }
    }
}

/// Launcher whose children live only in the fake table.
pub struct FakeLauncher {
    pub table: Arc<FakeProcessTable>,
    pub behavior: FakeBehavior,
    next_pid: AtomicU32,
}

impl FakeLauncher {
    pub fn new(table: Arc<FakeProcessTable>, behavior: FakeBehavior) -> Self {
        Self {
            table,
            behavior,
            next_pid: AtomicU32::new(4000),
        }
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn launch(&self, _server_id: &ServerId, _spec: &LaunchSpec) -> Result<SpawnedChild> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        self.table
            .children
            .lock()
            .unwrap()
            .insert(pid, Arc::clone(&exit_tx));

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(16);
        let obey_graceful = self.behavior.obey_graceful;
        let console_exit = Arc::clone(&exit_tx);
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                table.record_line(pid, line.trim().to_string());
                if line.trim() == "stop" && obey_graceful {
                    let _ = console_exit.send(Some(ExitOutcome { code: Some(0) }));
                }
            }
        });

        if let Some(code) = self.behavior.exit_immediately {
            let _ = exit_tx.send(Some(ExitOutcome { code: Some(code) }));
        }

        Ok(SpawnedChild::new(pid, stdin_tx, exit_rx))
    }

    fn terminate(&self, pid: u32) -> Result<()> {
        if self.behavior.obey_terminate {
            self.table.force_exit(pid, None);
        }
        Ok(())
    }

    fn kill(&self, pid: u32) -> Result<()> {
        if self.behavior.obey_kill {
            self.table.force_exit(pid, None);
        }
        Ok(())
    }
}

/// Prober answering from the fake table.
pub struct FakeProber {
    pub table: Arc<FakeProcessTable>,
}

#[async_trait]
impl LivenessProber for FakeProber {
    async fn identity_of(&self, pid: u32) -> Option<ProcessIdentity> {
        if self.table.is_running(pid) {
            Some(ProcessIdentity {
                pid,
                start_time_secs: 1_000,
            })
        } else {
            None
        }
    }

    async fn is_alive(&self, identity: &ProcessIdentity) -> bool {
        self.table.is_running(identity.pid)
    }

    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        if self.table.is_running(pid) {
            Some(ResourceSample {
                cpu_percent: Some(12.5),
                memory_mb: Some(640),
                sampled_at: Utc::now(),
            })
        } else {
            None
        }
    }
}
