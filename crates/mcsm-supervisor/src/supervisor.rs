//! The process supervisor: server id -> live process handle.

use crate::launcher::{ExitOutcome, LaunchSpec, ProcessLauncher, SpawnedChild};
use crate::prober::LivenessProber;
use chrono::{DateTime, Utc};
use mcsm_common::{ManagerError, Result, ServerId};
use mcsm_resources::{ProcessIdentity, ResourceSample};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bounded waits used by spawn and the stop escalation. Every wait has an
/// explicit upper bound; no supervisor operation blocks indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorTimings {
    /// How long a fresh child is watched for an early exit before the
    /// spawn counts as successful.
    pub startup_grace: Duration,
    /// Wait after the forced termination signal.
    pub term_wait: Duration,
    /// Wait after the unconditional kill.
    pub kill_wait: Duration,
    /// Poll interval while waiting for an exit.
    pub poll_interval: Duration,
}

impl Default for SupervisorTimings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(1),
            term_wait: Duration::from_secs(10),
            kill_wait: Duration::from_secs(3),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// Which escalation level ended up stopping the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopLevel {
    Graceful,
    Forced,
    Killed,
}

/// Caller-facing snapshot of a supervised process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub identity: ProcessIdentity,
    pub last_sample: Option<ResourceSample>,
}

struct Supervised {
    child: SpawnedChild,
    identity: ProcessIdentity,
    started_at: DateTime<Utc>,
    last_sample: Option<ResourceSample>,
}

/// Owns every live child process, keyed by server id.
///
/// The handle map lock covers insert/remove/lookup only. Nothing holds it
/// across an await: the stop escalation and the liveness waits all operate
/// on cloned channel handles.
pub struct ProcessSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    prober: Arc<dyn LivenessProber>,
    timings: SupervisorTimings,
    /// Console command that asks the server to shut down on its own.
    graceful_command: String,
    handles: Mutex<HashMap<ServerId, Supervised>>,
}

impl ProcessSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn LivenessProber>,
        timings: SupervisorTimings,
    ) -> Self {
        Self {
            launcher,
            prober,
            timings,
            graceful_command: "stop".to_string(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Launch a process for `server_id`.
    ///
    /// Fails with `AlreadyRunning` when a live handle exists — an existing
    /// process is never silently replaced. A child that exits inside the
    /// startup grace window (any status) fails the spawn and registers
    /// nothing.
    pub async fn spawn(&self, server_id: &ServerId, spec: &LaunchSpec) -> Result<()> {
        // Stale handles self-heal here instead of blocking the restart.
        if let Some((identity, exit)) = self.snapshot_identity(server_id) {
            let alive = exit.is_none() && self.prober.is_alive(&identity).await;
            if alive {
                return Err(ManagerError::already_running(server_id.clone()));
            }
            warn!(
                "Clearing stale handle for {} (PID {} is gone)",
                server_id, identity.pid
            );
            self.clear_handle(server_id);
        }

        let child = self.launcher.launch(server_id, spec).await?;
        let pid = child.pid();

        // Watch the child through the grace window; a server that quits
        // this fast never reached serving state.
        let grace_exit = tokio::time::timeout(
            self.timings.startup_grace,
            wait_for_exit_signal(child.exit_watcher()),
        )
        .await;

        if let Ok(outcome) = grace_exit {
            let reason = match outcome.and_then(|o| o.code) {
                Some(code) => format!("exited with status {} during startup", code),
                None => "terminated by signal during startup".to_string(),
            };
            return Err(ManagerError::spawn_failed(server_id.clone(), reason));
        }

        let identity = match self.prober.identity_of(pid).await {
            Some(identity) => identity,
            None => {
                // Process table lost it between the grace check and now.
                let _ = self.launcher.kill(pid);
                return Err(ManagerError::spawn_failed(
                    server_id.clone(),
                    "process disappeared before its identity could be recorded",
                ));
            }
        };

        let supervised = Supervised {
            child,
            identity,
            started_at: Utc::now(),
            last_sample: None,
        };

        {
            let mut handles = self.handles.lock().expect("handle map lock poisoned");
            if handles.contains_key(server_id) {
                drop(handles);
                // Lost a race with another spawn for the same id; ours
                // must not survive as an untracked process.
                let _ = self.launcher.kill(pid);
                return Err(ManagerError::already_running(server_id.clone()));
            }
            handles.insert(server_id.clone(), supervised);
        }

        info!("Supervising {} (PID {})", server_id, pid);
        Ok(())
    }

    /// Is the server's process alive — and still the process we launched?
    ///
    /// A dead or recycled PID clears the handle and answers false.
    pub async fn is_alive(&self, server_id: &ServerId) -> bool {
        let snapshot = self.snapshot_identity(server_id);
        let Some((identity, exit)) = snapshot else {
            return false;
        };

        if exit.is_some() {
            self.clear_handle(server_id);
            debug!("Handle for {} cleared: process exited", server_id);
            return false;
        }

        if self.prober.is_alive(&identity).await {
            true
        } else {
            self.clear_handle(server_id);
            info!(
                "Handle for {} cleared: PID {} no longer matches the launched process",
                server_id, identity.pid
            );
            false
        }
    }

    /// Whether any handle (live or not yet reaped) exists for the server.
    pub fn has_handle(&self, server_id: &ServerId) -> bool {
        let handles = self.handles.lock().expect("handle map lock poisoned");
        handles.contains_key(server_id)
    }

    /// Caller-facing snapshot of the handle, if one exists.
    pub fn handle(&self, server_id: &ServerId) -> Option<ProcessHandle> {
        let handles = self.handles.lock().expect("handle map lock poisoned");
        handles.get(server_id).map(|s| ProcessHandle {
            pid: s.child.pid(),
            started_at: s.started_at,
            identity: s.identity,
            last_sample: s.last_sample.clone(),
        })
    }

    /// Fresh memory/CPU sample for the server's process.
    ///
    /// `None` means no live handle. A "no such process" answer from the OS
    /// is liveness-false, not an error: the stale handle is cleared.
    pub async fn stats(&self, server_id: &ServerId) -> Option<ResourceSample> {
        let snapshot = self.snapshot_identity(server_id);
        let (identity, exit) = snapshot?;

        if exit.is_some() {
            self.clear_handle(server_id);
            return None;
        }

        match self.prober.sample(identity.pid).await {
            Some(sample) => {
                let mut handles = self.handles.lock().expect("handle map lock poisoned");
                if let Some(supervised) = handles.get_mut(server_id) {
                    supervised.last_sample = Some(sample.clone());
                }
                Some(sample)
            }
            None => {
                info!(
                    "Handle for {} cleared: PID {} vanished during sampling",
                    server_id, identity.pid
                );
                self.clear_handle(server_id);
                None
            }
        }
    }

    /// Write one console command line to the server's stdin.
    pub async fn send_command(&self, server_id: &ServerId, text: &str) -> Result<()> {
        let child = {
            let handles = self.handles.lock().expect("handle map lock poisoned");
            handles.get(server_id).map(|s| s.child.clone())
        };

        let Some(child) = child else {
            return Err(ManagerError::not_running(server_id.clone()));
        };
        if child.exit_outcome().is_some() {
            return Err(ManagerError::not_running(server_id.clone()));
        }

        child
            .send_line(text)
            .await
            .map_err(|_| ManagerError::not_running(server_id.clone()))
    }

    /// Stop the server's process, escalating graceful -> forced -> kill.
    ///
    /// Each level waits a bounded time before the next. The handle is
    /// always cleared on return; `StopFailed` is reported only when even
    /// the unconditional kill did not take effect within its bound.
    pub async fn stop(
        &self,
        server_id: &ServerId,
        graceful_timeout: Duration,
    ) -> Result<StopLevel> {
        let snapshot = {
            let handles = self.handles.lock().expect("handle map lock poisoned");
            handles.get(server_id).map(|s| (s.child.clone(), s.identity))
        };

        let Some((child, identity)) = snapshot else {
            return Err(ManagerError::not_running(server_id.clone()));
        };
        let pid = child.pid();

        // Level 1: console command. A write failure is not fatal — the
        // process may have stopped listening, which the escalation covers.
        info!("Stopping {} (PID {}): sending graceful command", server_id, pid);
        if let Err(e) = child.send_line(&self.graceful_command).await {
            debug!("Graceful command to {} not delivered: {}", server_id, e);
        }
        if self.wait_until_gone(&child, &identity, graceful_timeout).await {
            self.clear_handle(server_id);
            info!("Server {} stopped gracefully", server_id);
            return Ok(StopLevel::Graceful);
        }

        // Level 2: forced termination signal.
        warn!(
            "Server {} ignored the graceful command, sending termination signal to PID {}",
            server_id, pid
        );
        if let Err(e) = self.launcher.terminate(pid) {
            warn!("Termination signal for {} failed: {}", server_id, e);
        }
        if self
            .wait_until_gone(&child, &identity, self.timings.term_wait)
            .await
        {
            self.clear_handle(server_id);
            info!("Server {} stopped after forced termination", server_id);
            return Ok(StopLevel::Forced);
        }

        // Level 3: unconditional kill.
        error!(
            "Server {} survived the termination signal, killing PID {}",
            server_id, pid
        );
        if let Err(e) = self.launcher.kill(pid) {
            warn!("Kill for {} failed: {}", server_id, e);
        }
        if self
            .wait_until_gone(&child, &identity, self.timings.kill_wait)
            .await
        {
            self.clear_handle(server_id);
            info!("Server {} stopped after kill", server_id);
            return Ok(StopLevel::Killed);
        }

        // Even the kill did not land. Report it; the caller decides how to
        // flag the record. The handle is cleared regardless.
        self.clear_handle(server_id);
        Err(ManagerError::stop_failed(
            server_id.clone(),
            format!(
                "PID {} survived graceful command, termination signal, and kill",
                pid
            ),
        ))
    }

    /// Ids of every server currently holding a handle.
    pub fn supervised_ids(&self) -> Vec<ServerId> {
        let handles = self.handles.lock().expect("handle map lock poisoned");
        handles.keys().cloned().collect()
    }

    fn snapshot_identity(
        &self,
        server_id: &ServerId,
    ) -> Option<(ProcessIdentity, Option<ExitOutcome>)> {
        let handles = self.handles.lock().expect("handle map lock poisoned");
        handles
            .get(server_id)
            .map(|s| (s.identity, s.child.exit_outcome()))
    }

    fn clear_handle(&self, server_id: &ServerId) {
        let mut handles = self.handles.lock().expect("handle map lock poisoned");
        handles.remove(server_id);
    }

    /// Bounded wait for the process to disappear: either the exit monitor
    /// reports an outcome or the prober stops seeing the process.
    async fn wait_until_gone(
        &self,
        child: &SpawnedChild,
        identity: &ProcessIdentity,
        timeout: Duration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if child.exit_outcome().is_some() {
                return true;
            }
            if !self.prober.is_alive(identity).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }
}

/// Resolve once the watch channel reports an exit. Returns the outcome,
/// or `None` if the monitor went away without reporting one.
async fn wait_for_exit_signal(
    mut rx: watch::Receiver<Option<ExitOutcome>>,
) -> Option<ExitOutcome> {
    loop {
        if let Some(outcome) = *rx.borrow() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return *rx.borrow();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBehavior, FakeLauncher, FakeProber, FakeProcessTable};

    fn fast_timings() -> SupervisorTimings {
        SupervisorTimings {
            startup_grace: Duration::from_millis(100),
            term_wait: Duration::from_millis(200),
            kill_wait: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn fake_supervisor(behavior: FakeBehavior) -> (ProcessSupervisor, Arc<FakeProcessTable>) {
        let table = Arc::new(FakeProcessTable::default());
        let launcher = Arc::new(FakeLauncher::new(Arc::clone(&table), behavior));
        let prober = Arc::new(FakeProber {
            table: Arc::clone(&table),
        });
        (
            ProcessSupervisor::new(launcher, prober, fast_timings()),
            table,
        )
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            program: "java".to_string(),
            args: vec!["-jar".to_string(), "server.jar".to_string()],
            working_dir: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_spawn_registers_live_handle() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        assert!(supervisor.is_alive(&id).await);

        let handle = supervisor.handle(&id).unwrap();
        assert!(handle.pid >= 4000);
    }

    #[tokio::test]
    async fn test_spawn_while_running_is_already_running() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let err = supervisor.spawn(&id, &spec()).await.unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning { .. }));

        // The original handle survives untouched.
        assert!(supervisor.is_alive(&id).await);
    }

    #[tokio::test]
    async fn test_early_exit_in_grace_window_fails_spawn() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior {
            exit_immediately: Some(3),
            ..FakeBehavior::default()
        });
        let id = ServerId::from("alpha");

        let err = supervisor.spawn(&id, &spec()).await.unwrap_err();
        assert!(matches!(err, ManagerError::SpawnFailed { .. }));
        assert!(err.to_string().contains("status 3"));
        assert!(!supervisor.has_handle(&id));
    }

    #[tokio::test]
    async fn test_graceful_stop() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let level = supervisor
            .stop(&id, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(level, StopLevel::Graceful);
        assert!(!supervisor.is_alive(&id).await);
        assert!(!supervisor.has_handle(&id));
    }

    #[tokio::test]
    async fn test_escalation_stops_at_forced_level() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior {
            obey_graceful: false,
            ..FakeBehavior::default()
        });
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let level = supervisor
            .stop(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(level, StopLevel::Forced);
        assert!(!supervisor.is_alive(&id).await);
    }

    #[tokio::test]
    async fn test_escalation_reaches_kill() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior {
            obey_graceful: false,
            obey_terminate: false,
            ..FakeBehavior::default()
        });
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let level = supervisor
            .stop(&id, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(level, StopLevel::Killed);
    }

    #[tokio::test]
    async fn test_unkillable_process_reports_stop_failed() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior {
            obey_graceful: false,
            obey_terminate: false,
            obey_kill: false,
            ..FakeBehavior::default()
        });
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let err = supervisor
            .stop(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::StopFailed { .. }));
        // The handle is cleared even on failure.
        assert!(!supervisor.has_handle(&id));
    }

    #[tokio::test]
    async fn test_crash_detected_by_liveness_probe() {
        let (supervisor, table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let pid = supervisor.handle(&id).unwrap().pid;

        table.force_exit(pid, Some(137));
        assert!(!supervisor.is_alive(&id).await);
        assert!(!supervisor.has_handle(&id));

        // A restart after the crash is allowed.
        supervisor.spawn(&id, &spec()).await.unwrap();
        assert!(supervisor.is_alive(&id).await);
    }

    #[tokio::test]
    async fn test_recycled_pid_is_not_alive() {
        let (supervisor, table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let pid = supervisor.handle(&id).unwrap().pid;

        table.recycle_pid(pid);
        assert!(!supervisor.is_alive(&id).await);
        assert!(!supervisor.has_handle(&id));
    }

    #[tokio::test]
    async fn test_stats_returns_sample_and_caches_it() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let sample = supervisor.stats(&id).await.unwrap();
        assert_eq!(sample.memory_mb, Some(640));

        let handle = supervisor.handle(&id).unwrap();
        assert!(handle.last_sample.is_some());
    }

    #[tokio::test]
    async fn test_stats_for_dead_process_is_none() {
        let (supervisor, table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        supervisor.spawn(&id, &spec()).await.unwrap();
        let pid = supervisor.handle(&id).unwrap().pid;
        table.force_exit(pid, Some(0));

        assert!(supervisor.stats(&id).await.is_none());
        assert!(!supervisor.has_handle(&id));
    }

    #[tokio::test]
    async fn test_send_command_requires_live_handle() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let id = ServerId::from("alpha");

        let err = supervisor.send_command(&id, "say hello").await.unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning { .. }));

        supervisor.spawn(&id, &spec()).await.unwrap();
        supervisor.send_command(&id, "say hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_handle_is_not_running() {
        let (supervisor, _table) = fake_supervisor(FakeBehavior::default());
        let err = supervisor
            .stop(&ServerId::from("ghost"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotRunning { .. }));
    }
}
