//! The lifecycle manager: orchestration of start, stop, backup, and
//! reconciliation across the ledger, allocator, supervisor, and archiver.

use crate::config::ManagerConfig;
use crate::launch;
use crate::record::ServerRecord;
use crate::store::StatusStore;
use mcsm_backup::{ArchiveCodec, BackupArchiver, TarGzCodec};
use mcsm_common::{ManagerError, Result, ServerId};
use mcsm_ports::{PortAllocator, PortProbe, TcpConnectProbe};
use mcsm_resources::{MemoryLedger, MemoryLimits, ReservationToken, ResourceSample};
use mcsm_state::{ServerStatus, StatusMachine};
use mcsm_supervisor::{
    LivenessProber, ProcessLauncher, ProcessSupervisor, StopLevel, SupervisorTimings,
    SysinfoProber, TokioProcessLauncher,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pause after `save-all flush` before archiving a running server, giving
/// the world writer time to settle.
const FLUSH_SETTLE: Duration = Duration::from_millis(500);

struct ManagedServer {
    record: ServerRecord,
    machine: StatusMachine,
    /// Port preference from the original record, restored when the
    /// allocated port is released.
    declared_port: Option<u16>,
    reservation: Option<ReservationToken>,
    lease: Option<u16>,
}

/// Orchestrates server lifecycles.
///
/// Unrelated servers proceed independently: the record map lock guards
/// only short read/modify sections and is never held across an await. The
/// ledger and the allocator serialize their own totals internally.
pub struct LifecycleManager {
    config: ManagerConfig,
    ledger: Arc<MemoryLedger>,
    ports: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    archiver: BackupArchiver,
    store: Arc<dyn StatusStore>,
    servers: RwLock<HashMap<ServerId, ManagedServer>>,
}

impl LifecycleManager {
    /// Manager over the real OS: tokio process launching, sysinfo probing,
    /// TCP connect probing, tar.gz archives.
    pub fn new(config: ManagerConfig, store: Arc<dyn StatusStore>) -> Self {
        Self::with_components(
            config,
            store,
            Arc::new(TokioProcessLauncher),
            Arc::new(SysinfoProber::new()),
            Arc::new(TcpConnectProbe::default()),
            Arc::new(TarGzCodec),
        )
    }

    /// Manager with explicit capability implementations (tests inject
    /// in-memory fakes here).
    pub fn with_components(
        config: ManagerConfig,
        store: Arc<dyn StatusStore>,
        launcher: Arc<dyn ProcessLauncher>,
        prober: Arc<dyn LivenessProber>,
        probe: Arc<dyn PortProbe>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> Self {
        let ledger = Arc::new(MemoryLedger::new(MemoryLimits {
            max_total_mb: config.max_total_memory_mb,
            min_server_mb: config.min_server_memory_mb,
            max_server_mb: config.max_server_memory_mb,
        }));
        let ports = Arc::new(PortAllocator::new(config.port_range(), probe));
        let supervisor = Arc::new(ProcessSupervisor::new(
            launcher,
            prober,
            SupervisorTimings {
                startup_grace: config.startup_grace,
                term_wait: config.forced_stop_timeout,
                kill_wait: config.kill_timeout,
                poll_interval: Duration::from_millis(25),
            },
        ));
        let archiver = BackupArchiver::new(config.backup_dir.clone(), codec);

        Self {
            config,
            ledger,
            ports,
            supervisor,
            archiver,
            store,
            servers: RwLock::new(HashMap::new()),
        }
    }

    /// Bring a server record under management.
    ///
    /// A record persisted in an active status is normalized to `Stopped`:
    /// after a manager restart no process handle exists for it.
    pub fn register_server(&self, mut record: ServerRecord) -> Result<()> {
        mcsm_process::validate_server_id(record.id.as_str())?;

        let mut servers = self.servers.write().expect("server map lock poisoned");

        if servers.contains_key(&record.id) {
            return Err(ManagerError::configuration(format!(
                "server id '{}' already registered",
                record.id
            )));
        }
        if servers.values().any(|s| s.record.name == record.name) {
            return Err(ManagerError::configuration(format!(
                "server name '{}' already in use",
                record.name
            )));
        }

        if record.status.is_active() {
            warn!(
                "Registering {} with persisted status {}; normalizing to stopped",
                record.id, record.status
            );
            record.status = ServerStatus::Stopped;
        }

        let machine = StatusMachine::from_status(record.id.as_str(), record.status);
        if let Err(e) = self.store.record_status(&record.id, record.status) {
            warn!("Status store rejected initial status for {}: {}", record.id, e);
        }

        info!("Registered server {} ({})", record.id, record.name);
        let declared_port = record.port;
        servers.insert(
            record.id.clone(),
            ManagedServer {
                record,
                machine,
                declared_port,
                reservation: None,
                lease: None,
            },
        );
        Ok(())
    }

    /// Remove a record from management. Only allowed once the server is
    /// stopped and no process handle remains.
    pub fn deregister_server(&self, server_id: &ServerId) -> Result<()> {
        let mut servers = self.servers.write().expect("server map lock poisoned");
        let entry = servers
            .get(server_id)
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;

        if entry.machine.current() != ServerStatus::Stopped {
            return Err(ManagerError::conflict(
                server_id.clone(),
                "deregister",
                entry.machine.current().to_string(),
            ));
        }
        if self.supervisor.has_handle(server_id) {
            return Err(ManagerError::conflict(
                server_id.clone(),
                "deregister",
                "process handle still present",
            ));
        }

        servers.remove(server_id);
        info!("Deregistered server {}", server_id);
        Ok(())
    }

    /// Start a server: reserve memory, allocate a port, write the launch
    /// layout, spawn the process, and commit.
    ///
    /// Every completed step is rolled back if a later one fails — the
    /// rollback lives in a drop guard, so it runs even if the calling
    /// request is aborted mid-start.
    pub async fn start(&self, server_id: &ServerId) -> Result<()> {
        // Claim the record by moving it to Starting.
        let (record, memory_mb) = {
            let mut servers = self.servers.write().expect("server map lock poisoned");
            let entry = servers
                .get_mut(server_id)
                .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;

            if entry.machine.current() != ServerStatus::Stopped {
                return Err(ManagerError::conflict(
                    server_id.clone(),
                    "start",
                    entry.machine.current().to_string(),
                ));
            }
            Self::apply_status(
                &*self.store,
                entry,
                ServerStatus::Starting,
                "start requested",
            )?;

            // A record that declares no allocation runs with the default;
            // the resolved value sizes both the reservation and the heap.
            let mut record = entry.record.clone();
            if record.memory_mb == 0 {
                record.memory_mb = self.config.default_server_memory_mb;
            }
            let memory_mb = record.memory_mb;
            (record, memory_mb)
        };

        let mut rollback = StartRollback {
            manager: self,
            server_id: server_id.clone(),
            token: None,
            port: None,
            armed: true,
        };

        let token = self.ledger.reserve(server_id, memory_mb)?;
        rollback.token = Some(token);

        let port = self.ports.allocate(server_id, record.port).await?;
        rollback.port = Some(port);

        let dir = launch::data_dir(&self.config, &record);
        {
            let record = record.clone();
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || launch::write_launch_files(&dir, &record, port))
                .await
                .map_err(|e| ManagerError::internal(format!("launch layout task panicked: {}", e)))??;
        }

        let spec = launch::build_launch_spec(&self.config, &record, port, &dir);
        self.supervisor.spawn(server_id, &spec).await?;

        // Commit: hand the reservation and lease to the record entry.
        let (token, port) = rollback.disarm();
        {
            let mut servers = self.servers.write().expect("server map lock poisoned");
            let entry = servers
                .get_mut(server_id)
                .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;
            entry.reservation = token;
            entry.lease = port;
            entry.record.port = port;
            Self::apply_status(&*self.store, entry, ServerStatus::Running, "spawn succeeded")?;
        }

        info!("Server {} started on port {:?}", server_id, port);
        Ok(())
    }

    /// Stop a running server, releasing its reservation and lease.
    ///
    /// A failed escalation parks the record in `Error` for operator
    /// attention; resources are released either way.
    pub async fn stop(&self, server_id: &ServerId) -> Result<()> {
        {
            let mut servers = self.servers.write().expect("server map lock poisoned");
            let entry = servers
                .get_mut(server_id)
                .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;

            if entry.machine.current() != ServerStatus::Running {
                return Err(ManagerError::conflict(
                    server_id.clone(),
                    "stop",
                    entry.machine.current().to_string(),
                ));
            }
            Self::apply_status(&*self.store, entry, ServerStatus::Stopping, "stop requested")?;
        }

        let result = self
            .supervisor
            .stop(server_id, self.config.graceful_stop_timeout)
            .await;

        let mut servers = self.servers.write().expect("server map lock poisoned");
        let entry = servers
            .get_mut(server_id)
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;
        self.release_resources(entry);

        match result {
            Ok(level) => {
                let reason = match level {
                    StopLevel::Graceful => "stopped gracefully",
                    StopLevel::Forced => "stopped after forced termination",
                    StopLevel::Killed => "stopped after kill",
                };
                Self::apply_status(&*self.store, entry, ServerStatus::Stopped, reason)?;
                Ok(())
            }
            Err(ManagerError::NotRunning { .. }) => {
                // The process died between the status check and the stop;
                // that is a stop, not a failure.
                Self::apply_status(
                    &*self.store,
                    entry,
                    ServerStatus::Stopped,
                    "process already gone",
                )?;
                Ok(())
            }
            Err(e) => {
                error!("Stop escalation failed for {}: {}", server_id, e);
                Self::apply_status(
                    &*self.store,
                    entry,
                    ServerStatus::Error,
                    "stop escalation failed",
                )?;
                Err(e)
            }
        }
    }

    /// Write one console command line to a running server.
    pub async fn send_command(&self, server_id: &ServerId, text: &str) -> Result<()> {
        {
            let servers = self.servers.read().expect("server map lock poisoned");
            let entry = servers
                .get(server_id)
                .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;
            if entry.machine.current() != ServerStatus::Running {
                return Err(ManagerError::not_running(server_id.clone()));
            }
        }
        self.supervisor.send_command(server_id, text).await
    }

    /// Current status of a server.
    pub fn status(&self, server_id: &ServerId) -> Result<ServerStatus> {
        let servers = self.servers.read().expect("server map lock poisoned");
        servers
            .get(server_id)
            .map(|s| s.machine.current())
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))
    }

    /// Snapshot of the record as currently managed.
    pub fn record(&self, server_id: &ServerId) -> Result<ServerRecord> {
        let servers = self.servers.read().expect("server map lock poisoned");
        servers
            .get(server_id)
            .map(|s| s.record.clone())
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))
    }

    /// Fresh resource sample for a running server.
    pub async fn stats(&self, server_id: &ServerId) -> Option<ResourceSample> {
        self.supervisor.stats(server_id).await
    }

    /// Total memory currently committed in the ledger.
    pub fn committed_memory_mb(&self) -> u64 {
        self.ledger.committed_mb()
    }

    /// Reconcile persisted statuses against actual process liveness, then
    /// return every record still Running or Starting.
    ///
    /// Only demotes, never promotes, so it is safe to run concurrently
    /// with start/stop: a Starting record whose spawn is still in flight
    /// (no handle yet) is left alone.
    pub async fn list_running(&self) -> Vec<ServerRecord> {
        let candidates: Vec<(ServerId, ServerStatus)> = {
            let servers = self.servers.read().expect("server map lock poisoned");
            servers
                .values()
                .filter(|s| s.machine.current().claims_process())
                .map(|s| (s.record.id.clone(), s.machine.current()))
                .collect()
        };

        for (server_id, status) in candidates {
            if status == ServerStatus::Starting && !self.supervisor.has_handle(&server_id) {
                continue;
            }
            if self.supervisor.is_alive(&server_id).await {
                continue;
            }

            let mut servers = self.servers.write().expect("server map lock poisoned");
            if let Some(entry) = servers.get_mut(&server_id) {
                if !entry.machine.current().claims_process() {
                    continue;
                }
                warn!(
                    "Server {} claims {} but its process is gone; demoting",
                    server_id,
                    entry.machine.current()
                );
                self.release_resources(entry);
                if let Err(e) = Self::apply_status(
                    &*self.store,
                    entry,
                    ServerStatus::Stopped,
                    "liveness probe found process gone",
                ) {
                    error!("Failed to demote {}: {}", server_id, e);
                }
            }
        }

        let servers = self.servers.read().expect("server map lock poisoned");
        servers
            .values()
            .filter(|s| s.machine.current().claims_process())
            .map(|s| s.record.clone())
            .collect()
    }

    /// Archive a server's data directory.
    ///
    /// Allowed while `Stopped`, or while `Running` after a successful
    /// world flush issued through the console; any other status would
    /// archive mid-write state and is rejected.
    pub async fn create_backup(&self, server_id: &ServerId) -> Result<PathBuf> {
        let (status, dir) = self.status_and_dir(server_id)?;

        let was_running = match status {
            ServerStatus::Stopped => false,
            ServerStatus::Running => true,
            other => {
                return Err(ManagerError::conflict(
                    server_id.clone(),
                    "backup",
                    other.to_string(),
                ))
            }
        };

        if was_running {
            self.supervisor.send_command(server_id, "save-off").await?;
            self.supervisor
                .send_command(server_id, "save-all flush")
                .await?;
            tokio::time::sleep(FLUSH_SETTLE).await;
        }

        let result = self.archiver.create_backup(server_id, &dir).await;

        if was_running {
            // Re-enable autosave whether or not the archive succeeded.
            if let Err(e) = self.supervisor.send_command(server_id, "save-on").await {
                warn!("Failed to re-enable autosave on {}: {}", server_id, e);
            }
        }

        result
    }

    /// Replace a stopped server's data directory from an archive.
    pub async fn restore_backup(&self, server_id: &ServerId, archive: &Path) -> Result<()> {
        let (status, dir) = self.status_and_dir(server_id)?;
        if status != ServerStatus::Stopped {
            return Err(ManagerError::conflict(
                server_id.clone(),
                "restore",
                status.to_string(),
            ));
        }
        self.archiver.restore_backup(archive, &dir).await
    }

    /// Archives available for a server, newest first.
    pub fn list_backups(&self, server_id: &ServerId) -> Result<Vec<PathBuf>> {
        self.archiver.list_backups(server_id)
    }

    /// Operator acknowledgment of a failed stop; the record returns to
    /// `Stopped` and may be started again.
    pub fn acknowledge_error(&self, server_id: &ServerId) -> Result<()> {
        let mut servers = self.servers.write().expect("server map lock poisoned");
        let entry = servers
            .get_mut(server_id)
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;

        if entry.machine.current() != ServerStatus::Error {
            return Err(ManagerError::conflict(
                server_id.clone(),
                "acknowledge_error",
                entry.machine.current().to_string(),
            ));
        }
        Self::apply_status(
            &*self.store,
            entry,
            ServerStatus::Stopped,
            "error acknowledged by operator",
        )
    }

    /// Stop every running server; used at daemon shutdown.
    pub async fn shutdown_all(&self) {
        let running: Vec<ServerId> = {
            let servers = self.servers.read().expect("server map lock poisoned");
            servers
                .values()
                .filter(|s| s.machine.current() == ServerStatus::Running)
                .map(|s| s.record.id.clone())
                .collect()
        };

        for server_id in running {
            if let Err(e) = self.stop(&server_id).await {
                error!("Failed to stop {} during shutdown: {}", server_id, e);
            }
        }
    }

    /// Ids of every registered server.
    pub fn server_ids(&self) -> Vec<ServerId> {
        let servers = self.servers.read().expect("server map lock poisoned");
        servers.keys().cloned().collect()
    }

    fn status_and_dir(&self, server_id: &ServerId) -> Result<(ServerStatus, PathBuf)> {
        let servers = self.servers.read().expect("server map lock poisoned");
        let entry = servers
            .get(server_id)
            .ok_or_else(|| ManagerError::not_found(server_id.clone()))?;
        Ok((
            entry.machine.current(),
            launch::data_dir(&self.config, &entry.record),
        ))
    }

    /// Release whatever reservation and lease the entry still holds.
    fn release_resources(&self, entry: &mut ManagedServer) {
        if let Some(token) = entry.reservation.take() {
            self.ledger.release(token);
        }
        if let Some(port) = entry.lease.take() {
            self.ports.release(port);
        }
        entry.record.port = entry.declared_port;
    }

    fn apply_status(
        store: &dyn StatusStore,
        entry: &mut ManagedServer,
        target: ServerStatus,
        reason: &str,
    ) -> Result<()> {
        entry
            .machine
            .transition_to(target, Some(reason.to_string()))?;
        entry.record.status = target;
        if let Err(e) = store.record_status(&entry.record.id, target) {
            // In-memory state is authoritative; the mirror catches up on
            // the next transition.
            warn!(
                "Status store rejected {} -> {}: {}",
                entry.record.id, target, e
            );
        }
        Ok(())
    }

    fn rollback_failed_start(
        &self,
        server_id: &ServerId,
        token: Option<ReservationToken>,
        port: Option<u16>,
    ) {
        if let Some(token) = token {
            self.ledger.release(token);
        }
        if let Some(port) = port {
            self.ports.release(port);
        }

        let mut servers = self.servers.write().expect("server map lock poisoned");
        if let Some(entry) = servers.get_mut(server_id) {
            if entry.machine.current() == ServerStatus::Starting {
                if let Err(e) = Self::apply_status(
                    &*self.store,
                    entry,
                    ServerStatus::Stopped,
                    "start rolled back",
                ) {
                    error!("Rollback of {} could not demote status: {}", server_id, e);
                }
            }
        }
        info!("Rolled back failed start of {}", server_id);
    }
}

/// Drop guard covering the reserve -> allocate -> spawn sequence.
///
/// Armed until the start commits; dropping it (early return, `?`, or a
/// cancelled request future) releases every acquired resource and demotes
/// the record. Rollback is synchronous so it cannot itself be cancelled.
struct StartRollback<'a> {
    manager: &'a LifecycleManager,
    server_id: ServerId,
    token: Option<ReservationToken>,
    port: Option<u16>,
    armed: bool,
}

impl StartRollback<'_> {
    fn disarm(mut self) -> (Option<ReservationToken>, Option<u16>) {
        self.armed = false;
        (self.token.take(), self.port.take())
    }
}

impl Drop for StartRollback<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let token = self.token.take();
        let port = self.port.take();
        self.manager
            .rollback_failed_start(&self.server_id, token, port);
    }
}
