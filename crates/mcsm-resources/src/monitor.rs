//! Per-process resource sampling and identity lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::debug;

/// Point-in-time memory/CPU usage of one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub cpu_percent: Option<f32>,
    pub memory_mb: Option<u64>,
    pub sampled_at: DateTime<Utc>,
}

/// What makes a PID "the process we launched" rather than a recycled PID.
///
/// The OS start time is recorded at spawn; a PID whose start time differs
/// belongs to an unrelated process that inherited the number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time_secs: u64,
}

/// Samples live processes through the OS process table.
pub struct ResourceMonitor {
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Current resource usage of `pid`, or `None` if the process is gone.
    ///
    /// The refresh must name what it wants; without it sysinfo hands back
    /// stale or zeroed data.
    pub fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let mut system = self.system.lock().expect("resource monitor lock poisoned");

        let sys_pid = Pid::from_u32(pid);
        system.refresh_process_specifics(
            sys_pid,
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );

        let process = system.process(sys_pid)?;

        let cpu_percent = process.cpu_usage();
        let memory_mb = process.memory() / (1024 * 1024);

        debug!(
            "Sample for PID {}: cpu={:.1}%, memory={} MB",
            pid, cpu_percent, memory_mb
        );

        Some(ResourceSample {
            cpu_percent: Some(cpu_percent),
            memory_mb: Some(memory_mb),
            sampled_at: Utc::now(),
        })
    }

    /// Capture the identity of a freshly spawned process.
    pub fn identity_of(&self, pid: u32) -> Option<ProcessIdentity> {
        let mut system = self.system.lock().expect("resource monitor lock poisoned");

        let sys_pid = Pid::from_u32(pid);
        system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());

        system.process(sys_pid).map(|process| ProcessIdentity {
            pid,
            start_time_secs: process.start_time(),
        })
    }

    /// True if a process with this identity's PID exists AND its start
    /// time matches, i.e. the PID has not been recycled.
    pub fn matches_identity(&self, identity: &ProcessIdentity) -> bool {
        let mut system = self.system.lock().expect("resource monitor lock poisoned");

        let sys_pid = Pid::from_u32(identity.pid);
        system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());

        match system.process(sys_pid) {
            Some(process) => process.start_time() == identity.start_time_secs,
            None => false,
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_of_current_process() {
        let monitor = ResourceMonitor::new();
        let sample = monitor.sample(std::process::id());
        let sample = sample.expect("current process must be sampleable");
        assert!(sample.memory_mb.is_some());
    }

    #[test]
    fn test_sample_of_missing_process_is_none() {
        let monitor = ResourceMonitor::new();
        // High PIDs are vanishingly unlikely to exist.
        assert!(monitor.sample(u32::MAX - 1).is_none());
    }

    #[test]
    fn test_identity_round_trip() {
        let monitor = ResourceMonitor::new();
        let identity = monitor
            .identity_of(std::process::id())
            .expect("current process has an identity");
        assert!(monitor.matches_identity(&identity));

        let recycled = ProcessIdentity {
            start_time_secs: identity.start_time_secs.wrapping_add(1),
            ..identity
        };
        assert!(!monitor.matches_identity(&recycled));
    }
}
