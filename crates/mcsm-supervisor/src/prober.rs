//! Liveness probing behind the [`LivenessProber`] capability.

use async_trait::async_trait;
use mcsm_resources::{ProcessIdentity, ResourceMonitor, ResourceSample};
use std::sync::Arc;
use tracing::warn;

/// Capability for answering "is our process still our process?" and for
/// sampling its resource usage.
#[async_trait]
pub trait LivenessProber: Send + Sync {
    /// Capture the identity of a freshly spawned process.
    async fn identity_of(&self, pid: u32) -> Option<ProcessIdentity>;

    /// True only if a process with this PID exists AND it is the process
    /// the identity was captured from. A recycled PID answers false.
    async fn is_alive(&self, identity: &ProcessIdentity) -> bool;

    /// Memory/CPU sample, or `None` when the process is gone.
    async fn sample(&self, pid: u32) -> Option<ResourceSample>;
}

/// Real prober over the OS process table.
///
/// The underlying queries are blocking, so each call hops to the blocking
/// pool instead of stalling the caller's task.
pub struct SysinfoProber {
    monitor: Arc<ResourceMonitor>,
}

impl SysinfoProber {
    pub fn new() -> Self {
        Self {
            monitor: Arc::new(ResourceMonitor::new()),
        }
    }
}

impl Default for SysinfoProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LivenessProber for SysinfoProber {
    async fn identity_of(&self, pid: u32) -> Option<ProcessIdentity> {
        let monitor = Arc::clone(&self.monitor);
        match tokio::task::spawn_blocking(move || monitor.identity_of(pid)).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!("Identity lookup task for PID {} failed: {}", pid, e);
                None
            }
        }
    }

    async fn is_alive(&self, identity: &ProcessIdentity) -> bool {
        let monitor = Arc::clone(&self.monitor);
        let identity = *identity;

        let result = tokio::task::spawn_blocking(move || {
            // Quick existence check first; the identity match only matters
            // when some process still answers to the PID.
            match mcsm_process::process_exists(identity.pid) {
                Ok(false) => false,
                _ => monitor.matches_identity(&identity),
            }
        })
        .await;

        match result {
            Ok(alive) => alive,
            Err(e) => {
                warn!("Liveness task for PID {} failed: {}", identity.pid, e);
                false
            }
        }
    }

    async fn sample(&self, pid: u32) -> Option<ResourceSample> {
        let monitor = Arc::clone(&self.monitor);
        match tokio::task::spawn_blocking(move || monitor.sample(pid)).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Sampling task for PID {} failed: {}", pid, e);
                None
            }
        }
    }
}
