//! Port allocation for game servers.
//!
//! The allocator hands out TCP ports from a configured range, avoiding
//! ports leased to tracked servers and ports something outside our
//! bookkeeping is already listening on. External occupancy is detected
//! through a connect probe behind the [`PortProbe`] trait, so tests run
//! against an in-memory fake instead of real sockets.

use async_trait::async_trait;
use mcsm_common::{ManagerError, Result, ServerId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Answers "is something listening on this port right now?".
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// `Some(true)` = occupied, `Some(false)` = free, `None` = the probe
    /// could not tell (transient socket error). Unknown is never fatal;
    /// the allocator just moves to the next candidate.
    async fn check(&self, port: u16) -> Option<bool>;
}

/// Real probe: attempt a TCP connect to localhost.
///
/// A completed connect means a listener owns the port. Connection refused
/// means nobody is listening. Anything else is unknown.
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

#[async_trait]
impl PortProbe for TcpConnectProbe {
    async fn check(&self, port: u16) -> Option<bool> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Some(true),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Some(false),
            Ok(Err(e)) => {
                warn!("Probe of port {} inconclusive: {}", port, e);
                None
            }
            Err(_) => {
                debug!("Probe of port {} timed out", port);
                None
            }
        }
    }
}

/// Hands out non-conflicting ports from a configured range.
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    probe: Arc<dyn PortProbe>,
    leases: Mutex<HashMap<u16, ServerId>>,
}

impl PortAllocator {
    pub fn new(range: RangeInclusive<u16>, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            range,
            probe,
            leases: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a port for `server_id`.
    ///
    /// The preferred port, when given, is tried first; otherwise (or when
    /// it turns out unavailable) the range is scanned in ascending order.
    /// Fails with `NoPortAvailable` once every candidate has been leased,
    /// found occupied, or answered "unknown".
    pub async fn allocate(&self, server_id: &ServerId, preferred: Option<u16>) -> Result<u16> {
        {
            let leases = self.leases.lock().expect("port lease lock poisoned");
            if leases.values().any(|holder| holder == server_id) {
                return Err(ManagerError::already_running(server_id.clone()));
            }
        }

        let candidates = preferred
            .into_iter()
            .chain(self.range.clone().filter(|p| Some(*p) != preferred));

        for port in candidates {
            {
                let leases = self.leases.lock().expect("port lease lock poisoned");
                if leases.contains_key(&port) {
                    continue;
                }
            }

            // Probe outside the lock; a connect can take a while.
            match self.probe.check(port).await {
                Some(false) => {}
                Some(true) => {
                    debug!("Port {} externally occupied, skipping", port);
                    continue;
                }
                None => continue,
            }

            let mut leases = self.leases.lock().expect("port lease lock poisoned");
            // A concurrent allocate may have claimed it while we probed.
            if leases.contains_key(&port) {
                continue;
            }
            leases.insert(port, server_id.clone());
            debug!("Leased port {} to {}", port, server_id);
            return Ok(port);
        }

        Err(ManagerError::NoPortAvailable {
            start: *self.range.start(),
            end: *self.range.end(),
        })
    }

    /// Drop the lease on `port`. Idempotent.
    pub fn release(&self, port: u16) {
        let mut leases = self.leases.lock().expect("port lease lock poisoned");
        if let Some(holder) = leases.remove(&port) {
            debug!("Released port {} held by {}", port, holder);
        }
    }

    /// Which server, if any, holds the lease on `port`.
    pub fn lease_holder(&self, port: u16) -> Option<ServerId> {
        let leases = self.leases.lock().expect("port lease lock poisoned");
        leases.get(&port).cloned()
    }

    pub fn leased_count(&self) -> usize {
        let leases = self.leases.lock().expect("port lease lock poisoned");
        leases.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// In-memory probe with scripted answers.
    struct FakeProbe {
        occupied: HashSet<u16>,
        unknown: HashSet<u16>,
    }

    impl FakeProbe {
        fn free() -> Self {
            Self {
                occupied: HashSet::new(),
                unknown: HashSet::new(),
            }
        }
    }

    #[async_trait]
    impl PortProbe for FakeProbe {
        async fn check(&self, port: u16) -> Option<bool> {
            if self.unknown.contains(&port) {
                None
            } else {
                Some(self.occupied.contains(&port))
            }
        }
    }

    #[tokio::test]
    async fn test_preferred_port_wins_when_free() {
        let allocator = PortAllocator::new(25565..=25570, Arc::new(FakeProbe::free()));
        let port = allocator
            .allocate(&ServerId::from("alpha"), Some(25568))
            .await
            .unwrap();
        assert_eq!(port, 25568);
    }

    #[tokio::test]
    async fn test_scan_skips_leased_and_occupied_ports() {
        let probe = FakeProbe {
            occupied: HashSet::from([25566]),
            unknown: HashSet::new(),
        };
        let allocator = PortAllocator::new(25565..=25570, Arc::new(probe));

        let first = allocator
            .allocate(&ServerId::from("alpha"), None)
            .await
            .unwrap();
        assert_eq!(first, 25565);

        // 25565 leased, 25566 externally occupied -> 25567.
        let second = allocator
            .allocate(&ServerId::from("beta"), None)
            .await
            .unwrap();
        assert_eq!(second, 25567);
    }

    #[tokio::test]
    async fn test_exhausted_range_reports_no_port_available() {
        let allocator = PortAllocator::new(25565..=25567, Arc::new(FakeProbe::free()));

        for i in 0..3 {
            allocator
                .allocate(&ServerId::from(format!("server-{}", i)), None)
                .await
                .unwrap();
        }

        let err = allocator
            .allocate(&ServerId::from("late"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoPortAvailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_probe_answers_are_skipped_not_fatal() {
        let probe = FakeProbe {
            occupied: HashSet::new(),
            unknown: HashSet::from([25565, 25566]),
        };
        let allocator = PortAllocator::new(25565..=25570, Arc::new(probe));

        let port = allocator
            .allocate(&ServerId::from("alpha"), None)
            .await
            .unwrap();
        assert_eq!(port, 25567);
    }

    #[tokio::test]
    async fn test_occupied_preferred_falls_back_to_scan() {
        let probe = FakeProbe {
            occupied: HashSet::from([25569]),
            unknown: HashSet::new(),
        };
        let allocator = PortAllocator::new(25565..=25570, Arc::new(probe));

        let port = allocator
            .allocate(&ServerId::from("alpha"), Some(25569))
            .await
            .unwrap();
        assert_eq!(port, 25565);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let allocator = PortAllocator::new(25565..=25567, Arc::new(FakeProbe::free()));

        let port = allocator
            .allocate(&ServerId::from("alpha"), None)
            .await
            .unwrap();
        allocator.release(port);
        allocator.release(port);
        assert_eq!(allocator.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_one_lease_per_server() {
        let allocator = PortAllocator::new(25565..=25567, Arc::new(FakeProbe::free()));

        allocator
            .allocate(&ServerId::from("alpha"), None)
            .await
            .unwrap();
        let err = allocator
            .allocate(&ServerId::from("alpha"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::AlreadyRunning { .. }));
    }
}
