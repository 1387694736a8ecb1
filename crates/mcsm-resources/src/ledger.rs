//! Cluster-wide memory admission ledger.
//!
//! Every server start reserves its declared memory here before anything
//! else happens; the reservation is released when the server stops or the
//! start fails. One mutex serializes reserve/release, which is the only
//! cross-server coordination point in the whole admission path.

use mcsm_common::{ManagerError, Result, ServerId};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Per-server and cluster-wide memory bounds, in megabytes.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub max_total_mb: u64,
    pub min_server_mb: u64,
    pub max_server_mb: u64,
}

/// Proof of an admitted reservation.
///
/// The sequence number ties the token to one specific reserve call: a
/// token that survives past its server's next reservation (a cleanup path
/// racing a restart) can no longer release the newer entry.
#[derive(Debug)]
pub struct ReservationToken {
    server_id: ServerId,
    seq: u64,
    mb: u64,
}

impl ReservationToken {
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn megabytes(&self) -> u64 {
        self.mb
    }
}

#[derive(Debug)]
struct LedgerEntry {
    mb: u64,
    seq: u64,
}

/// Tracks committed memory across all admitted servers.
#[derive(Debug)]
pub struct MemoryLedger {
    limits: MemoryLimits,
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    reservations: HashMap<ServerId, LedgerEntry>,
    next_seq: u64,
}

impl MemoryLedger {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Reserve `requested_mb` for `server_id`.
    ///
    /// Fails with `MemoryOutOfRange` when the request is outside the
    /// per-server bounds and with `InsufficientMemory` when admitting it
    /// would push the committed total past the ceiling. A server that
    /// already holds a reservation cannot take a second one.
    pub fn reserve(&self, server_id: &ServerId, requested_mb: u64) -> Result<ReservationToken> {
        if requested_mb < self.limits.min_server_mb || requested_mb > self.limits.max_server_mb {
            return Err(ManagerError::MemoryOutOfRange {
                requested_mb,
                min_mb: self.limits.min_server_mb,
                max_mb: self.limits.max_server_mb,
            });
        }

        let mut inner = self.inner.lock().expect("memory ledger lock poisoned");

        if inner.reservations.contains_key(server_id) {
            return Err(ManagerError::already_running(server_id.clone()));
        }

        let committed_mb: u64 = inner.reservations.values().map(|e| e.mb).sum();
        if committed_mb + requested_mb > self.limits.max_total_mb {
            return Err(ManagerError::InsufficientMemory {
                requested_mb,
                committed_mb,
                ceiling_mb: self.limits.max_total_mb,
            });
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.reservations.insert(
            server_id.clone(),
            LedgerEntry {
                mb: requested_mb,
                seq,
            },
        );

        debug!(
            "Reserved {} MB for {} ({} MB committed of {} MB)",
            requested_mb,
            server_id,
            committed_mb + requested_mb,
            self.limits.max_total_mb
        );

        Ok(ReservationToken {
            server_id: server_id.clone(),
            seq,
            mb: requested_mb,
        })
    }

    /// Release a reservation. Idempotent: releasing a token twice, or a
    /// token whose entry was already replaced, is a no-op.
    pub fn release(&self, token: ReservationToken) {
        let mut inner = self.inner.lock().expect("memory ledger lock poisoned");

        match inner.reservations.get(&token.server_id) {
            Some(entry) if entry.seq == token.seq => {
                inner.reservations.remove(&token.server_id);
                debug!("Released {} MB for {}", token.mb, token.server_id);
            }
            Some(_) => {
                warn!(
                    "Ignoring stale reservation token for {} (entry re-reserved)",
                    token.server_id
                );
            }
            None => {
                debug!(
                    "Ignoring release for {}: no reservation held",
                    token.server_id
                );
            }
        }
    }

    /// Total committed memory in MB.
    pub fn committed_mb(&self) -> u64 {
        let inner = self.inner.lock().expect("memory ledger lock poisoned");
        inner.reservations.values().map(|e| e.mb).sum()
    }

    /// Reservation held by one server, if any.
    pub fn reserved_for(&self, server_id: &ServerId) -> Option<u64> {
        let inner = self.inner.lock().expect("memory ledger lock poisoned");
        inner.reservations.get(server_id).map(|e| e.mb)
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_limits() -> MemoryLimits {
        MemoryLimits {
            max_total_mb: 1024,
            min_server_mb: 128,
            max_server_mb: 1024,
        }
    }

    #[test]
    fn test_second_reservation_over_ceiling_rejected() {
        let ledger = MemoryLedger::new(test_limits());

        let first = ledger.reserve(&ServerId::from("alpha"), 600).unwrap();
        let err = ledger.reserve(&ServerId::from("beta"), 600).unwrap_err();
        assert!(matches!(err, ManagerError::InsufficientMemory { .. }));

        // After releasing the first, the second fits.
        ledger.release(first);
        assert!(ledger.reserve(&ServerId::from("beta"), 600).is_ok());
        assert_eq!(ledger.committed_mb(), 600);
    }

    #[test]
    fn test_out_of_range_request_rejected() {
        let ledger = MemoryLedger::new(test_limits());

        let err = ledger.reserve(&ServerId::from("alpha"), 64).unwrap_err();
        assert!(matches!(err, ManagerError::MemoryOutOfRange { .. }));

        let err = ledger.reserve(&ServerId::from("alpha"), 2048).unwrap_err();
        assert!(matches!(err, ManagerError::MemoryOutOfRange { .. }));

        assert_eq!(ledger.committed_mb(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = MemoryLedger::new(test_limits());

        let token = ledger.reserve(&ServerId::from("alpha"), 512).unwrap();
        ledger.release(token);
        assert_eq!(ledger.committed_mb(), 0);

        // A re-reservation must not be clobbered by a token from the
        // previous generation.
        let _current = ledger.reserve(&ServerId::from("alpha"), 256).unwrap();
        assert_eq!(ledger.committed_mb(), 256);
    }

    #[test]
    fn test_stale_token_cannot_release_new_entry() {
        let ledger = MemoryLedger::new(test_limits());

        let stale = ledger.reserve(&ServerId::from("alpha"), 512).unwrap();
        // Simulate a crashed start whose cleanup raced a fresh reserve.
        let fresh_mb = {
            let mut inner = ledger.inner.lock().unwrap();
            inner.reservations.remove(&ServerId::from("alpha"));
            256
        };
        let fresh = ledger.reserve(&ServerId::from("alpha"), fresh_mb).unwrap();

        ledger.release(stale);
        assert_eq!(ledger.committed_mb(), 256);
        ledger.release(fresh);
        assert_eq!(ledger.committed_mb(), 0);
    }

    #[test]
    fn test_concurrent_reserves_never_exceed_ceiling() {
        let ledger = Arc::new(MemoryLedger::new(MemoryLimits {
            max_total_mb: 1000,
            min_server_mb: 100,
            max_server_mb: 1000,
        }));

        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                let id = ServerId::from(format!("server-{}", i));
                ledger.reserve(&id, 300).is_ok()
            }));
        }

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        // 3 * 300 = 900 fits, a 4th would exceed 1000.
        assert_eq!(admitted, 3);
        assert!(ledger.committed_mb() <= 1000);
    }
}
