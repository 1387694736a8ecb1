//! Resource accounting and inspection.
//!
//! Two concerns live here: the [`MemoryLedger`] admits or rejects server
//! starts against the cluster-wide memory ceiling, and the
//! [`ResourceMonitor`] samples live processes (memory, CPU, identity) via
//! the OS process table.

pub mod ledger;
pub mod monitor;

pub use ledger::{MemoryLedger, MemoryLimits, ReservationToken};
pub use monitor::{ProcessIdentity, ResourceMonitor, ResourceSample};
