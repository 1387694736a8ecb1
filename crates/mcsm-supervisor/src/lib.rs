//! Process supervision for game servers.
//!
//! The [`ProcessSupervisor`] owns the mapping from server id to live OS
//! process. Everything that touches the operating system goes through two
//! injected capabilities — [`ProcessLauncher`] (spawn and signals) and
//! [`LivenessProber`] (existence, identity, resource samples) — so the
//! supervisor's state machine is testable against in-memory fakes.

mod launcher;
mod prober;
mod supervisor;
pub mod testing;

pub use launcher::{
    ExitOutcome, LaunchSpec, ProcessLauncher, SpawnedChild, TokioProcessLauncher,
};
pub use prober::{LivenessProber, SysinfoProber};
pub use supervisor::{ProcessHandle, ProcessSupervisor, StopLevel, SupervisorTimings};
