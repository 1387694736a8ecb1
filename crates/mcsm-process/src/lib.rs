//! Low-level process primitives.
//!
//! Cross-platform liveness checks and termination signals, used by the
//! supervisor's stop escalation. Nothing here knows about game servers;
//! the API is PID in, result out.

mod check;
mod terminate;
mod validation;

pub use check::process_exists;
pub use terminate::{force_kill, terminate_gracefully};
pub use validation::validate_server_id;
