//! Process existence checking.

use mcsm_common::{ManagerError, Result};

/// Check if a process with the given PID exists and is running.
///
/// Non-destructive: on Unix this is `kill(pid, 0)`, which delivers no
/// signal. A bare existence check is NOT a liveness probe for a tracked
/// server — the OS recycles PIDs, so callers must additionally validate
/// process identity (see the supervisor's prober).
///
/// # Returns
///
/// * `Ok(true)` - a process with this PID exists
/// * `Ok(false)` - no such process
/// * `Err(_)` - the check itself failed
pub fn process_exists(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        process_exists_unix(pid)
    }

    #[cfg(not(unix))]
    {
        process_exists_fallback(pid)
    }
}

#[cfg(unix)]
fn process_exists_unix(pid: u32) -> Result<bool> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let nix_pid = Pid::from_raw(pid as i32);

    match kill(nix_pid, None) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        // Exists, but owned by someone else.
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(ManagerError::internal(format!(
            "Failed to check process {}: {}",
            pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn process_exists_fallback(pid: u32) -> Result<bool> {
    use sysinfo::{Pid, ProcessRefreshKind, System};

    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    Ok(system.process(sys_pid).is_some())
}
