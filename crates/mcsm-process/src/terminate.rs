//! Process termination signals.
//!
//! Two strengths, matching the stop escalation: `terminate_gracefully`
//! asks the process to exit, `force_kill` does not ask.

use mcsm_common::{ManagerError, Result};

/// Send the polite termination signal (SIGTERM on Unix).
pub fn terminate_gracefully(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| {
            ManagerError::stop_failed(pid.to_string(), format!("SIGTERM failed: {}", e))
        })
    }

    #[cfg(not(unix))]
    {
        // No graceful signal tier without Unix signals; the unconditional
        // kill is the only option the platform offers.
        force_kill(pid)
    }
}

/// Unconditionally kill the process (SIGKILL on Unix).
pub fn force_kill(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).map_err(|e| {
            ManagerError::stop_failed(pid.to_string(), format!("SIGKILL failed: {}", e))
        })
    }

    #[cfg(not(unix))]
    {
        use sysinfo::{Pid, ProcessRefreshKind, System};

        let mut system = System::new();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
        match system.process(sys_pid) {
            Some(process) => {
                if process.kill() {
                    Ok(())
                } else {
                    Err(ManagerError::stop_failed(
                        pid.to_string(),
                        "kill request rejected by the OS",
                    ))
                }
            }
            // Already gone; treat as success.
            None => Ok(()),
        }
    }
}
