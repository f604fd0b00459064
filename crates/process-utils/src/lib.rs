//! Child-process helpers shared by the local execution backend.
//!
//! Spawning goes through [`tokio_command`] so every child gets the same
//! platform flags, and processes that outlived the parent's bookkeeping
//! (e.g. across a daemon restart) can still be probed and terminated by pid.

use std::ffi::OsStr;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a detached job process.
///
/// The child is not killed when its handle is dropped: job processes must
/// outlive the watcher task that reaps them.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(false);
    cmd
}

/// Liveness of an operating-system process looked up by pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidState {
    /// The process exists and has not exited.
    Alive,
    /// The process exited but has not been reaped by its parent.
    Zombie,
    /// No process with this pid exists.
    Gone,
}

fn refreshed_system(pid: Pid) -> System {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
}

/// Look up the state of `pid`.
pub fn pid_state(pid: u32) -> PidState {
    let pid = Pid::from_u32(pid);
    let system = refreshed_system(pid);
    match system.process(pid) {
        Some(process) if process.status() == ProcessStatus::Zombie => PidState::Zombie,
        Some(_) => PidState::Alive,
        None => PidState::Gone,
    }
}

/// Send a kill signal to `pid`.
///
/// Returns `true` if the process was gone already or the signal was delivered.
pub fn terminate(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let system = refreshed_system(pid);
    match system.process(pid) {
        Some(process) => process.kill(),
        None => true,
    }
}
