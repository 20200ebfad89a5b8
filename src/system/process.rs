// src/system/process.rs

use crate::constants::POLL_INTERVAL;
use crate::system::backend::{BackendError, BackendResult, RunningProcess};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::time::{Duration, Instant};

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

/// True if a process with this pid exists (zombies included).
pub fn is_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    match signal::kill(pid, None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Sends `sig` to the process group led by `pid`, falling back to the process itself.
/// A process that is already gone is not an error.
pub fn send_signal(pid: u32, sig: Signal) -> BackendResult<()> {
    let Some(target) = to_pid(pid) else {
        return Ok(());
    };
    match signal::killpg(target, sig) {
        Ok(()) => return Ok(()),
        Err(Errno::ESRCH) | Err(Errno::EPERM) => {}
        Err(e) => log::debug!("killpg({}) failed with {}; signalling the process.", pid, e),
    }
    match signal::kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(BackendError::Signal { pid, source: e }),
    }
}

/// Polls until the process exits or `timeout` elapses. Returns whether it exited.
pub fn wait_for_exit(process: &mut RunningProcess, timeout: Duration) -> std::io::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if process.has_exited()? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Waits for a process that was asked to stop; kills it if it outlives `timeout`.
pub fn ensure_stopped(process: &mut RunningProcess, timeout: Duration) -> BackendResult<()> {
    if wait_for_exit(process, timeout)? {
        return Ok(());
    }
    log::warn!(
        "Process {} did not exit within {:?}, sending SIGKILL.",
        process.pid(),
        timeout
    );
    send_signal(process.pid(), Signal::SIGKILL)?;
    if wait_for_exit(process, Duration::from_secs(2))? {
        return Ok(());
    }
    Err(BackendError::Io(std::io::Error::other(format!(
        "process {} is still running after SIGKILL",
        process.pid()
    ))))
}
