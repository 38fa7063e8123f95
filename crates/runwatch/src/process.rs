//! Child process helpers shared by the job runner and the visualizer.
//!
//! Supervised children are started in their own process group so signals
//! reach everything they fork, not just the direct child.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::time::Duration;

use log::{debug, warn};
use tokio::process::Child;

/// Send `signal` to the process group led by `pid`.
///
/// Returns `false` when the group no longer exists.
pub fn signal_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        debug!(
            "killpg({}, {}) failed: {}",
            pgid,
            signal,
            io::Error::last_os_error()
        );
    }
    rc == 0
}

/// Ask the process group to exit (SIGTERM).
pub fn terminate_group(pid: u32) -> bool {
    signal_group(pid, libc::SIGTERM)
}

/// Force the process group down (SIGKILL).
pub fn kill_group(pid: u32) -> bool {
    signal_group(pid, libc::SIGKILL)
}

/// Exit code of a finished process; signal deaths map to the negated signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// Terminate a child and its group: SIGTERM first, SIGKILL after `grace`.
///
/// Always reaps the child.
pub async fn shutdown_child(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    let Some(pid) = child.id() else {
        return child.wait().await;
    };

    terminate_group(pid);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!("Process {} ignored SIGTERM for {:?}, killing", pid, grace);
            kill_group(pid);
            if let Err(e) = child.start_kill() {
                debug!("start_kill for {} failed: {}", pid, e);
            }
            child.wait().await
        }
    }
}
