//! Process-group management for the LSP child, so that shutdown takes the
//! whole tree (JVM wrappers tend to fork helpers) and not just the launcher.

#[cfg(unix)]
use tracing::debug;
#[cfg(not(unix))]
use tracing::warn;

/// Place the child in its own process group before exec.
#[cfg(unix)]
pub fn assign_new_group(cmd: &mut tokio::process::Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
pub fn assign_new_group(_cmd: &mut tokio::process::Command) {}

/// Terminate every process in the child's group: SIGTERM, a short grace
/// period, then SIGKILL for anything still alive.
#[cfg(unix)]
pub async fn terminate_group(pid: u32) {
    let pgid = pid as i32;

    if unsafe { libc::killpg(pgid, libc::SIGTERM) } != 0 {
        debug!("failed to send SIGTERM to process group {}", pgid);
        return;
    }
    debug!("sent SIGTERM to process group {}", pgid);

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        debug!("sent SIGKILL to process group {}", pgid);
    }
}

#[cfg(not(unix))]
pub async fn terminate_group(_pid: u32) {
    warn!("process group termination not available on this platform");
}
