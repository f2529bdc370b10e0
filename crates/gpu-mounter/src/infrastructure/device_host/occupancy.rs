//! Open device handles of container processes

use std::io;
use std::path::Path;

use tokio::fs;
use tracing::debug;

/// PIDs among `pids` with an open descriptor on `device`.
///
/// Processes that exit while being inspected are skipped.
pub async fn holders(proc_root: &Path, pids: &[u32], device: &Path) -> io::Result<Vec<u32>> {
    let mut holding = Vec::new();
    for &pid in pids {
        let fd_dir = proc_root.join(pid.to_string()).join("fd");
        let mut entries = match fs::read_dir(&fd_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let Ok(target) = fs::read_link(entry.path()).await else {
                continue;
            };
            if target == device {
                debug!(pid, device = %device.display(), "Process holds device");
                holding.push(pid);
                break;
            }
        }
    }
    Ok(holding)
}

/// Sends SIGKILL. A process that is already gone counts as killed.
pub fn kill(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: kill(2) takes plain integers and has no memory effects.
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
