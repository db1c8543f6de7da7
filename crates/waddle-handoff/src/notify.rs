//! Parent notification.
//!
//! A restarted child calls [`notify_parent`] once it is serving on the
//! inherited listener. The parent's control loop sees `SIGTERM` and returns.

use std::io;

use tracing::{info, warn};

use crate::error::{HandoffError, Result};

/// Send `SIGTERM` to `pid`, asking it to stop serving.
///
/// Pids that do not name a single process (0, or values that overflow into
/// negative `pid_t`s and would address process groups) are rejected without
/// sending anything.
pub fn notify_parent(pid: u32) -> Result<()> {
    let target = libc::pid_t::try_from(pid)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| HandoffError::DeliveryError {
            pid,
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a single-process pid"),
        })?;

    if unsafe { libc::kill(target, libc::SIGTERM) } != 0 {
        let source = io::Error::last_os_error();
        warn!(pid, error = %source, "Failed to signal parent process");
        return Err(HandoffError::DeliveryError { pid, source });
    }

    info!(pid, "Sent SIGTERM to parent process");
    Ok(())
}
