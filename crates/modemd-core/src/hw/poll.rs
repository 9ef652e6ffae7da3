//! Readiness waits over raw descriptors.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

const READY: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

/// Block until at least one of `fds` is readable (or hung up), or until
/// `timeout` passes. `None` waits forever. Returns one flag per input fd;
/// all false on timeout. Interrupted waits are retried.
pub fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms: libc::c_int = match timeout {
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    loop {
        // SAFETY: `pfds` is a live, correctly sized pollfd array.
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    Ok(pfds.iter().map(|p| p.revents & READY != 0).collect())
}

/// Single-descriptor convenience wrapper.
pub fn readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<bool> {
    Ok(wait_readable(&[fd], timeout)?.first().copied().unwrap_or(false))
}
