//! Kernel uevent socket (`NETLINK_KOBJECT_UEVENT`).

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{EventBus, UEVENT_MSG_LEN};
use crate::hw::poll;

/// Receive buffer requested for the socket.
pub const RCVBUF_SIZE: usize = 256 * 1024;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct UeventSocket {
    fd: OwnedFd,
}

fn set_int_opt(fd: RawFd, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl UeventSocket {
    /// Open and bind to every uevent multicast group.
    pub fn open(rcvbuf: usize) -> io::Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked before use.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                libc::NETLINK_KOBJECT_UEVENT,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let size = libc::c_int::try_from(rcvbuf).unwrap_or(libc::c_int::MAX);
        // FORCE needs CAP_NET_ADMIN; fall back to the capped variant.
        if let Err(e) = set_int_opt(fd.as_raw_fd(), libc::SO_RCVBUFFORCE, size) {
            tracing::debug!(error = %e, "SO_RCVBUFFORCE refused");
            set_int_opt(fd.as_raw_fd(), libc::SO_RCVBUF, size)?;
        }

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = 0xffff_ffff;
        // SAFETY: `addr` is a valid sockaddr_nl and the length matches it.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!(rcvbuf, "uevent socket bound");
        Ok(Self { fd })
    }

    /// Receive one datagram. `Ok(None)` for messages not sent by the kernel.
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        // SAFETY: as above.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        loop {
            // SAFETY: `buf` and `addr` are valid for writes of the given sizes.
            let n = unsafe {
                libc::recvfrom(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut addr as *mut libc::sockaddr_nl as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if addr.nl_pid != 0 {
                tracing::debug!(pid = addr.nl_pid, "uevent from userspace ignored");
                return Ok(None);
            }
            return Ok(Some(n as usize));
        }
    }
}

impl AsRawFd for UeventSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Spawn the receive loop feeding `bus`.
pub fn spawn_receiver(bus: Arc<EventBus>, socket: UeventSocket) -> io::Result<()> {
    thread::Builder::new()
        .name("uevent-recv".into())
        .spawn(move || receive_loop(&bus, &socket))
        .map_err(io::Error::other)?;
    Ok(())
}

fn receive_loop(bus: &EventBus, socket: &UeventSocket) {
    // Two spare bytes so an overlong record is still seen as overlong.
    let mut buf = vec![0u8; UEVENT_MSG_LEN + 2];
    loop {
        match poll::readable(socket.as_raw_fd(), None) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "uevent poll");
                thread::sleep(ERROR_BACKOFF);
                continue;
            }
        }
        match socket.recv(&mut buf) {
            Ok(Some(n)) if n > 0 => {
                bus.receive(&buf[..n]);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "uevent recv");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}
