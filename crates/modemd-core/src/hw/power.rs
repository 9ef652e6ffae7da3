//! Scoped platform resources held around modem I/O.
//!
//! [`WakeLock`] keeps the application processor awake while a monitor read
//! or a load pass is in flight. [`DebugInterrupts`] silences the bus monitor
//! and DMC-MPU debug interrupts while image bytes are being copied into
//! shared memory. Both hand out guards that undo the action on drop.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const WAKE_LOCK_NAME: &[u8] = b"modem_control";

// ─── Wake lock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WakeLock {
    lock_path: PathBuf,
    unlock_path: PathBuf,
}

impl WakeLock {
    pub fn new(lock_path: impl Into<PathBuf>, unlock_path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: lock_path.into(),
            unlock_path: unlock_path.into(),
        }
    }

    /// Acquire the lock until the returned guard is dropped. Failures are
    /// logged and otherwise ignored: losing a wake lock only risks suspend.
    pub fn acquire(&self, reason: &'static str) -> WakeGuard<'_> {
        tracing::trace!(reason, "wake lock");
        if let Err(e) = write_token(&self.lock_path) {
            tracing::warn!(path = %self.lock_path.display(), error = %e, reason, "wake lock failed");
        }
        WakeGuard { lock: self, reason }
    }
}

pub struct WakeGuard<'a> {
    lock: &'a WakeLock,
    reason: &'static str,
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        tracing::trace!(reason = self.reason, "wake unlock");
        if let Err(e) = write_token(&self.lock.unlock_path) {
            tracing::warn!(
                path = %self.lock.unlock_path.display(),
                error = %e,
                reason = self.reason,
                "wake unlock failed"
            );
        }
    }
}

fn write_token(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .open(path)?
        .write_all(WAKE_LOCK_NAME)
}

// ─── Debug interrupts ───────────────────────────────────────────────────────

const BM_DBG_INT_CLR: libc::c_ulong = 18;
const BM_DBG_INT_SET: libc::c_ulong = 19;

/// A debug-interrupt device that may not exist on every board. The first
/// open failure latches it off for the life of the process.
#[derive(Debug)]
struct DebugDevice {
    path: PathBuf,
    unsupported: AtomicBool,
    disable_cmd: libc::c_ulong,
    enable_cmd: libc::c_ulong,
}

impl DebugDevice {
    fn set(&self, enable: bool) {
        if self.unsupported.load(Ordering::Relaxed) {
            return;
        }
        let file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                self.unsupported.store(true, Ordering::Relaxed);
                if !matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENODEV)) {
                    tracing::warn!(path = %self.path.display(), error = %e, "debug interrupt device");
                }
                return;
            }
        };
        let cmd = if enable { self.enable_cmd } else { self.disable_cmd };
        let mut param: libc::c_int = 0;
        // SAFETY: fd is open for the duration of the call and `param` is a
        // valid out-pointer for the int-sized argument these drivers take.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), cmd as _, &mut param) };
        if rc != 0 {
            tracing::debug!(path = %self.path.display(), cmd, "debug interrupt ioctl rejected");
        }
    }
}

#[derive(Debug)]
pub struct DebugInterrupts {
    busmonitor: DebugDevice,
    dmc_mpu: DebugDevice,
}

impl DebugInterrupts {
    pub fn new(busmonitor: impl Into<PathBuf>, dmc_mpu: impl Into<PathBuf>) -> Self {
        Self {
            busmonitor: DebugDevice {
                path: busmonitor.into(),
                unsupported: AtomicBool::new(false),
                disable_cmd: BM_DBG_INT_CLR,
                enable_cmd: BM_DBG_INT_SET,
            },
            dmc_mpu: DebugDevice {
                path: dmc_mpu.into(),
                unsupported: AtomicBool::new(false),
                disable_cmd: 0,
                enable_cmd: 1,
            },
        }
    }

    /// Disable both debug interrupt sources until the guard drops.
    pub fn suspend(&self) -> DebugGuard<'_> {
        self.busmonitor.set(false);
        self.dmc_mpu.set(false);
        DebugGuard { owner: self }
    }

    pub fn is_supported(&self) -> (bool, bool) {
        (
            !self.busmonitor.unsupported.load(Ordering::Relaxed),
            !self.dmc_mpu.unsupported.load(Ordering::Relaxed),
        )
    }
}

pub struct DebugGuard<'a> {
    owner: &'a DebugInterrupts,
}

impl Drop for DebugGuard<'_> {
    fn drop(&mut self) {
        self.owner.busmonitor.set(true);
        self.owner.dmc_mpu.set(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_guard_writes_lock_then_unlock() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("wake_lock");
        let unlock = dir.path().join("wake_unlock");
        std::fs::write(&lock, "").unwrap();
        std::fs::write(&unlock, "").unwrap();

        let wl = WakeLock::new(&lock, &unlock);
        {
            let _g = wl.acquire("test");
            assert_eq!(std::fs::read(&lock).unwrap(), WAKE_LOCK_NAME);
            assert!(std::fs::read(&unlock).unwrap().is_empty());
        }
        assert_eq!(std::fs::read(&unlock).unwrap(), WAKE_LOCK_NAME);
    }

    #[test]
    fn missing_wake_lock_files_are_tolerated() {
        let wl = WakeLock::new("/nonexistent/wake_lock", "/nonexistent/wake_unlock");
        drop(wl.acquire("test"));
    }

    #[test]
    fn absent_debug_devices_latch_unsupported() {
        let di = DebugInterrupts::new("/nonexistent/bm", "/nonexistent/mpu");
        assert_eq!(di.is_supported(), (true, true));
        drop(di.suspend());
        assert_eq!(di.is_supported(), (false, false));
    }
}
