//! # Hardware sync channel
//!
//! The modem driver exposes one control node per subsystem speaking a small
//! ioctl protocol (magic `'M'`): read/write region locks, load-table
//! get/set, active-region selection, the shared-memory "remote flag"
//! handshake, and start/stop/assert plus external-modem power commands.
//!
//! [`HwSync`] is the seam the load orchestrator programs against;
//! [`IoctlChannel`] is the real implementation. Each command opens the node,
//! issues one ioctl and closes it again, matching how the driver expects to
//! be used by independent callers.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use bitflags::bitflags;

pub const MAX_REGIONS: usize = 20;
pub const REGION_NAME_LEN: usize = 20;

bitflags! {
    /// Shared-memory handshake bits between host and modem firmware.
    ///
    /// Several bits are reused by different stages: bit 0 is DDR-ready
    /// during SPL, then the PCIe BAR/rescan handshake after the modem head.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RemoteFlags: u32 {
        const DDR_READY = 1 << 0;
        const EP_SET_BAR_DONE = 1 << 0;
        const EP_RESCAN_DONE = 1 << 0;
        const MODEM_IMAGE_DONE = 1 << 1;
        const WARM_RESET = 1 << 1;
        const UBOOT_DONE = 1 << 2;
        const BOOT_DONE = 1 << 3;
        const HEAD_DONE = 1 << 4;
        const SPL_DONE = 1 << 5;
    }
}

// ─── Wire structs ───────────────────────────────────────────────────────────

/// One region as the driver sees it.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    pub address: u64,
    pub size: u32,
    pub name: [u8; REGION_NAME_LEN + 1],
}

impl Default for RegionInfo {
    fn default() -> Self {
        Self {
            address: 0,
            size: 0,
            name: [0; REGION_NAME_LEN + 1],
        }
    }
}

impl RegionInfo {
    pub fn new(name: &str, address: u64, size: u32) -> Self {
        let mut out = Self {
            address,
            size,
            ..Self::default()
        };
        let n = name.len().min(REGION_NAME_LEN);
        out.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        out
    }

    pub fn name(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Load table pushed to (or read back from) the driver.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemLoadInfo {
    pub region_cnt: u32,
    pub modem_base: u64,
    pub modem_size: u32,
    pub all_base: u64,
    pub all_size: u32,
    pub regions: [RegionInfo; MAX_REGIONS],
}

impl ModemLoadInfo {
    pub fn regions(&self) -> &[RegionInfo] {
        let n = (self.region_cnt as usize).min(MAX_REGIONS);
        &self.regions[..n]
    }
}

// ─── Request numbers ────────────────────────────────────────────────────────

const IOC_NONE: u32 = 0;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const MAGIC: u32 = b'M' as u32;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (MAGIC << 8) | nr
}

const INT: usize = std::mem::size_of::<libc::c_int>();
const LOAD_INFO: usize = std::mem::size_of::<ModemLoadInfo>();

pub const READ_LOCK: u32 = ioc(IOC_NONE, 0x1, 0);
pub const READ_UNLOCK: u32 = ioc(IOC_NONE, 0x2, 0);
pub const WRITE_LOCK: u32 = ioc(IOC_NONE, 0x3, 0);
pub const WRITE_UNLOCK: u32 = ioc(IOC_NONE, 0x4, 0);
pub const GET_LOAD_INFO: u32 = ioc(IOC_READ, 0x5, LOAD_INFO);
pub const SET_LOAD_INFO: u32 = ioc(IOC_WRITE, 0x6, LOAD_INFO);
pub const SET_READ_REGION: u32 = ioc(IOC_READ, 0x7, INT);
pub const SET_WRITE_REGION: u32 = ioc(IOC_WRITE, 0x8, INT);
pub const GET_REMOTE_FLAG: u32 = ioc(IOC_READ, 0x9, INT);
pub const SET_REMOTE_FLAG: u32 = ioc(IOC_WRITE, 0xa, INT);
pub const CLR_REMOTE_FLAG: u32 = ioc(IOC_WRITE, 0xb, INT);
pub const STOP: u32 = ioc(IOC_NONE, 0xc, 0);
pub const START: u32 = ioc(IOC_NONE, 0xd, 0);
pub const ASSERT: u32 = ioc(IOC_NONE, 0xe, 0);
pub const REBOOT_EXT: u32 = ioc(IOC_NONE, 0xf, 0);
pub const POWERON_EXT: u32 = ioc(IOC_NONE, 0x10, 0);
pub const POWEROFF_EXT: u32 = ioc(IOC_NONE, 0x11, 0);

// ─── Trait ──────────────────────────────────────────────────────────────────

/// Driver control protocol for one subsystem.
pub trait HwSync: Send + Sync {
    fn lock_read(&self) -> io::Result<()>;
    fn unlock_read(&self) -> io::Result<()>;
    fn lock_write(&self) -> io::Result<()>;
    fn unlock_write(&self) -> io::Result<()>;
    fn load_info(&self) -> io::Result<ModemLoadInfo>;
    fn set_load_info(&self, info: &ModemLoadInfo) -> io::Result<()>;
    fn set_read_region(&self, index: usize) -> io::Result<()>;
    fn set_write_region(&self, index: usize) -> io::Result<()>;
    fn remote_flags(&self) -> io::Result<RemoteFlags>;
    /// Writing an empty set resets the whole flag word.
    fn set_remote_flags(&self, flags: RemoteFlags) -> io::Result<()>;
    fn clear_remote_flags(&self, flags: RemoteFlags) -> io::Result<()>;
    fn stop(&self) -> io::Result<()>;
    fn start(&self) -> io::Result<()>;
    fn assert_modem(&self) -> io::Result<()>;
    fn reboot_external(&self) -> io::Result<()>;
    fn power_on_external(&self) -> io::Result<()>;
    fn power_off_external(&self) -> io::Result<()>;
    /// Node that region I/O is routed through.
    fn path(&self) -> &Path;
}

// ─── ioctl implementation ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct IoctlChannel {
    path: PathBuf,
}

impl IoctlChannel {
    /// Probe the control node. Returns `None` when it cannot be opened,
    /// which marks the subsystem as file-driven rather than ioctl-driven.
    pub fn probe(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(_) => Some(Self { path }),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no ioctl control node");
                None
            }
        }
    }

    fn command<T>(&self, request: u32, arg: *mut T) -> io::Result<()> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        // SAFETY: the descriptor is open for the duration of the call and
        // `arg` is either null or points at a live value of the type the
        // request number encodes.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(path = %self.path.display(), request, error = %err, "modem ioctl failed");
            return Err(err);
        }
        Ok(())
    }

    fn bare(&self, request: u32) -> io::Result<()> {
        self.command::<libc::c_int>(request, std::ptr::null_mut())
    }

    fn with_int(&self, request: u32, value: libc::c_int) -> io::Result<libc::c_int> {
        let mut param = value;
        self.command(request, &mut param)?;
        Ok(param)
    }
}

impl HwSync for IoctlChannel {
    fn lock_read(&self) -> io::Result<()> {
        self.bare(READ_LOCK)
    }

    fn unlock_read(&self) -> io::Result<()> {
        self.bare(READ_UNLOCK)
    }

    fn lock_write(&self) -> io::Result<()> {
        self.bare(WRITE_LOCK)
    }

    fn unlock_write(&self) -> io::Result<()> {
        self.bare(WRITE_UNLOCK)
    }

    fn load_info(&self) -> io::Result<ModemLoadInfo> {
        let mut info = ModemLoadInfo::default();
        self.command(GET_LOAD_INFO, &mut info)?;
        Ok(info)
    }

    fn set_load_info(&self, info: &ModemLoadInfo) -> io::Result<()> {
        let mut copy = *info;
        tracing::debug!(path = %self.path.display(), regions = copy.region_cnt, "set load info");
        self.command(SET_LOAD_INFO, &mut copy)
    }

    fn set_read_region(&self, index: usize) -> io::Result<()> {
        self.with_int(SET_READ_REGION, index as libc::c_int).map(|_| ())
    }

    fn set_write_region(&self, index: usize) -> io::Result<()> {
        self.with_int(SET_WRITE_REGION, index as libc::c_int).map(|_| ())
    }

    fn remote_flags(&self) -> io::Result<RemoteFlags> {
        let raw = self.with_int(GET_REMOTE_FLAG, -1)?;
        Ok(RemoteFlags::from_bits_retain(raw as u32))
    }

    fn set_remote_flags(&self, flags: RemoteFlags) -> io::Result<()> {
        tracing::debug!(flags = flags.bits(), "set remote flag");
        self.with_int(SET_REMOTE_FLAG, flags.bits() as libc::c_int).map(|_| ())
    }

    fn clear_remote_flags(&self, flags: RemoteFlags) -> io::Result<()> {
        tracing::debug!(flags = flags.bits(), "clear remote flag");
        self.with_int(CLR_REMOTE_FLAG, flags.bits() as libc::c_int).map(|_| ())
    }

    fn stop(&self) -> io::Result<()> {
        self.with_int(STOP, 0).map(|_| ())
    }

    fn start(&self) -> io::Result<()> {
        self.with_int(START, 0).map(|_| ())
    }

    fn assert_modem(&self) -> io::Result<()> {
        self.with_int(ASSERT, 0).map(|_| ())
    }

    fn reboot_external(&self) -> io::Result<()> {
        self.bare(REBOOT_EXT)
    }

    fn power_on_external(&self) -> io::Result<()> {
        self.bare(POWERON_EXT)
    }

    fn power_off_external(&self) -> io::Result<()> {
        self.bare(POWEROFF_EXT)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_numbers_match_driver_encoding() {
        assert_eq!(READ_LOCK, 0x4d01);
        assert_eq!(STOP, 0x4d0c);
        assert_eq!(POWEROFF_EXT, 0x4d11);
        assert_eq!(SET_WRITE_REGION, 0x4004_4d08);
        assert_eq!(GET_REMOTE_FLAG, 0x8004_4d09);
    }

    #[test]
    fn load_info_has_c_layout() {
        assert_eq!(std::mem::size_of::<RegionInfo>(), 40);
        assert_eq!(std::mem::size_of::<ModemLoadInfo>(), 40 + MAX_REGIONS * 40);
    }

    #[test]
    fn region_name_is_truncated_and_nul_terminated() {
        let r = RegionInfo::new("a-very-long-region-name-indeed", 0x8000_0000, 0x1000);
        assert_eq!(r.name().len(), REGION_NAME_LEN);
        assert_eq!(r.name[REGION_NAME_LEN], 0);
        assert_eq!(RegionInfo::new("modem", 0, 0).name(), "modem");
    }

    #[test]
    fn shared_bits_alias() {
        assert_eq!(RemoteFlags::DDR_READY, RemoteFlags::EP_SET_BAR_DONE);
        assert_eq!(RemoteFlags::MODEM_IMAGE_DONE, RemoteFlags::WARM_RESET);
        assert_eq!((RemoteFlags::SPL_DONE | RemoteFlags::WARM_RESET).bits(), 0x22);
    }

    #[test]
    fn probe_missing_node_is_none() {
        assert!(IoctlChannel::probe("/nonexistent/modem_ctrl").is_none());
    }
}
