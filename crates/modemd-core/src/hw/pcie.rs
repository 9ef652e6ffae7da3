//! PCIe endpoint rescan for externally attached modems.
//!
//! After the modem head is written the endpoint re-enumerates its BARs; the
//! host has to remove the endpoint and its bridge and rescan the bus before
//! the rest of the image can be pushed. Paths are discovered once under
//! `ro.vendor.modem.ep.device.path` by matching vendor, device and class ids.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::props::PropertyStore;

pub const EP_DEVICE_PATH: &str = "ro.vendor.modem.ep.device.path";
pub const EP_VENDOR_ID: &str = "ro.vendor.modem.ep.vendor.id";
pub const EP_DEVICE_ID: &str = "ro.vendor.modem.ep.device.id";
pub const EP_CLASS_ID: &str = "ro.vendor.modem.ep.class.id";

pub trait PcieRescan: Send + Sync {
    fn rescan(&self) -> io::Result<()>;
}

/// Used on boards without a PCIe-attached modem.
#[derive(Debug, Default)]
pub struct NoRescan;

impl PcieRescan for NoRescan {
    fn rescan(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SysfsRescan {
    device_remove: PathBuf,
    bridge_remove: PathBuf,
    rescan: PathBuf,
}

fn attr_matches(dir: &Path, attr: &str, want: &str) -> bool {
    match fs::read_to_string(dir.join(attr)) {
        Ok(v) => v.trim_end_matches(['\n', '\r']) == want,
        Err(e) => {
            tracing::debug!(path = %dir.join(attr).display(), error = %e, "read pci attribute");
            false
        }
    }
}

impl SysfsRescan {
    /// Locate the endpoint and its bridge. `None` when the properties are
    /// missing or no device matches.
    pub fn discover(props: &dyn PropertyStore) -> Option<Self> {
        let base = props.get(EP_DEVICE_PATH)?;
        let vendor = props.get(EP_VENDOR_ID)?;
        let device = props.get(EP_DEVICE_ID)?;
        let class = props.get(EP_CLASS_ID)?;
        let devices = PathBuf::from(format!("{base}devices"));

        let entries: Vec<PathBuf> = match fs::read_dir(&devices) {
            Ok(rd) => rd.filter_map(Result::ok).map(|e| e.path()).collect(),
            Err(e) => {
                tracing::warn!(path = %devices.display(), error = %e, "list pci devices");
                return None;
            }
        };

        let endpoint = entries.iter().find(|dir| {
            attr_matches(dir, "vendor", &vendor)
                && attr_matches(dir, "device", &device)
                && attr_matches(dir, "class", &class)
        })?;
        let ep_name = endpoint.file_name()?;
        let bridge = entries.iter().find(|dir| dir.join(ep_name).exists())?;

        let found = Self {
            device_remove: endpoint.join("remove"),
            bridge_remove: bridge.join("remove"),
            rescan: PathBuf::from(format!("{base}rescan")),
        };
        tracing::info!(
            device = %found.device_remove.display(),
            bridge = %found.bridge_remove.display(),
            "pcie endpoint located"
        );
        Some(found)
    }
}

impl PcieRescan for SysfsRescan {
    fn rescan(&self) -> io::Result<()> {
        for path in [&self.device_remove, &self.bridge_remove, &self.rescan] {
            fs::write(path, b"1").inspect_err(|e| {
                tracing::error!(path = %path.display(), error = %e, "pcie rescan step");
            })?;
        }
        Ok(())
    }
}
