//! Kernel command line inspection.
//!
//! The bootloader tells us three things through `/proc/cmdline`: which boot
//! mode we are in, whether the modem should be powered by us (`modem=`), and
//! the parameter string the CP firmware expects to find in its own cmdline
//! region.

use std::fs;
use std::io;
use std::path::Path;

/// Largest cmdline we read, and the size of the CP cmdline region.
pub const CMDLINE_MAX: usize = 0x1000;

const MODEM_KEY: &str = "modem=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootMode {
    #[default]
    Normal,
    Calibration,
    Factory,
    Recovery,
}

impl BootMode {
    /// Later markers win: a recovery boot that also carries a calibration
    /// marker is still recovery.
    pub fn detect(cmdline: &str) -> Self {
        let mut mode = BootMode::Normal;
        if cmdline.contains("calibration=") || cmdline.contains("androidboot.mode=cali") {
            mode = BootMode::Calibration;
        }
        if cmdline.contains("=factorytest") {
            mode = BootMode::Factory;
        }
        if cmdline.contains("androidboot.mode=recovery") {
            mode = BootMode::Recovery;
        }
        mode
    }
}

/// Read the kernel command line, truncated to [`CMDLINE_MAX`] - 1 bytes.
pub fn read(path: &Path) -> io::Result<String> {
    let mut raw = fs::read(path)?;
    raw.truncate(CMDLINE_MAX - 1);
    Ok(String::from_utf8_lossy(&raw).trim_end_matches(['\n', '\0']).to_string())
}

/// Value of the `modem=` parameter, up to the next space.
pub fn modem_param(cmdline: &str) -> Option<&str> {
    let start = cmdline.find(MODEM_KEY)? + MODEM_KEY.len();
    let rest = &cmdline[start..];
    Some(rest.split(' ').next().unwrap_or(rest))
}

/// Parameters handed to the CP: everything after the `modem=` token. When
/// the token is absent the whole line is passed through.
pub fn cp_params(cmdline: &str) -> &str {
    match cmdline.find(MODEM_KEY) {
        Some(pos) => match cmdline[pos..].find(' ') {
            Some(space) => &cmdline[pos + space + 1..],
            None => "",
        },
        None => cmdline,
    }
}

/// Bytes written to the CP cmdline region: the parameters plus a NUL.
pub fn cp_region_bytes(cmdline: &str) -> Vec<u8> {
    let params = cp_params(cmdline);
    let mut out = Vec::with_capacity(params.len() + 1);
    out.extend_from_slice(params.as_bytes());
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Boot mode ──────────────────────────────────────────────────────────

    #[test]
    fn normal_when_no_marker() {
        assert_eq!(BootMode::detect("console=ttyS1 modem=shutdown"), BootMode::Normal);
    }

    #[test]
    fn calibration_markers() {
        assert_eq!(BootMode::detect("calibration=1,2"), BootMode::Calibration);
        assert_eq!(BootMode::detect("androidboot.mode=cali"), BootMode::Calibration);
    }

    #[test]
    fn recovery_overrides_earlier_markers() {
        assert_eq!(
            BootMode::detect("androidboot.mode=factorytest androidboot.mode=recovery"),
            BootMode::Recovery
        );
        assert_eq!(BootMode::detect("x=factorytest"), BootMode::Factory);
    }

    // ─── modem= parameter ───────────────────────────────────────────────────

    #[test]
    fn modem_param_stops_at_space() {
        assert_eq!(modem_param("a=1 modem=shutdown b=2"), Some("shutdown"));
        assert_eq!(modem_param("a=1 modem=shutdown"), Some("shutdown"));
        assert_eq!(modem_param("a=1"), None);
    }

    #[test]
    fn cp_params_strip_through_modem_token() {
        assert_eq!(cp_params("console=x modem=shutdown lte=1 nr=0"), "lte=1 nr=0");
        assert_eq!(cp_params("console=x"), "console=x");
        assert_eq!(cp_params("console=x modem=shutdown"), "");
    }

    #[test]
    fn region_bytes_are_nul_terminated() {
        assert_eq!(cp_region_bytes("modem=on a=b"), b"a=b\0".to_vec());
    }

    #[test]
    fn read_truncates_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmdline");
        std::fs::write(&path, "modem=shutdown\n").unwrap();
        assert_eq!(read(&path).unwrap(), "modem=shutdown");

        std::fs::write(&path, "x".repeat(CMDLINE_MAX * 2)).unwrap();
        assert_eq!(read(&path).unwrap().len(), CMDLINE_MAX - 1);
    }
}
