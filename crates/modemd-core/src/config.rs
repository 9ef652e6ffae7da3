//! Daemon configuration.
//!
//! The on-disk format is TOML. Every field is optional: missing values fall
//! back to the platform defaults the daemon has always used, so an empty
//! file (or no file at all) yields a working configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::load::partition::{FlagBitmask, PartitionEntry};

pub const DEFAULT_SOCKET: &str = "@modemd";
pub const DEFAULT_MAX_CLIENTS: usize = 20;
pub const DEFAULT_EVENT_HANDLERS: usize = 10;

/// How the primary modem is attached to the application processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModemTopology {
    /// Baseband shares the SoC; recovery reloads images in software.
    #[default]
    Internal,
    /// Discrete modem (mini-AP + CP); recovery reboots the companion chip.
    External,
}

impl ModemTopology {
    pub fn is_external(self) -> bool {
        matches!(self, ModemTopology::External)
    }
}

impl std::str::FromStr for ModemTopology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(ModemTopology::Internal),
            "external" => Ok(ModemTopology::External),
            other => Err(format!("unknown topology {other:?}")),
        }
    }
}

// ─── Input (serde) ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonConfigInput {
    pub daemon: DaemonSectionInput,
    pub timings: TimingsInput,
    pub paths: PathsInput,
    pub properties: HashMap<String, String>,
    pub tables: TablesInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DaemonSectionInput {
    pub socket: Option<String>,
    pub max_clients: Option<usize>,
    pub topology: Option<ModemTopology>,
    pub pcie: Option<bool>,
    pub event_handler_capacity: Option<usize>,
    pub event_workers: Option<usize>,
    pub event_queue: Option<usize>,
    pub secure_boot: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimingsInput {
    pub alive_timeout_ms: Option<u64>,
    pub alive_settle_ms: Option<u64>,
    pub reboot_settle_ms: Option<u64>,
    pub dump_wait_ms: Option<u64>,
    pub reset_wait_ms: Option<u64>,
    pub reset_poll_ms: Option<u64>,
    pub blocked_dump_settle_ms: Option<u64>,
    pub remote_flag_timeout_ms: Option<u64>,
    pub remote_flag_poll_ms: Option<u64>,
    pub open_fast_retry_ms: Option<u64>,
    pub open_fast_window_ms: Option<u64>,
    pub open_slow_retry_ms: Option<u64>,
    pub read_error_backoff_ms: Option<u64>,
    pub imei_timeout_ms: Option<u64>,
    pub log_drain_idle_ms: Option<u64>,
    pub loopback_settle_ms: Option<u64>,
    pub sp_open_attempts: Option<u32>,
    pub sp_open_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsInput {
    pub cmdline: Option<PathBuf>,
    pub sysrq_trigger: Option<PathBuf>,
    pub wake_lock: Option<PathBuf>,
    pub wake_unlock: Option<PathBuf>,
    pub cptl_dir: Option<PathBuf>,
    pub pmic_dir: Option<PathBuf>,
    pub sp_monitor: Option<PathBuf>,
    pub busmonitor: Option<PathBuf>,
    pub dmc_mpu: Option<PathBuf>,
    pub imei_tty: Option<PathBuf>,
    pub sp_cali_image: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TablesInput {
    pub cp: Option<TableInput>,
    pub sp: Option<TableInput>,
    pub dp: Option<TableInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TableInput {
    pub start_path: Option<PathBuf>,
    pub stop_path: Option<PathBuf>,
    pub ioctl_path: Option<PathBuf>,
    pub entries: Vec<EntryInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EntryInput {
    pub name: String,
    pub read_path: PathBuf,
    pub write_path: PathBuf,
    pub address: u64,
    pub size: u64,
    pub flags: u32,
}

// ─── Resolved ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    pub socket: String,
    pub max_clients: usize,
    pub topology: ModemTopology,
    pub pcie: bool,
    pub event_handler_capacity: usize,
    pub event_workers: usize,
    pub event_queue: usize,
    pub secure_boot: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            socket: DEFAULT_SOCKET.to_string(),
            max_clients: DEFAULT_MAX_CLIENTS,
            topology: ModemTopology::Internal,
            pcie: false,
            event_handler_capacity: DEFAULT_EVENT_HANDLERS,
            event_workers: 4,
            event_queue: 64,
            secure_boot: false,
        }
    }
}

/// Every delay and bound the daemon waits on.
#[derive(Debug, Clone)]
pub struct Timings {
    pub alive_timeout: Duration,
    pub alive_settle: Duration,
    pub reboot_settle: Duration,
    pub dump_wait: Duration,
    pub reset_wait: Duration,
    pub reset_poll: Duration,
    pub blocked_dump_settle: Duration,
    pub remote_flag_timeout: Duration,
    pub remote_flag_poll: Duration,
    pub open_fast_retry: Duration,
    pub open_fast_window: Duration,
    pub open_slow_retry: Duration,
    pub read_error_backoff: Duration,
    pub imei_timeout: Duration,
    pub log_drain_idle: Duration,
    pub loopback_settle: Duration,
    pub sp_open_attempts: u32,
    pub sp_open_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            alive_timeout: Duration::from_secs(60),
            alive_settle: Duration::from_secs(6),
            reboot_settle: Duration::from_secs(5),
            dump_wait: Duration::from_secs(300),
            reset_wait: Duration::from_secs(5),
            reset_poll: Duration::from_millis(100),
            blocked_dump_settle: Duration::from_secs(5),
            remote_flag_timeout: Duration::from_secs(10),
            remote_flag_poll: Duration::from_millis(100),
            open_fast_retry: Duration::from_millis(100),
            open_fast_window: Duration::from_secs(60),
            open_slow_retry: Duration::from_secs(1),
            read_error_backoff: Duration::from_secs(1),
            imei_timeout: Duration::from_secs(3),
            log_drain_idle: Duration::from_secs(1),
            loopback_settle: Duration::from_millis(100),
            sp_open_attempts: 60,
            sp_open_interval: Duration::from_secs(1),
        }
    }
}

impl Timings {
    /// All waits collapsed to zero, for tests that drive the state machine
    /// synchronously.
    pub fn immediate() -> Self {
        Self {
            alive_timeout: Duration::from_millis(50),
            alive_settle: Duration::ZERO,
            reboot_settle: Duration::ZERO,
            dump_wait: Duration::from_millis(200),
            reset_wait: Duration::from_millis(20),
            reset_poll: Duration::from_millis(5),
            blocked_dump_settle: Duration::ZERO,
            remote_flag_timeout: Duration::from_millis(30),
            remote_flag_poll: Duration::from_millis(5),
            open_fast_retry: Duration::from_millis(1),
            open_fast_window: Duration::from_millis(5),
            open_slow_retry: Duration::from_millis(5),
            read_error_backoff: Duration::from_millis(1),
            imei_timeout: Duration::from_millis(50),
            log_drain_idle: Duration::from_millis(5),
            loopback_settle: Duration::ZERO,
            sp_open_attempts: 2,
            sp_open_interval: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Paths {
    pub cmdline: PathBuf,
    pub sysrq_trigger: PathBuf,
    pub wake_lock: PathBuf,
    pub wake_unlock: PathBuf,
    pub cptl_dir: PathBuf,
    pub pmic_dir: PathBuf,
    pub sp_monitor: PathBuf,
    pub busmonitor: PathBuf,
    pub dmc_mpu: PathBuf,
    pub imei_tty: PathBuf,
    pub sp_cali_image: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            cmdline: PathBuf::from("/proc/cmdline"),
            sysrq_trigger: PathBuf::from("/proc/sysrq-trigger"),
            wake_lock: PathBuf::from("/sys/power/wake_lock"),
            wake_unlock: PathBuf::from("/sys/power/wake_unlock"),
            cptl_dir: PathBuf::from("/proc/cptl"),
            pmic_dir: PathBuf::from("/proc/pmic"),
            sp_monitor: PathBuf::from("/dev/sctl_pm"),
            busmonitor: PathBuf::from("/dev/sprd_bm"),
            dmc_mpu: PathBuf::from("/dev/dmc_mpu"),
            imei_tty: PathBuf::from("/dev/stty_lte2"),
            sp_cali_image: PathBuf::from("/vendor/firmware/EXEC_CALIBRATE_MAG_IMAGE"),
        }
    }
}

/// A partition table supplied by configuration instead of board probing.
#[derive(Debug, Clone, Default)]
pub struct TableOverride {
    pub start_path: Option<PathBuf>,
    pub stop_path: Option<PathBuf>,
    pub ioctl_path: Option<PathBuf>,
    pub entries: Vec<PartitionEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct TableOverrides {
    pub cp: Option<TableOverride>,
    pub sp: Option<TableOverride>,
    pub dp: Option<TableOverride>,
}

#[derive(Debug, Clone, Default)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub timings: Timings,
    pub paths: Paths,
    pub properties: HashMap<String, String>,
    pub tables: TableOverrides,
}

fn ms(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl TimingsInput {
    fn resolve(self) -> Timings {
        let d = Timings::default();
        Timings {
            alive_timeout: ms(self.alive_timeout_ms, d.alive_timeout),
            alive_settle: ms(self.alive_settle_ms, d.alive_settle),
            reboot_settle: ms(self.reboot_settle_ms, d.reboot_settle),
            dump_wait: ms(self.dump_wait_ms, d.dump_wait),
            reset_wait: ms(self.reset_wait_ms, d.reset_wait),
            reset_poll: ms(self.reset_poll_ms, d.reset_poll),
            blocked_dump_settle: ms(self.blocked_dump_settle_ms, d.blocked_dump_settle),
            remote_flag_timeout: ms(self.remote_flag_timeout_ms, d.remote_flag_timeout),
            remote_flag_poll: ms(self.remote_flag_poll_ms, d.remote_flag_poll),
            open_fast_retry: ms(self.open_fast_retry_ms, d.open_fast_retry),
            open_fast_window: ms(self.open_fast_window_ms, d.open_fast_window),
            open_slow_retry: ms(self.open_slow_retry_ms, d.open_slow_retry),
            read_error_backoff: ms(self.read_error_backoff_ms, d.read_error_backoff),
            imei_timeout: ms(self.imei_timeout_ms, d.imei_timeout),
            log_drain_idle: ms(self.log_drain_idle_ms, d.log_drain_idle),
            loopback_settle: ms(self.loopback_settle_ms, d.loopback_settle),
            sp_open_attempts: self.sp_open_attempts.unwrap_or(d.sp_open_attempts),
            sp_open_interval: ms(self.sp_open_interval_ms, d.sp_open_interval),
        }
    }
}

impl PathsInput {
    fn resolve(self) -> Paths {
        let d = Paths::default();
        Paths {
            cmdline: self.cmdline.unwrap_or(d.cmdline),
            sysrq_trigger: self.sysrq_trigger.unwrap_or(d.sysrq_trigger),
            wake_lock: self.wake_lock.unwrap_or(d.wake_lock),
            wake_unlock: self.wake_unlock.unwrap_or(d.wake_unlock),
            cptl_dir: self.cptl_dir.unwrap_or(d.cptl_dir),
            pmic_dir: self.pmic_dir.unwrap_or(d.pmic_dir),
            sp_monitor: self.sp_monitor.unwrap_or(d.sp_monitor),
            busmonitor: self.busmonitor.unwrap_or(d.busmonitor),
            dmc_mpu: self.dmc_mpu.unwrap_or(d.dmc_mpu),
            imei_tty: self.imei_tty.unwrap_or(d.imei_tty),
            sp_cali_image: self.sp_cali_image.unwrap_or(d.sp_cali_image),
        }
    }
}

impl TableInput {
    fn resolve(self, which: &str) -> Result<TableOverride, String> {
        let mut entries = Vec::with_capacity(self.entries.len());
        for (idx, e) in self.entries.into_iter().enumerate() {
            let name = e.name.trim().to_string();
            if name.is_empty() {
                return Err(format!("tables.{which}.entries[{idx}] has no name"));
            }
            entries.push(PartitionEntry {
                name,
                read_path: e.read_path,
                write_path: e.write_path,
                address: e.address,
                size: e.size,
                flags: FlagBitmask::from_bits_retain(e.flags),
            });
        }
        Ok(TableOverride {
            start_path: self.start_path,
            stop_path: self.stop_path,
            ioctl_path: self.ioctl_path,
            entries,
        })
    }
}

impl DaemonConfigInput {
    pub fn resolve(self) -> Result<DaemonConfig, String> {
        let d = DaemonSettings::default();
        let socket = self
            .daemon
            .socket
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(d.socket);
        if socket == "@" {
            return Err("daemon.socket: abstract name is empty".into());
        }
        let max_clients = self.daemon.max_clients.unwrap_or(d.max_clients);
        if max_clients == 0 {
            return Err("daemon.max_clients must be at least 1".into());
        }
        let event_handler_capacity = self
            .daemon
            .event_handler_capacity
            .unwrap_or(d.event_handler_capacity)
            .max(1);

        let daemon = DaemonSettings {
            socket,
            max_clients,
            topology: self.daemon.topology.unwrap_or(d.topology),
            pcie: self.daemon.pcie.unwrap_or(d.pcie),
            event_handler_capacity,
            event_workers: self.daemon.event_workers.unwrap_or(d.event_workers).max(1),
            event_queue: self.daemon.event_queue.unwrap_or(d.event_queue).max(1),
            secure_boot: self.daemon.secure_boot.unwrap_or(d.secure_boot),
        };

        let tables = TableOverrides {
            cp: self.tables.cp.map(|t| t.resolve("cp")).transpose()?,
            sp: self.tables.sp.map(|t| t.resolve("sp")).transpose()?,
            dp: self.tables.dp.map(|t| t.resolve("dp")).transpose()?,
        };

        Ok(DaemonConfig {
            daemon,
            timings: self.timings.resolve(),
            paths: self.paths.resolve(),
            properties: self.properties,
            tables,
        })
    }
}

impl DaemonConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(DaemonConfig::default());
        }
        let parsed: DaemonConfigInput = toml::from_str(input)?;
        parsed.resolve().map_err(ConfigError::Invalid)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_uses_defaults() {
        let cfg = DaemonConfig::from_toml_str("").unwrap();
        assert_eq!(cfg.daemon.socket, DEFAULT_SOCKET);
        assert_eq!(cfg.daemon.max_clients, 20);
        assert_eq!(cfg.timings.alive_timeout, Duration::from_secs(60));
        assert_eq!(cfg.timings.dump_wait, Duration::from_secs(300));
        assert!(cfg.tables.cp.is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = DaemonConfig::from_toml_str(
            r#"
            [daemon]
            socket = "/run/modemd.sock"
            topology = "external"
            pcie = true
            event_handler_capacity = 32

            [timings]
            alive_timeout_ms = 1500

            [properties]
            "persist.vendor.sys.modemreset" = "1"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.daemon.socket, "/run/modemd.sock");
        assert_eq!(cfg.daemon.topology, ModemTopology::External);
        assert!(cfg.daemon.pcie);
        assert_eq!(cfg.daemon.event_handler_capacity, 32);
        assert_eq!(cfg.timings.alive_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.timings.alive_settle, Duration::from_secs(6));
        assert_eq!(
            cfg.properties.get("persist.vendor.sys.modemreset").map(String::as_str),
            Some("1")
        );
    }

    #[test]
    fn table_override_parses_entries() {
        let cfg = DaemonConfig::from_toml_str(
            r#"
            [tables.cp]
            start_path = "/proc/cptl/start"

            [[tables.cp.entries]]
            name = "modem"
            read_path = "/dev/block/l_modem"
            write_path = "/proc/cptl/modem"
            size = 0x1400000
            flags = 0x201
            "#,
        )
        .unwrap();
        let cp = cfg.tables.cp.expect("cp override");
        assert_eq!(cp.entries.len(), 1);
        assert_eq!(cp.entries[0].size, 0x140_0000);
        assert!(cp.entries[0].flags.contains(FlagBitmask::SECURE | FlagBitmask::MODEM));
    }

    #[test]
    fn zero_clients_rejected() {
        let err = DaemonConfig::from_toml_str("[daemon]\nmax_clients = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unnamed_entry_rejected() {
        let err = DaemonConfig::from_toml_str("[[tables.sp.entries]]\nsize = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn topology_from_str() {
        assert_eq!("External".parse::<ModemTopology>(), Ok(ModemTopology::External));
        assert!("pcie".parse::<ModemTopology>().is_err());
    }
}
