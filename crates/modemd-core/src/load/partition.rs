//! Partition tables: which named regions get loaded, from where, to where.
//!
//! Each subsystem (CP, SP, DP) owns one [`PartitionTable`]. The default
//! tables are built from board probes and system properties; configuration
//! may replace them wholesale, and the CP table is then corrected from the
//! firmware's own embedded region table (see [`super::image`]).

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;

use crate::cmdline::CMDLINE_MAX;
use crate::config::{Paths, TableOverride};
use crate::hw::sync::{HwSync, MAX_REGIONS, ModemLoadInfo, RegionInfo};
use crate::props::{self, PropertyStore};

bitflags! {
    /// Category and modifier bits carried by every partition entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlagBitmask: u32 {
        const SECURE = 1 << 0;
        const NV = 1 << 1;
        const BOOT_CODE = 1 << 2;
        const CMDLINE = 1 << 3;
        const SPL = 1 << 4;
        const SML = 1 << 5;
        const UBOOT = 1 << 6;
        const BOOT = 1 << 7;
        const MODEM_HEAD = 1 << 8;
        const MODEM = 1 << 9;
        const MODEM_DSP = 1 << 10;
        const MODEM_OTHER = 1 << 11;
        const SP = 1 << 12;
        const SP_CALI = 1 << 13;
        const AUDIO = 1 << 16;
        /// Zero the destination before writing.
        const CLEAR = 1 << 31;
    }
}

impl FlagBitmask {
    pub const SPECIAL_MASK: Self = Self::from_bits_retain(0x0000_000F);
    pub const MINIAP_MASK: Self = Self::from_bits_retain(0x0000_00F0);
    pub const MODEM_MASK: Self = Self::from_bits_retain(0x0000_0F00);
    pub const MODEM_EXCEPT_HEAD_MASK: Self = Self::from_bits_retain(0x0000_0E00);
    pub const SP_MASK: Self = Self::from_bits_retain(0x0000_F000);
    pub const AUDIO_MASK: Self = Self::from_bits_retain(0x000F_0000);
    pub const NONE: Self = Self::empty();
}

bitflags! {
    /// Which subsystems a load pass covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadTargets: u32 {
        const SP = 0x01;
        const MODEM = 0x02;
        const DP = 0x04;
        const MINIAP = 0x08;
        const AGDSP = 0x10;
    }
}

impl LoadTargets {
    pub const ALL_EXTERNAL: Self = Self::from_bits_retain(0x1E);
    pub const ALL: Self = Self::from_bits_retain(0x1F);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Cp,
    Sp,
    Dp,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::Cp => "cp",
            Subsystem::Sp => "sp",
            Subsystem::Dp => "dp",
        })
    }
}

/// Radio technology of the baseband, from `ro.vendor.radio.modemtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemType {
    Td,
    W,
    Lte,
    Nr,
    None,
}

impl ModemType {
    /// `None` when the property is absent altogether.
    pub fn from_props(props: &dyn PropertyStore) -> Option<Self> {
        let value = props.get(props::MODEM_TYPE)?;
        Some(match value.as_str() {
            "t" => ModemType::Td,
            "w" => ModemType::W,
            "l" => ModemType::Lte,
            "nr" => ModemType::Nr,
            _ => ModemType::None,
        })
    }
}

// ─── Entries and tables ─────────────────────────────────────────────────────

const MIB: u64 = 1024 * 1024;
pub const MODEM_SIZE: u64 = 20 * MIB;
pub const DELTANV_SIZE: u64 = MIB;
pub const FIXNV_SIZE: u64 = MIB;
pub const RUNNV_SIZE: u64 = 2 * MIB;
pub const TGDSP_SIZE: u64 = 5 * MIB + 64 * 1024;
pub const LDSP_SIZE: u64 = 12 * MIB;
pub const CDSP_SIZE: u64 = MIB;
pub const WARM_SIZE: u64 = 5 * MIB;
pub const PMCP_SIZE: u64 = MIB;
pub const PMCP_CALI_SIZE: u64 = 64 * 1024;

pub const MODEM_BANK: &str = "modem";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionEntry {
    pub name: String,
    pub read_path: PathBuf,
    pub write_path: PathBuf,
    pub address: u64,
    /// Zero means "not present on this board"; such entries are never
    /// opened.
    pub size: u64,
    pub flags: FlagBitmask,
}

impl PartitionEntry {
    fn new(name: &str, read_path: PathBuf, write_path: PathBuf, size: u64, flags: FlagBitmask) -> Self {
        Self {
            name: name.to_string(),
            read_path,
            write_path,
            address: 0,
            size,
            flags,
        }
    }

    pub fn is_present(&self) -> bool {
        self.size != 0
    }

    /// Skip wins over load: an entry matching `skip` is never selected.
    pub fn selected(&self, load: FlagBitmask, skip: FlagBitmask) -> bool {
        self.is_present() && !self.flags.intersects(skip) && self.flags.intersects(load)
    }
}

#[derive(Clone)]
pub struct PartitionTable {
    pub subsystem: Subsystem,
    pub entries: Vec<PartitionEntry>,
    pub start_path: Option<PathBuf>,
    pub stop_path: Option<PathBuf>,
    /// Control node, present when the driver speaks the ioctl protocol.
    pub ioctl: Option<Arc<dyn HwSync>>,
    /// The start/stop files exist.
    pub driver_ok: bool,
    /// Entries came from configuration rather than board probing.
    pub externally_described: bool,
    pub modem_base: u64,
    pub modem_size: u64,
    pub all_base: u64,
    pub all_size: u64,
}

impl fmt::Debug for PartitionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionTable")
            .field("subsystem", &self.subsystem)
            .field("entries", &self.entries)
            .field("driver_ok", &self.driver_ok)
            .field("ioctl_ok", &self.ioctl_ok())
            .field("externally_described", &self.externally_described)
            .finish()
    }
}

impl PartitionTable {
    pub fn empty(subsystem: Subsystem) -> Self {
        Self {
            subsystem,
            entries: Vec::new(),
            start_path: None,
            stop_path: None,
            ioctl: None,
            driver_ok: false,
            externally_described: false,
            modem_base: 0,
            modem_size: 0,
            all_base: 0,
            all_size: 0,
        }
    }

    pub fn ioctl_ok(&self) -> bool {
        self.ioctl.is_some()
    }

    /// A table the loader can act on at all.
    pub fn usable(&self) -> bool {
        self.driver_ok || self.ioctl_ok()
    }

    pub fn find(&self, name: &str) -> Option<&PartitionEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Replace entries and control paths with a configured table.
    pub fn apply_override(&mut self, ov: &TableOverride, ioctl: Option<Arc<dyn HwSync>>) {
        self.entries = ov.entries.clone();
        if ov.start_path.is_some() {
            self.start_path = ov.start_path.clone();
        }
        if ov.stop_path.is_some() {
            self.stop_path = ov.stop_path.clone();
        }
        self.driver_ok = self.driver_ok
            || self.start_path.as_deref().is_some_and(Path::exists)
            || self.stop_path.as_deref().is_some_and(Path::exists);
        if ioctl.is_some() {
            self.ioctl = ioctl;
        }
        self.externally_described = true;
    }

    /// Driver-facing view of the table. `None` when it cannot be expressed
    /// (empty, or more regions than the driver accepts).
    pub fn to_load_info(&self) -> Option<ModemLoadInfo> {
        let n = self.entries.len();
        if n == 0 || n > MAX_REGIONS {
            tracing::warn!(subsystem = %self.subsystem, entries = n, "table cannot be pushed to driver");
            return None;
        }
        let mut info = ModemLoadInfo {
            region_cnt: n as u32,
            modem_base: self.modem_base,
            modem_size: self.modem_size as u32,
            all_base: self.all_base,
            all_size: self.all_size as u32,
            ..ModemLoadInfo::default()
        };
        for (slot, e) in info.regions.iter_mut().zip(&self.entries) {
            *slot = RegionInfo::new(&e.name, e.address, e.size as u32);
        }
        Some(info)
    }
}

// ─── Default tables ─────────────────────────────────────────────────────────

fn cat(parts: &[&str]) -> PathBuf {
    PathBuf::from(parts.concat())
}

/// CP table as probed on the board: ten fixed slots, sized by modem type.
pub fn default_cp_table(props: &dyn PropertyStore, modem_type: ModemType, paths: &Paths) -> PartitionTable {
    let mut table = PartitionTable::empty(Subsystem::Cp);
    if !paths.cptl_dir.exists() {
        tracing::info!(path = %paths.cptl_dir.display(), "no cp loader driver");
        return table;
    }
    table.driver_ok = true;
    table.start_path = Some(paths.cptl_dir.join("start"));
    table.stop_path = Some(paths.cptl_dir.join("stop"));

    let nvp = props.get_or(props::NV_PARTITION, "not_find");
    let read = props.get_or(props::PARTITION_PATH, "not_find");
    let write = props.get_or(props::MODEM_DEV, "not_find");
    let r = |bank: &str| cat(&[&read, &nvp, bank]);
    let w = |bank: &str| cat(&[&write, bank]);
    let dsp_flags = FlagBitmask::SECURE | FlagBitmask::MODEM_DSP;

    let mut modem = PartitionEntry::new(MODEM_BANK, r(MODEM_BANK), w(MODEM_BANK), 0, FlagBitmask::SECURE | FlagBitmask::MODEM);
    let mut deltanv = PartitionEntry::new("deltanv", r("deltanv"), w("deltanv"), 0, FlagBitmask::SECURE | FlagBitmask::MODEM);
    let mut dsp = PartitionEntry { flags: dsp_flags, ..Default::default() };
    let mut gdsp = PartitionEntry { flags: dsp_flags, ..Default::default() };
    let mut ldsp = PartitionEntry { flags: dsp_flags, ..Default::default() };
    let mut cdsp = PartitionEntry { flags: dsp_flags, ..Default::default() };
    let mut warm = PartitionEntry { flags: dsp_flags, ..Default::default() };

    match modem_type {
        ModemType::Td | ModemType::W => {
            modem.size = MODEM_SIZE;
            dsp = PartitionEntry::new("dsp", r("dsp"), w("dsp"), TGDSP_SIZE, dsp_flags);
        }
        ModemType::Lte => {
            modem.size = MODEM_SIZE;
            deltanv.size = DELTANV_SIZE;

            let (name, write_path) = if w("tgdsp").exists() {
                ("tgdsp", w("tgdsp"))
            } else {
                ("gdsp", w("gdsp"))
            };
            let read_path = if r("tgdsp").exists() { r("tgdsp") } else { r("gdsp") };
            gdsp = PartitionEntry::new(name, read_path, write_path, TGDSP_SIZE, dsp_flags);
            ldsp = PartitionEntry::new("ldsp", r("ldsp"), w("ldsp"), LDSP_SIZE, dsp_flags);
            cdsp = PartitionEntry::new("cdsp", r("cdsp"), w("cdsp"), CDSP_SIZE, dsp_flags);
            warm = PartitionEntry::new("warm", r("warm"), w("warm"), WARM_SIZE, dsp_flags);
        }
        ModemType::Nr | ModemType::None => {}
    }

    let cmdline = PartitionEntry::new(
        "cpcmdline",
        paths.cmdline.clone(),
        w("cpcmdline"),
        CMDLINE_MAX as u64,
        FlagBitmask::CMDLINE | FlagBitmask::MODEM_OTHER,
    );
    let nv_flags = FlagBitmask::NV | FlagBitmask::MODEM_OTHER;
    let fixnv = PartitionEntry::new("fixnv", r("fixnv"), w("fixnv"), FIXNV_SIZE, nv_flags);
    let runnv = PartitionEntry::new("runnv", r("runtimenv"), w("runnv"), RUNNV_SIZE, nv_flags);

    table.entries = vec![modem, deltanv, dsp, gdsp, ldsp, cdsp, warm, cmdline, fixnv, runnv];
    table
}

/// SP (power-management companion) table: system image plus calibration.
pub fn default_sp_table(props: &dyn PropertyStore, paths: &Paths) -> PartitionTable {
    let mut table = PartitionTable::empty(Subsystem::Sp);
    if !paths.pmic_dir.exists() {
        tracing::info!(path = %paths.pmic_dir.display(), "no sp loader driver");
        return table;
    }
    table.driver_ok = true;
    table.start_path = Some(paths.pmic_dir.join("start"));
    table.stop_path = Some(paths.pmic_dir.join("stop"));

    let read = props.get_or(props::PARTITION_PATH, "not_find");
    table.entries = vec![
        PartitionEntry::new(
            "pm_sys",
            cat(&[&read, "pm_sys"]),
            paths.pmic_dir.join("pm_sys"),
            PMCP_SIZE,
            FlagBitmask::SECURE | FlagBitmask::SP,
        ),
        PartitionEntry::new(
            "cali_lib",
            paths.sp_cali_image.clone(),
            paths.pmic_dir.join("cali_lib"),
            PMCP_CALI_SIZE,
            FlagBitmask::CLEAR | FlagBitmask::SP_CALI,
        ),
    ];
    table
}

/// DP table: one empty slot until configuration describes it.
pub fn default_dp_table() -> PartitionTable {
    let mut table = PartitionTable::empty(Subsystem::Dp);
    table.entries = vec![PartitionEntry::default()];
    table
}

// ─── Load-node correction ───────────────────────────────────────────────────

const NODE_NAME_LEN: usize = 32;
const NODE_RECORD_LEN: usize = NODE_NAME_LEN + 8;

/// `{name[32], base u32, size u32}` record from a driver `ldinfo` node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadNode {
    pub name: String,
    pub base: u32,
    pub size: u32,
}

pub fn parse_load_nodes(raw: &[u8]) -> Vec<LoadNode> {
    use bytes::Buf;

    raw.chunks_exact(NODE_RECORD_LEN)
        .filter_map(|rec| {
            let name_raw = &rec[..NODE_NAME_LEN];
            let end = name_raw.iter().position(|&b| b == 0).unwrap_or(NODE_NAME_LEN);
            let name = String::from_utf8_lossy(&name_raw[..end]).into_owned();
            if name.is_empty() {
                return None;
            }
            let mut tail = &rec[NODE_NAME_LEN..];
            Some(LoadNode {
                name,
                base: tail.get_u32_le(),
                size: tail.get_u32_le(),
            })
        })
        .collect()
}

/// Read `<pmic>/ldinfo` then `<cptl>/ldinfo`. Missing nodes are normal on
/// newer drivers.
pub fn read_load_nodes(paths: &Paths) -> Vec<LoadNode> {
    let mut nodes = Vec::new();
    for dir in [&paths.pmic_dir, &paths.cptl_dir] {
        let path = dir.join("ldinfo");
        match fs::read(&path) {
            Ok(raw) => {
                let found = parse_load_nodes(&raw);
                for n in &found {
                    tracing::debug!(name = %n.name, base = n.base, size = n.size, "load node");
                }
                nodes.extend(found);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no load node");
            }
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "read load node"),
        }
    }
    nodes
}

/// Entries whose write path mentions a node name take that node's
/// base/size.
pub fn apply_load_nodes(table: &mut PartitionTable, nodes: &[LoadNode]) {
    for entry in &mut table.entries {
        let write = entry.write_path.to_string_lossy();
        if let Some(node) = nodes.iter().find(|n| write.contains(n.name.as_str())) {
            tracing::debug!(
                entry = %entry.name,
                addr = entry.address,
                new_addr = node.base,
                size = entry.size,
                new_size = node.size,
                "load node correction"
            );
            entry.address = u64::from(node.base);
            entry.size = u64::from(node.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::MemoryProperties;

    fn board(dir: &Path) -> Paths {
        Paths {
            cptl_dir: dir.join("cptl"),
            pmic_dir: dir.join("pmic"),
            cmdline: dir.join("cmdline"),
            sp_cali_image: dir.join("cali.bin"),
            ..Paths::default()
        }
    }

    fn props() -> MemoryProperties {
        MemoryProperties::with_values([
            (props::PARTITION_PATH, "/dev/block/by-name/"),
            (props::NV_PARTITION, "l_"),
            (props::MODEM_DEV, "/proc/cptl/"),
        ])
    }

    // ─── Flags ──────────────────────────────────────────────────────────────

    #[test]
    fn skip_mask_evaluated_first() {
        let e = PartitionEntry {
            name: "head".into(),
            size: 4,
            flags: FlagBitmask::MODEM_HEAD,
            ..Default::default()
        };
        assert!(e.selected(FlagBitmask::MODEM_MASK, FlagBitmask::NONE));
        assert!(!e.selected(FlagBitmask::MODEM_MASK, FlagBitmask::MODEM_HEAD));
    }

    #[test]
    fn absent_entry_never_selected() {
        let e = PartitionEntry {
            flags: FlagBitmask::MODEM,
            ..Default::default()
        };
        assert!(!e.selected(FlagBitmask::all(), FlagBitmask::NONE));
    }

    #[test]
    fn masks_cover_their_categories() {
        assert!(FlagBitmask::MODEM_MASK.contains(FlagBitmask::MODEM_HEAD | FlagBitmask::MODEM_OTHER));
        assert!(!FlagBitmask::MODEM_EXCEPT_HEAD_MASK.contains(FlagBitmask::MODEM_HEAD));
        assert!(FlagBitmask::SP_MASK.contains(FlagBitmask::SP_CALI));
        assert_eq!(LoadTargets::ALL_EXTERNAL, LoadTargets::all() - LoadTargets::SP);
    }

    // ─── Default tables ─────────────────────────────────────────────────────

    #[test]
    fn cp_table_absent_without_driver() {
        let dir = tempfile::tempdir().unwrap();
        let t = default_cp_table(&props(), ModemType::Lte, &board(dir.path()));
        assert!(!t.usable());
        assert!(t.entries.is_empty());
    }

    #[test]
    fn lte_cp_table_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = board(dir.path());
        fs::create_dir(&paths.cptl_dir).unwrap();

        let t = default_cp_table(&props(), ModemType::Lte, &paths);
        assert!(t.driver_ok);
        assert_eq!(t.entries.len(), 10);
        let modem = t.find("modem").unwrap();
        assert_eq!(modem.size, MODEM_SIZE);
        assert_eq!(modem.read_path, PathBuf::from("/dev/block/by-name/l_modem"));
        assert_eq!(modem.write_path, PathBuf::from("/proc/cptl/modem"));
        assert_eq!(t.find("gdsp").unwrap().size, TGDSP_SIZE);
        assert_eq!(t.find("deltanv").unwrap().size, DELTANV_SIZE);
        let runnv = t.find("runnv").unwrap();
        assert_eq!(runnv.read_path, PathBuf::from("/dev/block/by-name/l_runtimenv"));
        assert!(runnv.flags.contains(FlagBitmask::NV));
        assert_eq!(t.entries[7].name, "cpcmdline");
        assert!(!t.entries[2].is_present(), "dsp slot unused on LTE");
    }

    #[test]
    fn td_cp_table_uses_single_dsp_bank() {
        let dir = tempfile::tempdir().unwrap();
        let paths = board(dir.path());
        fs::create_dir(&paths.cptl_dir).unwrap();

        for modem_type in [ModemType::Td, ModemType::W] {
            let t = default_cp_table(&props(), modem_type, &paths);
            assert_eq!(t.find("modem").unwrap().size, MODEM_SIZE);
            let dsp = t.find("dsp").unwrap();
            assert_eq!(dsp.size, TGDSP_SIZE);
            assert_eq!(dsp.write_path, PathBuf::from("/proc/cptl/dsp"));
            assert!(t.find("ldsp").is_none(), "lte banks unused on {modem_type:?}");
            assert_eq!(t.find("deltanv").unwrap().size, 0);
        }
    }

    #[test]
    fn nr_cp_table_leaves_images_unsized() {
        let dir = tempfile::tempdir().unwrap();
        let paths = board(dir.path());
        fs::create_dir(&paths.cptl_dir).unwrap();
        let t = default_cp_table(&props(), ModemType::Nr, &paths);
        assert_eq!(t.find("modem").unwrap().size, 0);
        assert_eq!(t.find("fixnv").unwrap().size, FIXNV_SIZE);
    }

    #[test]
    fn sp_table_entries() {
        let dir = tempfile::tempdir().unwrap();
        let paths = board(dir.path());
        fs::create_dir(&paths.pmic_dir).unwrap();
        let t = default_sp_table(&props(), &paths);
        assert_eq!(t.entries.len(), 2);
        assert_eq!(t.entries[0].name, "pm_sys");
        assert!(t.entries[1].flags.contains(FlagBitmask::CLEAR | FlagBitmask::SP_CALI));
        assert_eq!(t.stop_path, Some(paths.pmic_dir.join("stop")));
    }

    #[test]
    fn modem_type_from_props() {
        let p = MemoryProperties::new();
        assert_eq!(ModemType::from_props(&p), None);
        p.set(props::MODEM_TYPE, "nr");
        assert_eq!(ModemType::from_props(&p), Some(ModemType::Nr));
        p.set(props::MODEM_TYPE, "x");
        assert_eq!(ModemType::from_props(&p), Some(ModemType::None));
    }

    // ─── Load nodes ─────────────────────────────────────────────────────────

    fn node(name: &str, base: u32, size: u32) -> Vec<u8> {
        let mut rec = vec![0u8; NODE_RECORD_LEN];
        rec[..name.len()].copy_from_slice(name.as_bytes());
        rec[32..36].copy_from_slice(&base.to_le_bytes());
        rec[36..40].copy_from_slice(&size.to_le_bytes());
        rec
    }

    #[test]
    fn load_nodes_correct_matching_entries() {
        let mut raw = node("modem", 0x8a00_0000, 0x80_0000);
        raw.extend(node("pm_sys", 0x1000, 0x2000));
        raw.extend([0u8; 7]); // trailing partial record ignored
        let nodes = parse_load_nodes(&raw);
        assert_eq!(nodes.len(), 2);

        let mut t = PartitionTable::empty(Subsystem::Cp);
        t.entries.push(PartitionEntry {
            name: "modem".into(),
            write_path: "/proc/cptl/modem".into(),
            size: MODEM_SIZE,
            ..Default::default()
        });
        t.entries.push(PartitionEntry {
            name: "fixnv".into(),
            write_path: "/proc/cptl/fixnv".into(),
            size: FIXNV_SIZE,
            ..Default::default()
        });
        apply_load_nodes(&mut t, &nodes);
        assert_eq!(t.entries[0].address, 0x8a00_0000);
        assert_eq!(t.entries[0].size, 0x80_0000);
        assert_eq!(t.entries[1].size, FIXNV_SIZE);
    }

    #[test]
    fn load_info_rejects_oversized_table() {
        let mut t = PartitionTable::empty(Subsystem::Cp);
        assert!(t.to_load_info().is_none());
        t.entries = vec![PartitionEntry::default(); MAX_REGIONS + 1];
        assert!(t.to_load_info().is_none());
        t.entries.truncate(2);
        t.entries[0].name = "modem".into();
        t.entries[0].size = 0x10;
        let info = t.to_load_info().unwrap();
        assert_eq!(info.region_cnt, 2);
        assert_eq!(info.regions()[0].name(), "modem");
        assert_eq!(info.regions()[0].size, 0x10);
    }
}
