//! # Load orchestrator
//!
//! Owns the three partition tables and sequences stop → load → start
//! across them. Internal modems are a single pass over SP then CP; external
//! modems walk the staged mini-AP boot, handshaking through remote flags
//! between stages:
//!
//! ```text
//!   SP ─► DP ─► SPL ─(DDR ready)─► audio ─► SML/U-Boot ─► boot
//!     ─► modem head ─(set BAR, rescan)─► modem ─► start
//! ```
//!
//! A stage whose remote flag never shows up aborts the attempt with the
//! modem left in `Loading`; the next reset request retries from scratch.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::cmdline;
use crate::config::{DaemonConfig, ModemTopology, TableOverride};
use crate::error::LoadError;
use crate::hw::pcie::PcieRescan;
use crate::hw::sync::{HwSync, IoctlChannel, RemoteFlags};
use crate::hw::{DebugInterrupts, WakeLock};
use crate::load::image::{self, ImageLocation, ModemHeader};
use crate::load::nv::{NvOutcome, NvPair};
use crate::load::partition::{
    self, FlagBitmask, LoadTargets, ModemType, PartitionEntry, PartitionTable, Subsystem,
};
use crate::props::PropertyStore;
use crate::state::{ModemState, StateMachine};
use crate::system::SystemControl;

const COPY_BUFFER: usize = 512 * 1024;
const CLEAR_CHUNK: usize = 8 * 1024;
const BOOT_CODE_MAX: usize = 512;
const PROC_WRITE_ATTEMPTS: u32 = 6;
const PROC_WRITE_RETRY: Duration = Duration::from_millis(200);
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

// ─── Secure loading seam ────────────────────────────────────────────────────

/// Raw copy callback handed to the secure loader.
pub type CopyFn<'a> = dyn FnMut(&PartitionEntry, ImageLocation) -> Result<(), LoadError> + 'a;

/// Verification collaborator for entries flagged `SECURE`.
pub trait SecureLoader: Send + Sync {
    /// Load one secure entry, using `copy` for the actual byte transfer.
    fn load(&self, entry: &PartitionEntry, copy: &mut CopyFn<'_>) -> Result<(), LoadError>;

    /// Verify everything loaded in this pass.
    fn verify_all(&self) -> Result<(), LoadError>;
}

/// Loads secure entries like any other image and verifies nothing.
#[derive(Debug, Default)]
pub struct PassthroughSecure;

impl SecureLoader for PassthroughSecure {
    fn load(&self, entry: &PartitionEntry, copy: &mut CopyFn<'_>) -> Result<(), LoadError> {
        copy(entry, image::locate_entry(entry))
    }

    fn verify_all(&self) -> Result<(), LoadError> {
        Ok(())
    }
}

// ─── Tables ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TableSet {
    pub cp: PartitionTable,
    pub sp: PartitionTable,
    pub dp: PartitionTable,
}

fn apply_override(table: &mut PartitionTable, ov: Option<&TableOverride>) {
    let Some(ov) = ov else { return };
    let ioctl = ov
        .ioctl_path
        .as_ref()
        .and_then(|p| IoctlChannel::probe(p.clone()))
        .map(|c| Arc::new(c) as Arc<dyn HwSync>);
    if ov.ioctl_path.is_some() && ioctl.is_none() {
        tracing::warn!(subsystem = %table.subsystem, "configured control node missing");
    }
    table.apply_override(ov, ioctl);
    tracing::info!(subsystem = %table.subsystem, entries = table.entries.len(), "table from config");
}

impl TableSet {
    /// Board defaults, corrected by driver load nodes, then replaced by any
    /// configured tables.
    pub fn probe(config: &DaemonConfig, props: &dyn PropertyStore, modem: ModemType) -> Self {
        let mut set = Self {
            cp: partition::default_cp_table(props, modem, &config.paths),
            sp: partition::default_sp_table(props, &config.paths),
            dp: partition::default_dp_table(),
        };
        let nodes = partition::read_load_nodes(&config.paths);
        if !nodes.is_empty() {
            partition::apply_load_nodes(&mut set.cp, &nodes);
            partition::apply_load_nodes(&mut set.sp, &nodes);
        }
        apply_override(&mut set.cp, config.tables.cp.as_ref());
        apply_override(&mut set.sp, config.tables.sp.as_ref());
        apply_override(&mut set.dp, config.tables.dp.as_ref());
        set
    }

    fn get(&self, subsystem: Subsystem) -> &PartitionTable {
        match subsystem {
            Subsystem::Cp => &self.cp,
            Subsystem::Sp => &self.sp,
            Subsystem::Dp => &self.dp,
        }
    }
}

/// Shared handles the orchestrator works with.
pub struct LoaderEnv {
    pub state: Arc<StateMachine>,
    pub wake_lock: Arc<WakeLock>,
    pub debug: Arc<DebugInterrupts>,
    pub secure: Box<dyn SecureLoader>,
    pub rescan: Box<dyn PcieRescan>,
    pub system: Arc<dyn SystemControl>,
}

// ─── Orchestrator ───────────────────────────────────────────────────────────

pub struct LoadOrchestrator {
    tables: TableSet,
    header: ModemHeader,
    topology: ModemTopology,
    pcie: bool,
    secure_boot: bool,
    cmdline_path: PathBuf,
    flag_timeout: Duration,
    flag_poll: Duration,
    reboot_settle: Duration,
    env: LoaderEnv,
    // One load pass at a time; the control loop and uevent workers both
    // reach in here.
    busy: Mutex<()>,
}

impl LoadOrchestrator {
    /// Probe, override, header-correct and publish the tables.
    pub fn init(
        config: &DaemonConfig,
        props: &dyn PropertyStore,
        modem: ModemType,
        env: LoaderEnv,
    ) -> Self {
        let tables = TableSet::probe(config, props, modem);
        Self::with_tables(config, tables, env)
    }

    pub fn with_tables(config: &DaemonConfig, mut tables: TableSet, env: LoaderEnv) -> Self {
        let header = if tables.cp.entries.is_empty() {
            ModemHeader::default()
        } else {
            image::correct_from_header(&mut tables.cp).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "modem header correction skipped");
                ModemHeader::default()
            })
        };

        let this = Self {
            tables,
            header,
            topology: config.daemon.topology,
            pcie: config.daemon.pcie,
            secure_boot: config.daemon.secure_boot,
            cmdline_path: config.paths.cmdline.clone(),
            flag_timeout: config.timings.remote_flag_timeout,
            flag_poll: config.timings.remote_flag_poll,
            reboot_settle: config.timings.reboot_settle,
            env,
            busy: Mutex::new(()),
        };
        for sub in [Subsystem::Sp, Subsystem::Cp, Subsystem::Dp] {
            this.publish(this.tables.get(sub));
        }
        this
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn header(&self) -> &ModemHeader {
        &self.header
    }

    fn publish(&self, table: &PartitionTable) {
        let Some(ctl) = &table.ioctl else { return };
        let Some(info) = table.to_load_info() else { return };
        let res = ctl
            .lock_write()
            .and_then(|()| ctl.set_load_info(&info))
            .and_then(|()| ctl.unlock_write());
        match res {
            Ok(()) => tracing::info!(subsystem = %table.subsystem, regions = info.region_cnt, "load table published"),
            Err(e) => tracing::error!(subsystem = %table.subsystem, error = %e, "publish load table"),
        }
    }

    // ─── Stop / start ───────────────────────────────────────────────────────

    fn run(&self, table: &PartitionTable, start: bool) {
        if let Some(ctl) = &table.ioctl {
            let res = if start {
                ctl.start().and_then(|()| ctl.unlock_write())
            } else {
                ctl.lock_write().and_then(|()| ctl.stop())
            };
            if let Err(e) = res {
                tracing::error!(subsystem = %table.subsystem, start, error = %e, "control command");
            }
        } else if table.driver_ok {
            let path = if start { &table.start_path } else { &table.stop_path };
            if let Some(path) = path {
                if let Err(e) = write_proc_file(path, b"1") {
                    tracing::error!(path = %path.display(), error = %e, "control file");
                }
            }
        }
    }

    fn for_targets(&self, targets: LoadTargets, start: bool) {
        if targets.contains(LoadTargets::SP) {
            self.run(&self.tables.sp, start);
        }
        if targets.contains(LoadTargets::DP) {
            self.run(&self.tables.dp, start);
        }
        if targets.intersects(LoadTargets::MODEM | LoadTargets::MINIAP) {
            self.run(&self.tables.cp, start);
        }
    }

    pub fn stop(&self, targets: LoadTargets) {
        self.for_targets(targets, false);
    }

    pub fn start(&self, targets: LoadTargets) {
        self.for_targets(targets, true);
    }

    // ─── Entry loading ──────────────────────────────────────────────────────

    fn destination(table: &PartitionTable, entry: &PartitionEntry) -> PathBuf {
        match &table.ioctl {
            Some(ctl) => ctl.path().to_path_buf(),
            None => entry.write_path.clone(),
        }
    }

    /// Load every present entry of `table` matching `load` and not `skip`.
    ///
    /// All selected entries are attempted; the first image copy failure is
    /// returned. Cmdline, NV and boot-code failures are logged only.
    pub fn load_entries(
        &self,
        table: &PartitionTable,
        load: FlagBitmask,
        skip: FlagBitmask,
    ) -> Result<(), LoadError> {
        tracing::info!(subsystem = %table.subsystem, load = load.bits(), skip = skip.bits(), "load entries");
        let mut first_err = None;
        for (index, entry) in table.entries.iter().enumerate() {
            if !entry.selected(load, skip) {
                continue;
            }
            if let Some(ctl) = &table.ioctl {
                if let Err(e) = ctl.set_write_region(index) {
                    tracing::error!(entry = %entry.name, index, error = %e, "select write region");
                }
            }
            let dest = Self::destination(table, entry);

            if entry.flags.contains(FlagBitmask::CMDLINE) {
                if let Err(e) = self.load_cmdline(&dest) {
                    tracing::error!(entry = %entry.name, error = %e, "cp cmdline");
                }
                continue;
            }
            if entry.flags.contains(FlagBitmask::NV) {
                let pair = NvPair::for_entry(&entry.read_path, &dest);
                match pair.reconcile(&self.env.debug) {
                    Ok(NvOutcome::Zeroed) => {
                        tracing::error!(entry = %entry.name, "nv unrecoverable, cp gets zeroed store");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(entry = %entry.name, error = %e, "nv reconcile"),
                }
                continue;
            }
            if entry.flags.contains(FlagBitmask::BOOT_CODE) {
                if let Err(e) = self.load_boot_code(&dest) {
                    tracing::error!(entry = %entry.name, error = %e, "boot code");
                }
                continue;
            }

            let res = if self.secure_boot && entry.flags.contains(FlagBitmask::SECURE) {
                let mut copy = |e: &PartitionEntry, loc: ImageLocation| self.copy_region(e, &dest, loc);
                self.env.secure.load(entry, &mut copy)
            } else {
                self.copy_region(entry, &dest, image::locate_entry(entry))
            };
            if let Err(e) = res {
                tracing::error!(entry = %entry.name, error = %e, "load image");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn load_cmdline(&self, dest: &Path) -> Result<(), LoadError> {
        let _quiet = self.env.debug.suspend();
        let line = cmdline::read(&self.cmdline_path)
            .map_err(|e| LoadError::Cmdline(format!("{}: {e}", self.cmdline_path.display())))?;
        let bytes = cmdline::cp_region_bytes(&line);
        write_all_to(dest, &bytes)?;
        tracing::debug!(dest = %dest.display(), bytes = bytes.len(), "cp cmdline written");
        Ok(())
    }

    fn load_boot_code(&self, dest: &Path) -> Result<(), LoadError> {
        if self.header.boot_code.is_empty() {
            return Err(LoadError::MissingBootCode);
        }
        let n = self.header.boot_code.len().min(BOOT_CODE_MAX);
        write_all_to(dest, &self.header.boot_code[..n])?;
        tracing::debug!(dest = %dest.display(), bytes = n, "boot code written");
        Ok(())
    }

    /// Copy `loc` of the entry's image into `dest`, clearing first when the
    /// entry asks for it. A source that ends early is a clean EOF.
    pub fn copy_region(
        &self,
        entry: &PartitionEntry,
        dest: &Path,
        loc: ImageLocation,
    ) -> Result<(), LoadError> {
        tracing::debug!(
            src = %entry.read_path.display(),
            offset = loc.offset,
            dest = %dest.display(),
            size = loc.length,
            "copy region"
        );
        let _quiet = self.env.debug.suspend();
        if entry.flags.contains(FlagBitmask::CLEAR) {
            clear_region(dest, loc.length)?;
        }

        let mut src = File::open(&entry.read_path).map_err(|source| LoadError::Open {
            path: entry.read_path.clone(),
            source,
        })?;
        let mut out = open_write(dest)?;
        src.seek(SeekFrom::Start(loc.offset)).map_err(|source| LoadError::Seek {
            path: entry.read_path.clone(),
            offset: loc.offset,
            source,
        })?;

        let mut remaining = loc.length;
        let mut buf = vec![0u8; (loc.length as usize).min(COPY_BUFFER)];
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            let got = match src.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(source) => {
                    return Err(LoadError::Read {
                        path: entry.read_path.clone(),
                        source,
                    });
                }
            };
            let written = out.write(&buf[..got]).map_err(|source| LoadError::Write {
                path: dest.to_path_buf(),
                source,
            })?;
            if written < got {
                return Err(LoadError::ShortWrite {
                    path: dest.to_path_buf(),
                    written,
                    expected: got,
                });
            }
            remaining -= got as u64;
        }
        Ok(())
    }

    // ─── Remote flags ───────────────────────────────────────────────────────

    fn cp_ctl(&self) -> Option<&Arc<dyn HwSync>> {
        self.tables.cp.ioctl.as_ref()
    }

    fn set_flags(&self, flags: RemoteFlags) {
        let Some(ctl) = self.cp_ctl() else { return };
        if let Err(e) = ctl.set_remote_flags(flags) {
            tracing::error!(flags = flags.bits(), error = %e, "set remote flag");
        }
    }

    fn clear_flags(&self, flags: RemoteFlags) {
        let Some(ctl) = self.cp_ctl() else { return };
        if let Err(e) = ctl.clear_remote_flags(flags) {
            tracing::error!(flags = flags.bits(), error = %e, "clear remote flag");
        }
    }

    /// Poll until any of `want` is raised. Trivially satisfied without a
    /// control channel.
    pub fn wait_remote(&self, want: RemoteFlags) -> Result<(), LoadError> {
        let Some(ctl) = self.cp_ctl() else { return Ok(()) };
        tracing::info!(flags = want.bits(), "waiting for remote flag");
        let start = Instant::now();
        loop {
            let flags = ctl
                .lock_read()
                .and_then(|()| ctl.remote_flags())
                .and_then(|f| ctl.unlock_read().map(|()| f));
            match flags {
                Ok(f) if f.intersects(want) => {
                    tracing::info!(flags = want.bits(), "remote flag observed");
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "read remote flag"),
            }
            if start.elapsed() >= self.flag_timeout {
                tracing::error!(flags = want.bits(), "remote flag timeout");
                return Err(LoadError::RemoteFlagTimeout {
                    flags: want.bits(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            thread::sleep(self.flag_poll);
        }
    }

    // ─── Passes ─────────────────────────────────────────────────────────────

    /// Load the selected subsystems. Ends in `Booting` unless a handshake
    /// stage aborts the attempt.
    pub fn load(&self, targets: LoadTargets) -> Result<(), LoadError> {
        let _busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        let _wake = self.env.wake_lock.acquire("load");
        tracing::info!(targets = targets.bits(), topology = ?self.topology, "load pass");
        match self.topology {
            ModemTopology::Internal => self.load_internal(targets),
            ModemTopology::External => self.load_external(targets),
        }
    }

    fn load_table(&self, table: &PartitionTable, load: FlagBitmask) -> Result<(), LoadError> {
        if table.usable() {
            self.load_entries(table, load, FlagBitmask::NONE)
        } else {
            tracing::error!(subsystem = %table.subsystem, "loader driver not available");
            Ok(())
        }
    }

    /// Verify the secure images of this pass. A failure is unrecoverable:
    /// the whole system goes down and the error is only returned to test
    /// doubles that let the reboot call return.
    fn verify_secure(&self) -> Result<(), LoadError> {
        if !self.secure_boot {
            return Ok(());
        }
        let Err(e) = self.env.secure.verify_all() else {
            return Ok(());
        };
        tracing::error!(error = %e, "secure verification failed");
        self.env.state.set(ModemState::RebootSystem);
        thread::sleep(self.reboot_settle);
        self.env.system.reboot_system("secure verification failed");
        Err(e)
    }

    fn load_internal(&self, targets: LoadTargets) -> Result<(), LoadError> {
        self.stop(targets);
        self.env.state.set(ModemState::Loading);

        let mut result = Ok(());
        if targets.contains(LoadTargets::SP) {
            result = result.and(self.load_table(&self.tables.sp, FlagBitmask::SP_MASK));
        }
        if targets.contains(LoadTargets::MODEM) {
            result = result.and(self.load_table(&self.tables.cp, FlagBitmask::MODEM_MASK));
        }
        self.verify_secure()?;

        self.start(targets);
        self.env.state.set(ModemState::Booting);
        result
    }

    fn load_external(&self, targets: LoadTargets) -> Result<(), LoadError> {
        let mut remaining = targets;
        self.env.state.set(ModemState::Loading);

        if targets.contains(LoadTargets::SP) {
            self.stop(LoadTargets::SP);
            if let Err(e) = self.load_table(&self.tables.sp, FlagBitmask::SP_MASK) {
                tracing::warn!(error = %e, "sp load incomplete");
            }
            self.start(LoadTargets::SP);
            self.verify_secure()?;
            remaining.remove(LoadTargets::SP);
        }

        self.stop(remaining);
        if targets.contains(LoadTargets::DP) {
            if self.tables.dp.usable() {
                if let Err(e) = self.load_entries(&self.tables.dp, FlagBitmask::SP_MASK, FlagBitmask::NONE) {
                    tracing::warn!(error = %e, "dp load incomplete");
                }
            } else {
                tracing::info!("dp loader driver not available");
            }
        }

        let cp = &self.tables.cp;
        let has_ctl = cp.ioctl_ok();
        if has_ctl && !targets.is_empty() {
            self.set_flags(RemoteFlags::empty());
            if targets.contains(LoadTargets::MINIAP) {
                self.load_entries(cp, FlagBitmask::SPL, FlagBitmask::NONE)?;
                self.set_flags(RemoteFlags::SPL_DONE);
                self.wait_remote(RemoteFlags::DDR_READY)?;
            }
        }

        if targets.contains(LoadTargets::AGDSP) {
            if let Err(e) = self.load_entries(cp, FlagBitmask::AUDIO_MASK, FlagBitmask::NONE) {
                tracing::warn!(error = %e, "audio dsp load incomplete");
            }
        }

        if targets.contains(LoadTargets::MINIAP) && has_ctl {
            if self.load_entries(cp, FlagBitmask::SML | FlagBitmask::UBOOT, FlagBitmask::NONE).is_ok() {
                self.set_flags(RemoteFlags::UBOOT_DONE);
            }
            if self.load_entries(cp, FlagBitmask::BOOT, FlagBitmask::NONE).is_ok() {
                self.set_flags(RemoteFlags::BOOT_DONE);
            }
            if self.pcie {
                self.clear_flags(RemoteFlags::EP_SET_BAR_DONE);
            }
            if self.load_entries(cp, FlagBitmask::MODEM_HEAD, FlagBitmask::NONE).is_ok() {
                self.set_flags(RemoteFlags::HEAD_DONE);
                if self.pcie && self.wait_remote(RemoteFlags::EP_SET_BAR_DONE).is_ok() {
                    self.env.rescan.rescan().map_err(LoadError::Rescan)?;
                    // Low active: clearing signals rescan done.
                    self.clear_flags(RemoteFlags::EP_RESCAN_DONE);
                }
            }
        }

        if targets.contains(LoadTargets::MODEM)
            && self.load_entries(cp, FlagBitmask::MODEM_MASK, FlagBitmask::MODEM_HEAD).is_ok()
        {
            self.set_flags(RemoteFlags::MODEM_IMAGE_DONE);
        }

        self.start(remaining);
        self.env.state.set(ModemState::Booting);
        Ok(())
    }

    /// Warm reset of the mini-AP: reload the SPL stage only.
    pub fn load_spl(&self) -> Result<(), LoadError> {
        let _busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        let Some(ctl) = self.cp_ctl() else {
            return Err(LoadError::NoControlChannel("cp"));
        };
        ctl.lock_write().map_err(|source| LoadError::Control {
            command: "lock_write",
            source,
        })?;
        self.set_flags(RemoteFlags::empty());
        let res = self.load_entries(&self.tables.cp, FlagBitmask::SPL, FlagBitmask::NONE);
        if res.is_ok() {
            self.set_flags(RemoteFlags::SPL_DONE | RemoteFlags::WARM_RESET);
        }
        if let Err(e) = ctl.unlock_write() {
            tracing::error!(error = %e, "unlock after spl");
        }
        res
    }

    /// Ask the driver to force a CP assert (used to capture a dump).
    pub fn assert_modem(&self) {
        match self.cp_ctl() {
            Some(ctl) => {
                if let Err(e) = ctl.assert_modem() {
                    tracing::error!(error = %e, "assert modem");
                }
            }
            None => tracing::debug!("assert requested without control channel"),
        }
    }

    /// Re-enumerate the PCIe endpoint. A no-op on non-PCIe boards.
    pub fn rescan_endpoint(&self) -> Result<(), LoadError> {
        if !self.pcie {
            return Ok(());
        }
        self.env.rescan.rescan().map_err(LoadError::Rescan)
    }

    /// Full external reboot: rescan until the endpoint is back, reboot the
    /// chip and reload everything it needs.
    pub fn reboot_external(&self) -> Result<(), LoadError> {
        self.env.state.set(ModemState::RebootExternalModem);
        if self.pcie {
            loop {
                let res = self.env.rescan.rescan();
                thread::sleep(RESCAN_INTERVAL);
                match res {
                    Ok(()) => break,
                    Err(e) => tracing::warn!(error = %e, "pcie rescan, retrying"),
                }
            }
        }
        if let Some(ctl) = self.cp_ctl() {
            if let Err(e) = ctl.reboot_external() {
                tracing::error!(error = %e, "reboot external modem");
            }
        }
        self.load(LoadTargets::ALL_EXTERNAL)
    }
}

// ─── File helpers ───────────────────────────────────────────────────────────

fn open_write(path: &Path) -> Result<File, LoadError> {
    OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| LoadError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn write_all_to(path: &Path, bytes: &[u8]) -> Result<(), LoadError> {
    let mut out = open_write(path)?;
    out.write_all(bytes).map_err(|source| LoadError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Zero `len` bytes of `path` in 8 KiB chunks.
pub fn clear_region(path: &Path, len: u64) -> Result<(), LoadError> {
    tracing::debug!(path = %path.display(), len, "clear region");
    let mut out = open_write(path)?;
    let zeros = [0u8; CLEAR_CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = (remaining as usize).min(CLEAR_CHUNK);
        out.write_all(&zeros[..n]).map_err(|source| LoadError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Write a control token, retrying the open while the node appears.
fn write_proc_file(path: &Path, token: &[u8]) -> io::Result<()> {
    let mut attempt = 0;
    let mut file = loop {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => break f,
            Err(e) => {
                attempt += 1;
                if attempt >= PROC_WRITE_ATTEMPTS {
                    return Err(e);
                }
                thread::sleep(PROC_WRITE_RETRY);
            }
        }
    };
    tracing::debug!(path = %path.display(), "control token");
    file.write_all(token)
}
