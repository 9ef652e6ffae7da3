//! Test doubles and a context harness.
//!
//! Available to unit tests and, through the `test-util` feature, to the
//! integration tests under `tests/`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;

use crate::client_bus::ClientBus;
use crate::cmdline::BootMode;
use crate::config::{DaemonConfig, Timings};
use crate::context::{ControlRequest, ModemContext};
use crate::hw::NoRescan;
use crate::hw::sync::{HwSync, ModemLoadInfo, RemoteFlags};
use crate::load::{LoadOrchestrator, LoaderEnv, PartitionTable, PassthroughSecure, Subsystem, TableSet};
use crate::props::{self, MemoryProperties, PropertyStore};
use crate::system::SystemControl;

// ─── System control ─────────────────────────────────────────────────────────

/// Records reboot requests instead of rebooting.
#[derive(Debug, Default)]
pub struct RecordingSystem {
    reboots: Mutex<Vec<String>>,
}

impl RecordingSystem {
    pub fn reboots(&self) -> Vec<String> {
        self.reboots.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SystemControl for RecordingSystem {
    fn reboot_system(&self, reason: &str) {
        self.reboots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(reason.to_string());
    }
}

// ─── Hardware sync ──────────────────────────────────────────────────────────

/// One driver command seen by [`RecordingHwSync`]. Flag reads are not
/// recorded; the loader polls them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCall {
    LockRead,
    UnlockRead,
    LockWrite,
    UnlockWrite,
    SetLoadInfo,
    SetReadRegion(usize),
    SetWriteRegion(usize),
    SetRemote(RemoteFlags),
    ClearRemote(RemoteFlags),
    Stop,
    Start,
    Assert,
    RebootExternal,
    PowerOnExternal,
    PowerOffExternal,
}

#[derive(Debug, Default)]
struct HwState {
    calls: Vec<HwCall>,
    remote: RemoteFlags,
    load_info: Option<ModemLoadInfo>,
    responses: Vec<(RemoteFlags, RemoteFlags)>,
}

/// In-memory control channel that records every command and emulates the
/// remote flag word.
#[derive(Debug)]
pub struct RecordingHwSync {
    path: PathBuf,
    state: Mutex<HwState>,
}

impl RecordingHwSync {
    /// `path` is where region writes are routed.
    pub fn new(path: &Path) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_path_buf(),
            state: Mutex::new(HwState::default()),
        })
    }

    /// When the host sets any bit of `on`, the "firmware" raises `raise`.
    pub fn respond(&self, on: RemoteFlags, raise: RemoteFlags) {
        self.lock().responses.push((on, raise));
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.lock().calls.clone()
    }

    pub fn remote(&self) -> RemoteFlags {
        self.lock().remote
    }

    /// The last load table pushed by the host.
    pub fn load_info_pushed(&self) -> Option<ModemLoadInfo> {
        self.lock().load_info
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HwState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: HwCall) -> std::io::Result<()> {
        self.lock().calls.push(call);
        Ok(())
    }
}

impl HwSync for RecordingHwSync {
    fn lock_read(&self) -> std::io::Result<()> {
        self.record(HwCall::LockRead)
    }

    fn unlock_read(&self) -> std::io::Result<()> {
        self.record(HwCall::UnlockRead)
    }

    fn lock_write(&self) -> std::io::Result<()> {
        self.record(HwCall::LockWrite)
    }

    fn unlock_write(&self) -> std::io::Result<()> {
        self.record(HwCall::UnlockWrite)
    }

    fn load_info(&self) -> std::io::Result<ModemLoadInfo> {
        Ok(self.lock().load_info.unwrap_or_default())
    }

    fn set_load_info(&self, info: &ModemLoadInfo) -> std::io::Result<()> {
        let mut st = self.lock();
        st.calls.push(HwCall::SetLoadInfo);
        st.load_info = Some(*info);
        Ok(())
    }

    fn set_read_region(&self, index: usize) -> std::io::Result<()> {
        self.record(HwCall::SetReadRegion(index))
    }

    fn set_write_region(&self, index: usize) -> std::io::Result<()> {
        self.record(HwCall::SetWriteRegion(index))
    }

    fn remote_flags(&self) -> std::io::Result<RemoteFlags> {
        Ok(self.lock().remote)
    }

    fn set_remote_flags(&self, flags: RemoteFlags) -> std::io::Result<()> {
        let mut st = self.lock();
        st.calls.push(HwCall::SetRemote(flags));
        if flags.is_empty() {
            st.remote = RemoteFlags::empty();
            return Ok(());
        }
        st.remote |= flags;
        let raised = st
            .responses
            .iter()
            .filter(|(on, _)| on.intersects(flags))
            .fold(RemoteFlags::empty(), |acc, (_, raise)| acc | *raise);
        st.remote |= raised;
        Ok(())
    }

    fn clear_remote_flags(&self, flags: RemoteFlags) -> std::io::Result<()> {
        let mut st = self.lock();
        st.calls.push(HwCall::ClearRemote(flags));
        st.remote.remove(flags);
        Ok(())
    }

    fn stop(&self) -> std::io::Result<()> {
        self.record(HwCall::Stop)
    }

    fn start(&self) -> std::io::Result<()> {
        self.record(HwCall::Start)
    }

    fn assert_modem(&self) -> std::io::Result<()> {
        self.record(HwCall::Assert)
    }

    fn reboot_external(&self) -> std::io::Result<()> {
        self.record(HwCall::RebootExternal)
    }

    fn power_on_external(&self) -> std::io::Result<()> {
        self.record(HwCall::PowerOnExternal)
    }

    fn power_off_external(&self) -> std::io::Result<()> {
        self.record(HwCall::PowerOffExternal)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

/// A full daemon context rooted in a temporary directory, with near-zero
/// timings and every platform path pointing inside that directory.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub ctx: Arc<ModemContext>,
    pub props: Arc<MemoryProperties>,
    pub system: Arc<RecordingSystem>,
    pub control: Receiver<ControlRequest>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build the harness, letting `tweak` adjust the config first.
    pub fn with_config(tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("harness tempdir: {e}"),
        };
        let root = dir.path();

        let mut config = DaemonConfig::default();
        config.timings = Timings::immediate();
        let p = &mut config.paths;
        p.cmdline = root.join("cmdline");
        p.sysrq_trigger = root.join("sysrq-trigger");
        p.wake_lock = root.join("wake_lock");
        p.wake_unlock = root.join("wake_unlock");
        p.cptl_dir = root.join("cptl");
        p.pmic_dir = root.join("pmic");
        p.sp_monitor = root.join("sctl_pm");
        p.busmonitor = root.join("sprd_bm");
        p.dmc_mpu = root.join("dmc_mpu");
        p.imei_tty = root.join("stty_imei");
        p.sp_cali_image = root.join("cali_image");
        tweak(&mut config);

        let properties = Arc::new(MemoryProperties::new());
        properties.set(props::LOOP_DEV, &root.join("spipe_lte0").to_string_lossy());
        let system = Arc::new(RecordingSystem::default());
        let (ctx, control) = ModemContext::new(
            config,
            BootMode::Normal,
            Arc::clone(&properties) as Arc<dyn PropertyStore>,
            Arc::clone(&system) as Arc<dyn SystemControl>,
        );
        Self {
            dir,
            ctx,
            props: properties,
            system,
            control,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn bus(&self) -> Arc<ClientBus> {
        match ClientBus::new(Arc::clone(&self.ctx)) {
            Ok(bus) => bus,
            Err(e) => panic!("client bus: {e}"),
        }
    }

    /// Loader over empty tables.
    pub fn loader(&self) -> LoadOrchestrator {
        self.loader_with(TableSet {
            cp: PartitionTable::empty(Subsystem::Cp),
            sp: PartitionTable::empty(Subsystem::Sp),
            dp: PartitionTable::empty(Subsystem::Dp),
        })
    }

    pub fn loader_with(&self, tables: TableSet) -> LoadOrchestrator {
        let env = LoaderEnv {
            state: Arc::clone(&self.ctx.state),
            wake_lock: Arc::clone(&self.ctx.wake_lock),
            debug: Arc::clone(&self.ctx.debug),
            secure: Box::new(PassthroughSecure),
            rescan: Box::new(NoRescan),
            system: Arc::clone(&self.ctx.system),
        };
        LoadOrchestrator::with_tables(&self.ctx.config, tables, env)
    }
}
