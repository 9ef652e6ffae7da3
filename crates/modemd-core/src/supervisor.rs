//! # Supervisor
//!
//! Ties the pieces together once the context, client bus and loader exist:
//! start-up loading, the alive deadline and the control loop that carries
//! reset requests from the client bus to the loader.
//!
//! ```text
//!   client bus ──ControlRequest──► control loop ──► LoadOrchestrator
//!                                       │
//!   alive timer ──expiry──► on_alive_timeout ──► reboot / "not alive"
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crossbeam_channel::Receiver;

use crate::client_bus::{self, ClientBus};
use crate::cmdline;
use crate::config::ModemTopology;
use crate::context::{ControlRequest, ModemContext};
use crate::diag;
use crate::error::LoadError;
use crate::load::{LoadOrchestrator, LoadTargets};
use crate::monitor::{self, DeviceMonitor};
use crate::props;
use crate::state::ModemState;

pub struct Supervisor {
    ctx: Arc<ModemContext>,
    bus: Arc<ClientBus>,
    loader: Arc<LoadOrchestrator>,
}

fn log_load(what: &'static str, res: Result<(), LoadError>) {
    if let Err(e) = res {
        tracing::error!(error = %e, what, "load pass failed");
    }
}

impl Supervisor {
    pub fn new(ctx: Arc<ModemContext>, bus: Arc<ClientBus>, loader: Arc<LoadOrchestrator>) -> Arc<Self> {
        Arc::new(Self { ctx, bus, loader })
    }

    pub fn loader(&self) -> &Arc<LoadOrchestrator> {
        &self.loader
    }

    // ─── Alive deadline ─────────────────────────────────────────────────────

    /// Arm the alive timer, and the tty watcher on boards without a
    /// dedicated alive device.
    pub fn arm_alive_timer(self: &Arc<Self>) {
        if self.ctx.state.get() == ModemState::RebootSystem {
            return;
        }
        let weak = Arc::downgrade(self);
        let armed = self.ctx.alive_timer.start(self.ctx.timings().alive_timeout, move || {
            if let Some(sup) = weak.upgrade() {
                sup.on_alive_timeout();
            }
        });
        if let Err(e) = armed {
            tracing::error!(error = %e, "arm alive timer");
            return;
        }
        if let Err(e) = monitor::spawn_alive_watcher(Arc::clone(&self.ctx), Arc::clone(&self.bus)) {
            tracing::error!(error = %e, "spawn alive watcher");
        }
    }

    /// The modem missed its alive deadline.
    pub fn on_alive_timeout(&self) {
        let ctx = &self.ctx;
        if ctx.state.get() == ModemState::Alive {
            return;
        }
        tracing::error!("modem not alive in time");
        // Let the logs reach storage first.
        thread::sleep(ctx.timings().alive_settle);

        if ctx.reset_enabled() && !ctx.sysdump_pending() {
            ctx.reboot_system("modem not alive");
        } else {
            ctx.state.set(ModemState::Assert);
            self.bus.broadcast(client_bus::MODEM_NOT_ALIVE.as_bytes());
        }
    }

    // ─── Control loop ───────────────────────────────────────────────────────

    pub fn spawn_control_loop(self: &Arc<Self>, rx: Receiver<ControlRequest>) -> io::Result<()> {
        let sup = Arc::clone(self);
        thread::Builder::new()
            .name("modem-control".into())
            .spawn(move || {
                for req in rx.iter() {
                    sup.handle(req);
                }
                tracing::warn!("control channel closed");
            })
            .map_err(io::Error::other)?;
        Ok(())
    }

    /// Act on one control request. Holds the wake lock throughout.
    pub fn handle(self: &Arc<Self>, req: ControlRequest) {
        let ctx = &self.ctx;
        let _wake = ctx.wake_lock.acquire("control request");
        tracing::info!(request = req.as_str(), state = %ctx.state.get(), "control request");

        if req == ControlRequest::ModemBlocked {
            ctx.state.set(ModemState::Block);
            if ctx.save_dump_enabled() {
                self.loader.assert_modem();
            }
        }

        if !ctx.state.get().accepts_reset() {
            tracing::info!(state = %ctx.state.get(), "not blocked or asserted, request skipped");
            return;
        }

        match req {
            ControlRequest::ModemBlocked => {}
            ControlRequest::ModemReset => self.reset_modem(),
            ControlRequest::PrepareReset => self.prepare_reset(),
        }
    }

    fn reset_modem(self: &Arc<Self>) {
        let ctx = &self.ctx;
        ctx.alive_timer.stop();
        match ctx.topology() {
            ModemTopology::External if !ctx.reboot_modem_only() => {
                log_load("reboot external", self.loader.reboot_external());
            }
            _ => log_load("modem", self.loader.load(LoadTargets::MODEM)),
        }
        self.arm_alive_timer();
    }

    fn force_reset(self: &Arc<Self>) {
        let ctx = &self.ctx;
        ctx.alive_timer.stop();
        match ctx.topology() {
            ModemTopology::External => log_load("reboot external", self.loader.reboot_external()),
            ModemTopology::Internal => log_load("modem", self.loader.load(LoadTargets::MODEM)),
        }
        self.arm_alive_timer();
    }

    fn prepare_reset(self: &Arc<Self>) {
        let ctx = &self.ctx;
        if ctx.topology().is_external() {
            // A mini-AP panic always takes the whole chip down.
            let panic = ctx.take_miniap_panic();
            if panic || !ctx.reboot_modem_only() {
                tracing::info!(panic, "rebooting external modem");
                ctx.alive_timer.stop();
                log_load("reboot external", self.loader.reboot_external());
                self.arm_alive_timer();
                return;
            }
        }

        if !self.request_self_reset() {
            tracing::warn!("diag reset not sent, forcing reset");
            ctx.set_wait_reset(false);
            self.force_reset();
            return;
        }

        let timings = ctx.timings();
        let started = Instant::now();
        while ctx.waiting_for_reset() && started.elapsed() < timings.reset_wait {
            thread::sleep(timings.reset_poll);
        }
        if ctx.waiting_for_reset() {
            tracing::warn!(
                waited_ms = started.elapsed().as_millis() as u64,
                "modem did not reset itself, forcing reset"
            );
            ctx.set_wait_reset(false);
            self.force_reset();
        }
    }

    /// Drain the log channel and ask the CP to reset through diag. Returns
    /// whether the command went out.
    fn request_self_reset(&self) -> bool {
        let ctx = &self.ctx;
        let diag_dev = ctx.props.get_or(props::DIAG_DEV, "not_find");
        let log_dev = ctx.props.get_or(props::LOG_DEV, "not_find");
        let idle = ctx.timings().log_drain_idle;

        let drained = diag::drain_log(Path::new(&log_dev), idle).or_else(|e| {
            tracing::debug!(log = %log_dev, error = %e, "log channel unavailable, draining diag");
            diag::drain_log(Path::new(&diag_dev), idle)
        });
        if let Err(e) = drained {
            tracing::error!(error = %e, "drain log channel");
        }

        ctx.set_wait_reset(true);
        match diag::send_reset_command(Path::new(&diag_dev)) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(diag = %diag_dev, error = %e, "send diag reset");
                false
            }
        }
    }

    // ─── Start-up ───────────────────────────────────────────────────────────

    /// The modem is already running when its companion device or first tty
    /// channel opens.
    pub fn modem_already_booted(&self) -> bool {
        let ctx = &self.ctx;
        let sp = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&ctx.config.paths.sp_monitor);
        if sp.is_ok() {
            return true;
        }
        let tty = format!("{}0", ctx.props.get_or(props::TTY_DEV, "not_find"));
        File::open(&tty).is_ok()
    }

    /// Load the images when the kernel left the modem shut down, start the
    /// monitors and arm the alive deadline.
    pub fn boot(self: &Arc<Self>) -> io::Result<()> {
        let ctx = &self.ctx;
        let booted = self.modem_already_booted();
        let shutdown = match cmdline::read(&ctx.config.paths.cmdline) {
            Ok(line) => cmdline::modem_param(&line) == Some("shutdown"),
            Err(e) => {
                tracing::error!(path = %ctx.config.paths.cmdline.display(), error = %e, "read cmdline");
                false
            }
        };
        tracing::info!(booted, shutdown, "modem boot");
        if shutdown && !booted {
            log_load("all", self.loader.load(LoadTargets::ALL));
        }

        monitor::spawn_sp_monitor(Arc::clone(ctx), Arc::clone(&self.bus))?;
        DeviceMonitor::new(Arc::clone(ctx), Arc::clone(&self.bus)).spawn()?;

        if !booted {
            self.arm_alive_timer();
        }
        Ok(())
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("ctx", &self.ctx)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sync::RemoteFlags;
    use crate::load::{FlagBitmask, PartitionEntry, PartitionTable, Subsystem, TableSet};
    use crate::props::PropertyStore;
    use crate::test_util::{Harness, HwCall, RecordingHwSync};
    use std::fs;
    use std::time::Duration;

    fn supervisor(h: &Harness) -> Arc<Supervisor> {
        Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader()))
    }

    /// A CP table with one modem image and proc-style stop/start files.
    fn modem_tables(h: &Harness) -> TableSet {
        fs::write(h.path("src_modem"), b"CODE").unwrap();
        fs::write(h.path("dst_modem"), b"").unwrap();
        fs::write(h.path("start"), b"").unwrap();
        fs::write(h.path("stop"), b"").unwrap();
        let mut cp = PartitionTable::empty(Subsystem::Cp);
        cp.entries = vec![PartitionEntry {
            name: "modem".into(),
            read_path: h.path("src_modem"),
            write_path: h.path("dst_modem"),
            address: 0,
            size: 4,
            flags: FlagBitmask::MODEM,
        }];
        cp.externally_described = true;
        cp.driver_ok = true;
        cp.start_path = Some(h.path("start"));
        cp.stop_path = Some(h.path("stop"));
        TableSet {
            cp,
            sp: PartitionTable::empty(Subsystem::Sp),
            dp: PartitionTable::empty(Subsystem::Dp),
        }
    }

    // ─── Alive deadline ─────────────────────────────────────────────────────

    #[test]
    fn timeout_after_alive_is_noop() {
        let h = Harness::new();
        h.props.set(props::MODEM_RESET, "1");
        h.ctx.state.set(ModemState::Alive);
        supervisor(&h).on_alive_timeout();
        assert_eq!(h.ctx.state.get(), ModemState::Alive);
        assert!(h.system.reboots().is_empty());
    }

    #[test]
    fn timeout_with_reset_reboots_system() {
        let h = Harness::new();
        h.props.set(props::MODEM_RESET, "1");
        h.ctx.state.set(ModemState::Booting);
        supervisor(&h).on_alive_timeout();
        assert_eq!(h.ctx.state.get(), ModemState::RebootSystem);
        assert_eq!(h.system.reboots().len(), 1);
    }

    #[test]
    fn timeout_without_reset_reports_not_alive() {
        let h = Harness::new();
        h.ctx.state.set(ModemState::Booting);
        supervisor(&h).on_alive_timeout();
        assert_eq!(h.ctx.state.get(), ModemState::Assert);
        assert!(h.system.reboots().is_empty());
    }

    #[test]
    fn pending_sysdump_defers_to_clients() {
        let h = Harness::with_config(|c| c.daemon.topology = ModemTopology::External);
        h.props.set(props::MODEM_RESET, "1");
        h.props.set(props::SYSDUMP, "on");
        h.ctx.state.set(ModemState::Booting);
        supervisor(&h).on_alive_timeout();
        assert_eq!(h.ctx.state.get(), ModemState::Assert);
        assert!(h.system.reboots().is_empty());
    }

    #[test]
    fn armed_timer_fires_timeout_handler() {
        let h = Harness::new();
        h.props.set(props::ALIVE_DEV, "/dev/alive");
        h.ctx.state.set(ModemState::Booting);
        let sup = supervisor(&h);
        sup.arm_alive_timer();
        let deadline = Instant::now() + Duration::from_secs(2);
        while h.ctx.state.get() != ModemState::Assert && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(h.ctx.state.get(), ModemState::Assert);
    }

    // ─── Control requests ───────────────────────────────────────────────────

    #[test]
    fn reset_ignored_while_running() {
        let h = Harness::new();
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(modem_tables(&h))));
        h.ctx.state.set(ModemState::Alive);
        sup.handle(ControlRequest::ModemReset);
        assert_eq!(fs::read(h.path("dst_modem")).unwrap(), b"");
        assert_eq!(h.ctx.state.get(), ModemState::Alive);
    }

    #[test]
    fn internal_reset_reloads_modem_and_rearms() {
        let h = Harness::new();
        h.props.set(props::ALIVE_DEV, "/dev/alive");
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(modem_tables(&h))));
        h.ctx.state.set(ModemState::Assert);
        sup.handle(ControlRequest::ModemReset);
        assert_eq!(fs::read(h.path("dst_modem")).unwrap(), b"CODE");
        assert_eq!(h.ctx.state.get(), ModemState::Booting);
        assert!(h.ctx.alive_timer.is_armed());
        h.ctx.alive_timer.stop();
    }

    #[test]
    fn blocked_sets_block_and_asserts_for_dump() {
        let h = Harness::new();
        h.props.set(props::SAVE_DUMP, "1");
        let hw = RecordingHwSync::new(&h.path("ctl"));
        let mut tables = modem_tables(&h);
        tables.cp.ioctl = Some(hw.clone());
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(tables)));

        h.ctx.state.set(ModemState::Assert);
        sup.handle(ControlRequest::ModemBlocked);
        assert_eq!(h.ctx.state.get(), ModemState::Block);
        assert!(hw.calls().contains(&HwCall::Assert));
    }

    #[test]
    fn prepare_reset_sends_diag_command_and_waits() {
        let h = Harness::new();
        h.props.set(props::ALIVE_DEV, "/dev/alive");
        let diag_dev = h.path("diag");
        fs::write(&diag_dev, b"").unwrap();
        h.props.set(props::DIAG_DEV, diag_dev.to_str().unwrap());
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(modem_tables(&h))));
        h.ctx.state.set(ModemState::Assert);

        // The monitor sees "Modem Reset" while the supervisor waits.
        let ctx = Arc::clone(&h.ctx);
        let monitor = thread::spawn(move || {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !ctx.waiting_for_reset() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            ctx.set_wait_reset(false);
        });
        sup.handle(ControlRequest::PrepareReset);
        monitor.join().unwrap();

        assert_eq!(fs::read(&diag_dev).unwrap(), diag::RESET_COMMAND);
    }

    #[test]
    fn prepare_reset_forces_reload_when_diag_missing() {
        let h = Harness::new();
        h.props.set(props::ALIVE_DEV, "/dev/alive");
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(modem_tables(&h))));
        h.ctx.state.set(ModemState::Assert);
        sup.handle(ControlRequest::PrepareReset);
        assert_eq!(fs::read(h.path("dst_modem")).unwrap(), b"CODE");
        assert!(!h.ctx.waiting_for_reset());
        h.ctx.alive_timer.stop();
    }

    // Hardware quirk: a mini-AP panic overrides the reboot-modem-only policy
    // for one reset.
    #[test]
    fn miniap_panic_forces_external_reboot_once() {
        let h = Harness::with_config(|c| c.daemon.topology = ModemTopology::External);
        h.props.set(props::ALIVE_DEV, "/dev/alive");
        h.props.set(props::REBOOT_MODEM_ONLY, "1");
        let hw = RecordingHwSync::new(&h.path("ctl"));
        hw.respond(RemoteFlags::SPL_DONE, RemoteFlags::DDR_READY);
        let mut cp = PartitionTable::empty(Subsystem::Cp);
        cp.externally_described = true;
        cp.ioctl = Some(hw.clone());
        let tables = TableSet {
            cp,
            sp: PartitionTable::empty(Subsystem::Sp),
            dp: PartitionTable::empty(Subsystem::Dp),
        };
        let sup = Supervisor::new(Arc::clone(&h.ctx), h.bus(), Arc::new(h.loader_with(tables)));

        h.ctx.set_miniap_panic();
        h.ctx.state.set(ModemState::Assert);
        sup.handle(ControlRequest::PrepareReset);
        assert!(hw.calls().contains(&HwCall::RebootExternal));
        assert!(!h.ctx.take_miniap_panic());
        h.ctx.alive_timer.stop();
    }

    // ─── Start-up ───────────────────────────────────────────────────────────

    #[test]
    fn open_companion_means_already_booted() {
        let h = Harness::new();
        let sup = supervisor(&h);
        assert!(!sup.modem_already_booted());
        fs::write(&h.ctx.config.paths.sp_monitor, b"").unwrap();
        assert!(sup.modem_already_booted());
    }
}
