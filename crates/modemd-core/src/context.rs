//! Shared daemon context.
//!
//! Everything the long-lived threads need is built once at start-up and
//! handed around as an `Arc<ModemContext>`: configuration, the property
//! store, the state machine, the alive timer, platform guards and the
//! sending half of the internal control channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::cmdline::BootMode;
use crate::config::{DaemonConfig, ModemTopology, Timings};
use crate::hw::{DebugInterrupts, WakeLock};
use crate::props::{self, PropertyStore};
use crate::state::{AliveTimer, ModemState, StateMachine};
use crate::system::SystemControl;

/// Requests carried from the client bus to the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// A client reported the modem as unresponsive.
    ModemBlocked,
    /// Reload (or reboot) the modem now.
    ModemReset,
    /// Ask the modem to reset itself, forcing it if it does not.
    PrepareReset,
}

impl ControlRequest {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlRequest::ModemBlocked => "Modem Blocked",
            ControlRequest::ModemReset => "Modem Reset",
            ControlRequest::PrepareReset => "Prepare Reset",
        }
    }
}

// ─── Dump rendezvous ────────────────────────────────────────────────────────

/// One-shot "dump complete" signal between the client reader and a reset
/// waiter. A signal and a timeout both release the waiter.
#[derive(Debug, Default)]
pub struct DumpRendezvous {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DumpRendezvous {
    /// Reset the signal before a waiter is spawned.
    pub fn arm(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn signal(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_all();
    }

    /// Block until signalled or `timeout` passes. Returns whether the
    /// signal arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.done.lock().unwrap_or_else(|e| e.into_inner());
        let (mut guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        let signalled = *guard;
        *guard = false;
        signalled
    }
}

// ─── Context ────────────────────────────────────────────────────────────────

pub struct ModemContext {
    pub config: DaemonConfig,
    pub boot_mode: BootMode,
    pub props: Arc<dyn PropertyStore>,
    pub system: Arc<dyn SystemControl>,
    pub state: Arc<StateMachine>,
    pub alive_timer: AliveTimer,
    pub wake_lock: Arc<WakeLock>,
    pub debug: Arc<DebugInterrupts>,
    pub dump: DumpRendezvous,
    control_tx: Sender<ControlRequest>,
    wait_reset: AtomicBool,
    miniap_panic: AtomicBool,
    suppress_assert: AtomicBool,
}

impl ModemContext {
    /// Build the context and the receiving end of its control channel.
    pub fn new(
        config: DaemonConfig,
        boot_mode: BootMode,
        props: Arc<dyn PropertyStore>,
        system: Arc<dyn SystemControl>,
    ) -> (Arc<Self>, Receiver<ControlRequest>) {
        let (control_tx, control_rx) = unbounded();
        let wake_lock = Arc::new(WakeLock::new(
            config.paths.wake_lock.clone(),
            config.paths.wake_unlock.clone(),
        ));
        let debug = Arc::new(DebugInterrupts::new(
            config.paths.busmonitor.clone(),
            config.paths.dmc_mpu.clone(),
        ));
        let ctx = Arc::new(Self {
            config,
            boot_mode,
            props,
            system,
            state: Arc::new(StateMachine::new()),
            alive_timer: AliveTimer::new(),
            wake_lock,
            debug,
            dump: DumpRendezvous::default(),
            control_tx,
            wait_reset: AtomicBool::new(false),
            miniap_panic: AtomicBool::new(false),
            suppress_assert: AtomicBool::new(false),
        });
        (ctx, control_rx)
    }

    pub fn topology(&self) -> ModemTopology {
        self.config.daemon.topology
    }

    pub fn timings(&self) -> &Timings {
        &self.config.timings
    }

    pub fn request(&self, req: ControlRequest) {
        tracing::debug!(request = req.as_str(), "control request");
        if self.control_tx.send(req).is_err() {
            tracing::error!(request = req.as_str(), "control loop is gone");
        }
    }

    // ─── Policy toggles ─────────────────────────────────────────────────────

    pub fn reset_enabled(&self) -> bool {
        self.props.get_flag(props::MODEM_RESET)
    }

    pub fn save_dump_enabled(&self) -> bool {
        self.props.get_flag(props::SAVE_DUMP)
    }

    pub fn reboot_modem_only(&self) -> bool {
        self.props.get_flag(props::REBOOT_MODEM_ONLY)
    }

    /// A full system dump is pending on the external modem.
    pub fn sysdump_pending(&self) -> bool {
        self.topology().is_external() && self.props.get_or(props::SYSDUMP, "off").contains("on")
    }

    pub fn set_aux_service(&self, running: bool) {
        let key = if running { props::CTL_START } else { props::CTL_STOP };
        self.props.set(key, props::AUX_SERVICE);
    }

    // ─── Latches ────────────────────────────────────────────────────────────

    pub fn set_wait_reset(&self, waiting: bool) {
        self.wait_reset.store(waiting, Ordering::Release);
    }

    pub fn waiting_for_reset(&self) -> bool {
        self.wait_reset.load(Ordering::Acquire)
    }

    /// Record a mini-AP panic; the next prepare-reset reboots the whole
    /// external modem.
    pub fn set_miniap_panic(&self) {
        self.miniap_panic.store(true, Ordering::Release);
    }

    pub fn take_miniap_panic(&self) -> bool {
        self.miniap_panic.swap(false, Ordering::AcqRel)
    }

    /// Hardware quirk: a P-ARM assert is followed by a second, plain assert
    /// for the same fault. Only the first is acted on.
    pub fn suppress_next_assert(&self) {
        self.suppress_assert.store(true, Ordering::Release);
    }

    pub fn take_assert_suppression(&self) -> bool {
        self.suppress_assert.swap(false, Ordering::AcqRel)
    }

    // ─── Terminal actions ───────────────────────────────────────────────────

    /// Enter `RebootSystem`, give the logs a moment to flush, then reboot.
    pub fn reboot_system(&self, reason: &str) {
        self.state.set(ModemState::RebootSystem);
        thread::sleep(self.config.timings.reboot_settle);
        self.system.reboot_system(reason);
    }
}

impl std::fmt::Debug for ModemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModemContext")
            .field("topology", &self.config.daemon.topology)
            .field("boot_mode", &self.boot_mode)
            .field("state", &self.state.get())
            .field("alive_timer", &self.alive_timer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::MemoryProperties;
    use crate::test_util::RecordingSystem;

    fn context(props: MemoryProperties) -> (Arc<ModemContext>, Receiver<ControlRequest>) {
        let mut config = DaemonConfig::default();
        config.timings = Timings::immediate();
        ModemContext::new(
            config,
            BootMode::Normal,
            Arc::new(props),
            Arc::new(RecordingSystem::default()),
        )
    }

    #[test]
    fn rendezvous_times_out_without_signal() {
        let r = DumpRendezvous::default();
        r.arm();
        assert!(!r.wait(Duration::from_millis(10)));
    }

    #[test]
    fn rendezvous_signal_releases_waiter() {
        let r = Arc::new(DumpRendezvous::default());
        r.arm();
        let waiter = {
            let r = Arc::clone(&r);
            thread::spawn(move || r.wait(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        r.signal();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn latches_are_one_shot() {
        let (ctx, _rx) = context(MemoryProperties::new());
        assert!(!ctx.take_miniap_panic());
        ctx.set_miniap_panic();
        assert!(ctx.take_miniap_panic());
        assert!(!ctx.take_miniap_panic());

        ctx.suppress_next_assert();
        assert!(ctx.take_assert_suppression());
        assert!(!ctx.take_assert_suppression());
    }

    #[test]
    fn requests_reach_the_receiver() {
        let (ctx, rx) = context(MemoryProperties::new());
        ctx.request(ControlRequest::PrepareReset);
        assert_eq!(rx.try_recv(), Ok(ControlRequest::PrepareReset));
    }

    #[test]
    fn sysdump_only_counts_on_external_modems() {
        let (ctx, _rx) = context(MemoryProperties::with_values([(props::SYSDUMP, "on")]));
        assert!(!ctx.sysdump_pending());
    }
}
