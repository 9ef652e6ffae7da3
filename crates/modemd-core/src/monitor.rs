//! # Device monitors
//!
//! Blocking readers on the modem's notification devices. They are the
//! primary source of state transitions:
//!
//! - [`DeviceMonitor`] multiplexes the assert device (mandatory), the
//!   watchdog interrupt device (internal modems only) and a dedicated alive
//!   device when the board has one.
//! - [`spawn_sp_monitor`] watches the companion processor for P-ARM asserts.
//! - [`spawn_alive_watcher`] covers legacy boards that report "Modem Alive"
//!   on the first tty channel, for as long as the alive timer is armed.
//!
//! Each read-and-dispatch cycle holds the wake lock.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::client_bus::{self, ClientBus};
use crate::cmdline::BootMode;
use crate::config::{ModemTopology, Timings};
use crate::context::ModemContext;
use crate::hw::poll;
use crate::props::{self, PropertyStore};
use crate::state::ModemState;

const WATCHDOG_SUFFIX: &str = "wdtirq";
const MONITOR_READ_BUF: usize = 256;
const SP_READ_BUF: usize = 128;
const WATCHDOG_ON: &[u8] = b"watchdog on";

// ─── Device discovery ───────────────────────────────────────────────────────

/// The device that reports "Modem Alive". Boards with a dedicated alive
/// node name it in a property; older boards use the first tty channel.
/// The flag tells which of the two was found.
pub fn alive_device(props: &dyn PropertyStore) -> (PathBuf, bool) {
    match props.get(props::ALIVE_DEV).filter(|v| !v.is_empty()) {
        Some(dev) => (PathBuf::from(dev), true),
        None => {
            let tty = props.get_or(props::TTY_DEV, "not_find");
            (PathBuf::from(format!("{tty}0")), false)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorDevices {
    pub assert: PathBuf,
    pub watchdog: Option<PathBuf>,
    pub alive: Option<PathBuf>,
}

impl MonitorDevices {
    pub fn discover(props: &dyn PropertyStore, topology: ModemTopology) -> Self {
        let assert = PathBuf::from(props.get_or(props::ASSERT_DEV, "not_find"));
        let watchdog = match topology {
            ModemTopology::Internal => {
                let base = props.get_or(props::MODEM_DEV, "not_find");
                Some(PathBuf::from(format!("{base}{WATCHDOG_SUFFIX}")))
            }
            ModemTopology::External => None,
        };
        let (alive_dev, dedicated) = alive_device(props);
        let alive = (dedicated && alive_dev != assert).then_some(alive_dev);
        Self {
            assert,
            watchdog,
            alive,
        }
    }
}

/// Open `path` for read/write, retrying quickly for the fast window and
/// then slowly forever. The node may appear late in boot.
pub fn open_with_backoff(path: &Path, timings: &Timings) -> File {
    let started = Instant::now();
    let mut warned = false;
    loop {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => {
                tracing::info!(path = %path.display(), "device opened");
                return f;
            }
            Err(e) => {
                if started.elapsed() < timings.open_fast_window {
                    thread::sleep(timings.open_fast_retry);
                } else {
                    if !warned {
                        tracing::error!(path = %path.display(), error = %e, "device still missing");
                        warned = true;
                    }
                    thread::sleep(timings.open_slow_retry);
                }
            }
        }
    }
}

fn open_optional(path: &Path, what: &'static str) -> Option<File> {
    match File::open(path) {
        Ok(f) => Some(f),
        Err(e) => {
            tracing::info!(path = %path.display(), error = %e, what, "optional device unavailable");
            None
        }
    }
}

fn read_once(file: &File, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match (&*file).read(buf) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

// ─── Modem monitor ──────────────────────────────────────────────────────────

pub struct DeviceMonitor {
    ctx: Arc<ModemContext>,
    bus: Arc<ClientBus>,
    devices: MonitorDevices,
}

impl DeviceMonitor {
    pub fn new(ctx: Arc<ModemContext>, bus: Arc<ClientBus>) -> Self {
        let devices = MonitorDevices::discover(ctx.props.as_ref(), ctx.topology());
        Self::with_devices(ctx, bus, devices)
    }

    pub fn with_devices(ctx: Arc<ModemContext>, bus: Arc<ClientBus>, devices: MonitorDevices) -> Self {
        Self { ctx, bus, devices }
    }

    pub fn devices(&self) -> &MonitorDevices {
        &self.devices
    }

    pub fn spawn(self) -> io::Result<()> {
        thread::Builder::new()
            .name("modem-monitor".into())
            .spawn(move || self.run())
            .map_err(io::Error::other)?;
        Ok(())
    }

    fn run(&self) {
        let timings = self.ctx.timings();
        let assert = open_with_backoff(&self.devices.assert, timings);
        let mut files = vec![assert];
        if let Some(wdt) = &self.devices.watchdog {
            files.extend(open_optional(wdt, "watchdog"));
        }
        if let Some(alive) = &self.devices.alive {
            files.extend(open_optional(alive, "alive"));
        }
        let fds: Vec<RawFd> = files.iter().map(AsRawFd::as_raw_fd).collect();
        let mut buf = [0u8; MONITOR_READ_BUF];

        tracing::info!(devices = files.len(), topology = ?self.ctx.topology(), "modem monitor running");
        loop {
            let ready = match poll::wait_readable(&fds, None) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "monitor poll");
                    thread::sleep(timings.read_error_backoff);
                    continue;
                }
            };
            // Devices are served in priority order: assert, watchdog, alive.
            let Some(index) = ready.iter().position(|r| *r) else {
                thread::sleep(timings.read_error_backoff);
                continue;
            };

            let _wake = self.ctx.wake_lock.acquire("modem monitor");
            match read_once(&files[index], &mut buf[..MONITOR_READ_BUF - 1]) {
                Ok(n) if n > 0 => self.handle(&buf[..n]),
                Ok(_) => {
                    tracing::warn!(fd = fds[index], "monitor read returned nothing");
                    thread::sleep(timings.read_error_backoff);
                }
                Err(e) => {
                    tracing::error!(fd = fds[index], error = %e, "monitor read");
                    thread::sleep(timings.read_error_backoff);
                }
            }
        }
    }

    /// Apply one notification read from a modem device.
    pub fn handle(&self, raw: &[u8]) {
        let ctx = &self.ctx;
        let msg = client_bus::message_text(raw);
        tracing::info!(msg = %msg, "modem notification");
        let external = ctx.topology().is_external();

        if msg.contains(client_bus::MODEM_ALIVE) {
            ctx.alive_timer.stop();
            ctx.state.set(ModemState::Alive);
            if external {
                self.bus.broadcast(client_bus::MODEM_ALIVE.as_bytes());
            } else {
                self.bus.broadcast(raw);
            }
        } else if msg.contains(client_bus::MODEM_RESET) {
            ctx.state.set(ModemState::Reset);
            ctx.set_wait_reset(false);
            if external {
                self.bus.broadcast(client_bus::MODEM_RESET.as_bytes());
            }
        } else if let Some(pos) = msg.find(client_bus::MODEM_ASSERT) {
            ctx.state.set(ModemState::Assert);
            if msg.contains(client_bus::HUNG) && ctx.reset_enabled() {
                tracing::error!("cp or dsp hung with reset policy on");
                ctx.reboot_system("modem hung");
            }
            if external {
                self.bus.broadcast(msg[pos..].as_bytes());
            } else {
                self.bus.broadcast(raw);
            }
        }
    }
}

// ─── Companion (SP) monitor ─────────────────────────────────────────────────

/// Watch the companion processor. Returns without spawning when the board
/// has no companion device.
pub fn spawn_sp_monitor(ctx: Arc<ModemContext>, bus: Arc<ClientBus>) -> io::Result<()> {
    thread::Builder::new()
        .name("sp-monitor".into())
        .spawn(move || {
            if let Some(file) = open_sp_device(&ctx) {
                run_sp(&ctx, &bus, file);
            }
        })
        .map_err(io::Error::other)?;
    Ok(())
}

fn open_sp_device(ctx: &ModemContext) -> Option<File> {
    let path = &ctx.config.paths.sp_monitor;
    let timings = ctx.timings();
    let mut last_err = None;
    for _ in 0..timings.sp_open_attempts {
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => return Some(f),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no companion processor");
                return None;
            }
            Err(e) => last_err = Some(e),
        }
        thread::sleep(timings.sp_open_interval);
    }
    if let Some(e) = last_err {
        tracing::error!(path = %path.display(), error = %e, "open companion monitor");
    }
    None
}

/// Production builds ask the companion to arm its watchdog.
pub fn enable_sp_watchdog(ctx: &ModemContext, mut device: &File) {
    if ctx.props.get_flag(props::DEBUGGABLE) {
        return;
    }
    if ctx.props.get_or(props::SP_WATCHDOG, "on") == "off" {
        return;
    }
    tracing::info!("enabling companion watchdog");
    if let Err(e) = device.write_all(WATCHDOG_ON) {
        tracing::error!(error = %e, "companion watchdog");
    }
}

fn run_sp(ctx: &ModemContext, bus: &ClientBus, file: File) {
    enable_sp_watchdog(ctx, &file);
    let fd = file.as_raw_fd();
    let mut buf = [0u8; SP_READ_BUF];
    loop {
        match poll::readable(fd, None) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(error = %e, "companion poll");
                return;
            }
        }
        let _wake = ctx.wake_lock.acquire("sp monitor");
        match read_once(&file, &mut buf[..SP_READ_BUF - 1]) {
            Ok(n) if n > 0 => handle_sp_message(ctx, bus, &buf[..n]),
            Ok(_) => thread::sleep(ctx.timings().read_error_backoff),
            Err(e) => {
                tracing::error!(error = %e, "companion read");
                thread::sleep(ctx.timings().read_error_backoff);
            }
        }
    }
}

/// Only P-ARM asserts matter from the companion.
pub fn handle_sp_message(ctx: &ModemContext, bus: &ClientBus, raw: &[u8]) {
    let msg = client_bus::message_text(raw);
    tracing::debug!(msg = %msg, "companion message");
    if !msg.contains(client_bus::P_ARM_ASSERT) {
        return;
    }
    if ctx.reset_enabled() {
        tracing::error!("p-arm assert with reset policy on");
        ctx.reboot_system("p-arm assert");
    }
    if ctx.boot_mode != BootMode::Calibration {
        bus.broadcast(raw);
    }
}

// ─── Legacy alive watcher ───────────────────────────────────────────────────

/// Spawn the tty alive watcher when the board has no dedicated alive
/// device. It exits once the alive timer is disarmed.
pub fn spawn_alive_watcher(ctx: Arc<ModemContext>, bus: Arc<ClientBus>) -> io::Result<bool> {
    let (dev, dedicated) = alive_device(ctx.props.as_ref());
    if dedicated {
        return Ok(false);
    }
    thread::Builder::new()
        .name("alive-watch".into())
        .spawn(move || watch_alive(&ctx, &bus, &dev))
        .map_err(io::Error::other)?;
    Ok(true)
}

fn watch_alive(ctx: &ModemContext, bus: &ClientBus, dev: &Path) {
    let timings = ctx.timings();
    let started = Instant::now();
    let file = loop {
        match File::open(dev) {
            Ok(f) => break f,
            Err(e) => {
                if !ctx.alive_timer.is_armed() || started.elapsed() >= timings.open_fast_window {
                    tracing::error!(dev = %dev.display(), error = %e, "alive tty unavailable");
                    return;
                }
                thread::sleep(timings.open_fast_retry);
            }
        }
    };

    tracing::debug!(dev = %dev.display(), "watching for alive");
    let mut buf = [0u8; SP_READ_BUF];
    while ctx.alive_timer.is_armed() {
        match poll::readable(file.as_raw_fd(), Some(Duration::from_secs(1))) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) => {
                tracing::debug!(error = %e, "alive poll");
                thread::sleep(timings.read_error_backoff);
                continue;
            }
        }
        if !ctx.alive_timer.is_armed() {
            break;
        }
        match read_once(&file, &mut buf[..SP_READ_BUF - 1]) {
            Ok(n) if n > 0 => {
                if client_bus::message_text(&buf[..n]).contains(client_bus::MODEM_ALIVE) {
                    ctx.alive_timer.stop();
                    ctx.state.set(ModemState::Alive);
                    bus.broadcast(client_bus::MODEM_ALIVE.as_bytes());
                    return;
                }
            }
            Ok(_) => thread::sleep(timings.read_error_backoff),
            Err(e) => {
                tracing::warn!(dev = %dev.display(), error = %e, "alive read");
                thread::sleep(timings.read_error_backoff);
            }
        }
    }
}
