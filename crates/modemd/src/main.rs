//! Modem control daemon
//!
//! Runs for the lifetime of the system:
//!
//! - Loads the modem images at boot when the kernel left the modem down
//! - Watches the modem, companion and alive devices for lifecycle events
//! - Serves lifecycle messages to local clients over a Unix socket
//! - Recovers asserted or blocked modems by reloading or rebooting them
//! - On external modems, follows driver uevents (warm reset, mini-AP panic)

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use modemd_core::client_bus::{self, ClientBus};
use modemd_core::cmdline::{self, BootMode};
use modemd_core::config::{DaemonConfig, ModemTopology};
use modemd_core::context::ModemContext;
use modemd_core::event::modem_ctrl::ModemCtrlHandler;
use modemd_core::event::netlink::{self, UeventSocket};
use modemd_core::event::EventBus;
use modemd_core::hw::{NoRescan, PcieRescan, SysfsRescan};
use modemd_core::load::{LoadOrchestrator, LoaderEnv, ModemType, PassthroughSecure};
use modemd_core::props::{MemoryProperties, PropertyStore};
use modemd_core::supervisor::Supervisor;
use modemd_core::system::SysrqReboot;

/// Modem control daemon.
#[derive(Parser, Debug)]
#[command(name = "modemd", about = "Boots, monitors and recovers the modem")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Client socket: a filesystem path, or `@name` for the abstract namespace.
    #[arg(long)]
    socket: Option<String>,

    /// Modem attachment: `internal` or `external`.
    #[arg(long)]
    topology: Option<ModemTopology>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Nothing left to do; the daemon must not exit.
fn park_forever() -> ! {
    loop {
        thread::park();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(socket) = cli.socket {
        config.daemon.socket = socket;
    }
    if let Some(topology) = cli.topology {
        config.daemon.topology = topology;
    }

    tracing::info!(
        topology = ?config.daemon.topology,
        socket = %config.daemon.socket,
        pcie = config.daemon.pcie,
        "modemd starting"
    );

    let boot_mode = match cmdline::read(&config.paths.cmdline) {
        Ok(line) => BootMode::detect(&line),
        Err(e) => {
            tracing::error!(path = %config.paths.cmdline.display(), error = %e, "read cmdline");
            BootMode::Normal
        }
    };
    tracing::info!(?boot_mode, "boot mode");
    if boot_mode == BootMode::Recovery {
        tracing::info!("recovery mode, modem left alone");
        park_forever();
    }

    let props = Arc::new(MemoryProperties::with_values(config.properties.clone()));
    let Some(modem) = ModemType::from_props(props.as_ref()) else {
        tracing::error!("modem type property missing, nothing to control");
        park_forever();
    };
    tracing::info!(?modem, "modem type");

    let system = Arc::new(SysrqReboot::new(config.paths.sysrq_trigger.clone()));
    let (ctx, control_rx) = ModemContext::new(
        config,
        boot_mode,
        Arc::clone(&props) as Arc<dyn PropertyStore>,
        system,
    );

    // ── Client bus ──────────────────────────────────────────────
    let listener = client_bus::bind(&ctx.config.daemon.socket)
        .with_context(|| format!("binding {}", ctx.config.daemon.socket))?;
    let bus = ClientBus::new(Arc::clone(&ctx)).context("creating client bus")?;
    bus.start(listener).context("starting client bus")?;

    // ── Loader ──────────────────────────────────────────────────
    let rescan: Box<dyn PcieRescan> = match SysfsRescan::discover(props.as_ref()) {
        Some(r) if ctx.config.daemon.pcie => Box::new(r),
        _ => Box::new(NoRescan),
    };
    let env = LoaderEnv {
        state: Arc::clone(&ctx.state),
        wake_lock: Arc::clone(&ctx.wake_lock),
        debug: Arc::clone(&ctx.debug),
        secure: Box::new(PassthroughSecure),
        rescan,
        system: Arc::clone(&ctx.system),
    };
    let loader = Arc::new(LoadOrchestrator::init(&ctx.config, props.as_ref(), modem, env));

    // ── Control loop ────────────────────────────────────────────
    let supervisor = Supervisor::new(Arc::clone(&ctx), Arc::clone(&bus), Arc::clone(&loader));
    supervisor
        .spawn_control_loop(control_rx)
        .context("starting control loop")?;

    // ── Kernel events (external modems) ─────────────────────────
    if ctx.topology().is_external() {
        let daemon = &ctx.config.daemon;
        let events = Arc::new(
            EventBus::new(daemon.event_handler_capacity, daemon.event_workers, daemon.event_queue)
                .context("creating event bus")?,
        );
        ModemCtrlHandler::new(Arc::clone(&ctx), Arc::clone(&bus), Arc::clone(&loader))
            .register(&events)
            .context("registering modem_ctrl handler")?;
        match UeventSocket::open(netlink::RCVBUF_SIZE) {
            Ok(socket) => netlink::spawn_receiver(events, socket).context("starting uevent receiver")?,
            Err(e) => tracing::error!(error = %e, "uevent socket unavailable"),
        }
    }

    supervisor.boot().context("booting modem")?;
    tracing::info!("modemd running");
    park_forever()
}
