//! Handler for `modem_ctrl` uevents raised by the external modem driver.

use std::sync::Arc;

use super::{EventBus, EventHandler, UEvent};
use crate::client_bus::{self, ClientBus};
use crate::context::ModemContext;
use crate::error::EventBusError;
use crate::load::LoadOrchestrator;
use crate::state::ModemState;

pub const SUBSYSTEM: &str = "modem_ctrl";

/// `MODEM_STAT` values reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemStatus {
    PowerOff,
    PowerOn,
    WarmReset,
    ColdReset,
    CrashCp,
    CpCrash,
    CpPowerOff,
}

impl ModemStatus {
    pub fn from_raw(stat: i32) -> Option<Self> {
        Some(match stat {
            0 => Self::PowerOff,
            1 => Self::PowerOn,
            2 => Self::WarmReset,
            3 => Self::ColdReset,
            4 => Self::CrashCp,
            5 => Self::CpCrash,
            6 => Self::CpPowerOff,
            _ => return None,
        })
    }
}

pub struct ModemCtrlHandler {
    ctx: Arc<ModemContext>,
    bus: Arc<ClientBus>,
    loader: Arc<LoadOrchestrator>,
}

impl ModemCtrlHandler {
    pub fn new(ctx: Arc<ModemContext>, bus: Arc<ClientBus>, loader: Arc<LoadOrchestrator>) -> Self {
        Self { ctx, bus, loader }
    }

    /// Register on `events` under [`SUBSYSTEM`].
    pub fn register(self, events: &EventBus) -> Result<(), EventBusError> {
        events.register(SUBSYSTEM, Arc::new(self))
    }

    fn on_panic(&self) {
        let ctx = &self.ctx;
        tracing::error!("mini-ap panic");
        ctx.set_miniap_panic();
        let prev = ctx.state.set(ModemState::Assert);
        // A blocked modem panics the mini-AP on purpose; clients already know.
        if prev != ModemState::Block {
            let msg = format!("{}: {}", client_bus::MODEM_ASSERT, client_bus::MINIAP_PANIC);
            self.bus.broadcast(msg.as_bytes());
        }
        if let Err(e) = self.loader.rescan_endpoint() {
            tracing::error!(error = %e, "rescan after panic");
        }
    }
}

impl EventHandler for ModemCtrlHandler {
    fn handle(&self, event: &UEvent) {
        tracing::info!(action = %event.action, stat = event.modem_stat, "modem_ctrl event");
        if event.action != "change" {
            return;
        }
        match ModemStatus::from_raw(event.modem_stat) {
            Some(ModemStatus::WarmReset) => {
                tracing::info!("warm reset, reloading spl");
                if let Err(e) = self.loader.load_spl() {
                    tracing::error!(error = %e, "warm reset load");
                }
            }
            Some(ModemStatus::CpCrash) => self.on_panic(),
            Some(status) => tracing::debug!(?status, "modem_ctrl status ignored"),
            None => tracing::debug!(stat = event.modem_stat, "unknown modem_ctrl status"),
        }
    }
}
