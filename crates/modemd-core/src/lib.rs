//! Modem lifecycle control.
//!
//! This crate contains:
//! - **State**: the modem state machine and the alive deadline timer
//! - **Monitors**: blocking readers on the modem, companion and alive devices
//! - **Client bus**: the local socket that fans lifecycle messages out to clients
//! - **Loading**: partition tables, image containers, NV recovery and the load orchestrator
//! - **Kernel events**: the uevent bus and the `modem_ctrl` handler
//! - **Supervisor**: start-up loading and the reset control loop

pub mod client_bus;
pub mod cmdline;
pub mod config;
pub mod context;
pub mod diag;
pub mod error;
pub mod event;
pub mod hw;
pub mod load;
pub mod monitor;
pub mod props;
pub mod state;
pub mod supervisor;
pub mod system;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
