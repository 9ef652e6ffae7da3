pub mod pcie;
pub mod poll;
pub mod power;
pub mod sync;

pub use pcie::{NoRescan, PcieRescan, SysfsRescan};
pub use power::{DebugInterrupts, WakeLock};
pub use sync::{HwSync, IoctlChannel, ModemLoadInfo, RemoteFlags};
