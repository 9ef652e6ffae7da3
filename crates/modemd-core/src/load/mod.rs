//! Image loading: partition tables, container parsing, NV recovery and
//! the orchestrator that sequences them.

pub mod image;
pub mod nv;
pub mod orchestrator;
pub mod partition;

pub use orchestrator::{LoadOrchestrator, LoaderEnv, PassthroughSecure, SecureLoader, TableSet};
pub use partition::{FlagBitmask, LoadTargets, ModemType, PartitionEntry, PartitionTable, Subsystem};
