//! Error types shared across the lifecycle components.
//!
//! Each concern gets its own enum so callers can match on the failure they
//! care about. None of these cross a thread boundary as a panic: every
//! public operation hands them back as a `Result`.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure while moving image bytes into device memory.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("short write to {path}: wrote {written} of {expected} bytes")]
    ShortWrite {
        path: PathBuf,
        written: usize,
        expected: usize,
    },
    #[error("write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("seek {path} to {offset:#x}: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("hardware control command {command} failed: {source}")]
    Control {
        command: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("remote flag {flags:#x} not observed within {waited_ms} ms")]
    RemoteFlagTimeout { flags: u32, waited_ms: u64 },
    #[error("pcie rescan failed: {0}")]
    Rescan(#[source] io::Error),
    #[error("{0} table has no control channel")]
    NoControlChannel(&'static str),
    #[error("no boot code available from image header")]
    MissingBootCode,
    #[error("secure verification of {name} failed")]
    Verify { name: String },
    #[error("kernel command line unavailable: {0}")]
    Cmdline(String),
    #[error(transparent)]
    Nv(#[from] NvError),
}

/// Failure parsing a firmware container or embedded header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("container has no terminating block")]
    MissingLast,
    #[error("container has no modem binary block")]
    MissingModemBlock,
    #[error("unknown header magic {0:#010x}")]
    UnknownMagic(u32),
    #[error("header describes no regions")]
    NoRegions,
}

/// NV reconciliation could not complete.
///
/// Checksum mismatches are never reported here: they are resolved by the
/// reconciliation policy. Only I/O on the files themselves surfaces.
#[derive(Debug, Error)]
pub enum NvError {
    #[error("open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventBusError {
    #[error("handler for subsystem {0:?} already registered")]
    Duplicate(String),
    #[error("handler table full ({0} entries)")]
    Full(usize),
    #[error("no handler registered for subsystem {0:?}")]
    NotRegistered(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
