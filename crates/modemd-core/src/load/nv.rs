//! Dual-copy NV reconciliation.
//!
//! An NV store is kept twice on flash. Each copy is a 512-byte header
//! sector followed by the payload:
//!
//! ```text
//!  0       4       8          12        16            512
//! +-------+-------+----------+---------+-- ... --+
//! | magic |  len  | checksum | version | padding |  payload[len]
//! +-------+-------+----------+---------+-- ... --+
//! ```
//!
//! [`NvPair::reconcile`] validates both copies, repairs the damaged one from
//! the good one and writes the surviving payload to the CP-visible output.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use bytes::Buf;

use crate::error::NvError;
use crate::hw::DebugInterrupts;

pub const NV_MAGIC: u32 = 0x0000_4e56;
pub const NV_HEADER_SIZE: usize = 512;

static ZEROED: [u8; NV_HEADER_SIZE * 2] = [0; NV_HEADER_SIZE * 2];

/// One's-complement 16-bit sum over little-endian words, 32-bit
/// accumulator. A trailing odd byte is added as-is.
pub fn checksum16(data: &[u8]) -> u16 {
    let mut words = data.chunks_exact(2);
    let mut sum: u32 = 0;
    for w in words.by_ref() {
        sum = sum.wrapping_add(u32::from(u16::from_le_bytes([w[0], w[1]])));
    }
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(u32::from(*last));
    }
    sum = (sum >> 16) + (sum & 0xffff);
    sum = sum.wrapping_add(sum >> 16);
    !(sum as u16)
}

/// [`checksum16`] with a 64-bit accumulator. Differs only for payloads
/// large enough to overflow 32 bits; older firmware wrote either.
pub fn checksum16_wide(data: &[u8]) -> u16 {
    let mut words = data.chunks_exact(2);
    let mut sum: u64 = 0;
    for w in words.by_ref() {
        sum += u64::from(u16::from_le_bytes([w[0], w[1]]));
    }
    if let [last] = words.remainder() {
        sum += u64::from(*last);
    }
    sum = (sum >> 16) + (sum & 0xffff);
    sum += sum >> 16;
    !(sum as u16)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvHeader {
    pub magic: u32,
    pub len: u32,
    pub checksum: u32,
    pub version: u32,
}

impl NvHeader {
    pub fn parse(mut sector: &[u8]) -> Option<Self> {
        if sector.remaining() < 16 {
            return None;
        }
        Some(Self {
            magic: sector.get_u32_le(),
            len: sector.get_u32_le(),
            checksum: sector.get_u32_le(),
            version: sector.get_u32_le(),
        })
    }

    /// Header sector for a payload, checksummed with the 32-bit variant.
    pub fn sector_for(payload: &[u8], version: u32) -> Vec<u8> {
        let mut sector = vec![0u8; NV_HEADER_SIZE];
        sector[0..4].copy_from_slice(&NV_MAGIC.to_le_bytes());
        sector[4..8].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        sector[8..12].copy_from_slice(&u32::from(checksum16(payload)).to_le_bytes());
        sector[12..16].copy_from_slice(&version.to_le_bytes());
        sector
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NvValidity: u8 {
        const PRIMARY = 0b01;
        const BACKUP = 0b10;
    }
}

/// What `reconcile` wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvOutcome {
    /// Both copies damaged; the output got two zeroed header sectors.
    Zeroed,
    /// Backup rebuilt from primary.
    RepairedBackup,
    /// Primary rebuilt from backup.
    RepairedPrimary,
    /// Both copies valid; primary used.
    Intact,
}

impl NvOutcome {
    pub fn status(self) -> NvValidity {
        match self {
            NvOutcome::Zeroed => NvValidity::empty(),
            NvOutcome::RepairedBackup => NvValidity::PRIMARY,
            NvOutcome::RepairedPrimary => NvValidity::BACKUP,
            NvOutcome::Intact => NvValidity::all(),
        }
    }
}

/// One side of the pair as read from disk.
struct NvCopy {
    file: File,
    sector: Vec<u8>,
    payload: Vec<u8>,
    valid: bool,
}

impl NvCopy {
    fn open(path: &Path) -> Result<Self, NvError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| NvError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let mut copy = Self {
            file: file.try_clone().map_err(|source| NvError::Io {
                path: path.to_path_buf(),
                source,
            })?,
            sector: Vec::new(),
            payload: Vec::new(),
            valid: false,
        };
        // Short reads leave the copy invalid, not failed.
        let mut sector = vec![0u8; NV_HEADER_SIZE];
        if file.read_exact(&mut sector).is_err() {
            tracing::debug!(path = %path.display(), "nv header sector short");
            return Ok(copy);
        }
        let Some(header) = NvHeader::parse(&sector) else {
            return Ok(copy);
        };
        let mut payload = Vec::new();
        let read = (&mut file).take(u64::from(header.len)).read_to_end(&mut payload);
        copy.sector = sector;
        if read.is_err() || payload.len() != header.len as usize {
            tracing::debug!(path = %path.display(), want = header.len, got = payload.len(), "nv payload short");
            return Ok(copy);
        }
        let sum = u32::from(checksum16(&payload));
        let wide = u32::from(checksum16_wide(&payload));
        copy.valid = header.magic == NV_MAGIC && (sum == header.checksum || wide == header.checksum);
        if !copy.valid {
            tracing::debug!(
                path = %path.display(),
                magic = header.magic,
                stored = header.checksum,
                computed = sum,
                "nv copy invalid"
            );
        }
        copy.payload = payload;
        Ok(copy)
    }

    fn overwrite(&mut self, sector: &[u8], payload: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(sector)?;
        self.file.write_all(payload)
    }
}

/// Primary, backup and merged-output paths of one logical NV store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPair {
    pub primary: PathBuf,
    pub backup: PathBuf,
    pub output: PathBuf,
}

impl NvPair {
    /// Flash banks are named `<read_path>1` and `<read_path>2`.
    pub fn for_entry(read_path: &Path, write_path: &Path) -> Self {
        let base = read_path.as_os_str().to_string_lossy();
        Self {
            primary: PathBuf::from(format!("{base}1")),
            backup: PathBuf::from(format!("{base}2")),
            output: write_path.to_path_buf(),
        }
    }

    /// Validate both copies, repair as needed and fill the output.
    ///
    /// Failing to repair a damaged copy is logged and tolerated. Failing to
    /// open any of the three files, or to write the output, is an error.
    pub fn reconcile(&self, debug: &DebugInterrupts) -> Result<NvOutcome, NvError> {
        tracing::debug!(
            primary = %self.primary.display(),
            backup = %self.backup.display(),
            output = %self.output.display(),
            "nv reconcile"
        );
        let mut primary = NvCopy::open(&self.primary)?;
        let mut backup = NvCopy::open(&self.backup)?;
        let mut out = OpenOptions::new()
            .write(true)
            .open(&self.output)
            .map_err(|source| NvError::Open {
                path: self.output.clone(),
                source,
            })?;

        let _quiet = debug.suspend();
        let (outcome, payload) = match (primary.valid, backup.valid) {
            (false, false) => {
                tracing::error!(path = %self.primary.display(), "both nv copies damaged, zeroing output");
                (NvOutcome::Zeroed, &ZEROED[..])
            }
            (true, false) => {
                tracing::warn!(path = %self.backup.display(), "nv backup damaged, repairing");
                if let Err(e) = backup.overwrite(&primary.sector, &primary.payload) {
                    tracing::error!(path = %self.backup.display(), error = %e, "repair nv backup");
                }
                (NvOutcome::RepairedBackup, primary.payload.as_slice())
            }
            (false, true) => {
                tracing::warn!(path = %self.primary.display(), "nv primary damaged, repairing");
                if let Err(e) = primary.overwrite(&backup.sector, &backup.payload) {
                    tracing::error!(path = %self.primary.display(), error = %e, "repair nv primary");
                }
                (NvOutcome::RepairedPrimary, backup.payload.as_slice())
            }
            (true, true) => (NvOutcome::Intact, primary.payload.as_slice()),
        };
        out.write_all(payload).map_err(|source| NvError::Io {
            path: self.output.clone(),
            source,
        })?;
        tracing::info!(output = %self.output.display(), ?outcome, bytes = payload.len(), "nv reconciled");
        Ok(outcome)
    }
}
