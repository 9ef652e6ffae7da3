//! Firmware container and embedded-header parsing.
//!
//! Two formats live here.
//!
//! ## SCI container
//!
//! ```text
//!  0        4        8        12
//! +--------+--------+--------+
//! | "SCI1" |   (block 0)     |   12-byte blocks, little endian
//! +--------+--------+--------+
//! | type   | offset | length |   blocks 1..=10
//! +--------+--------+--------+
//! ```
//!
//! `type & 0xff == 1` marks the modem binary, bit `0x400` a prepended
//! 20-byte SHA1 and bit `0x100` the last block. Anything that is not a
//! well-formed container is loaded whole.
//!
//! ## Decoupling header
//!
//! The first 0x600 bytes of the modem binary describe where each region
//! lives in CP memory, in either the legacy (`MECP`) or descriptor (`CPHD`)
//! layout. [`apply_header`] folds that table into the CP partition table.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Buf;

use crate::error::ImageError;
use crate::load::partition::{FlagBitmask, MODEM_BANK, PartitionEntry, PartitionTable};

// ─── Constants ──────────────────────────────────────────────────────────────

pub const SCI_MAGIC: &[u8; 4] = b"SCI1";
const SCI_BLOCK_LEN: usize = 12;
const SCI_BLOCKS: usize = 11;
pub const SCI_HEADER_LEN: usize = SCI_BLOCK_LEN * SCI_BLOCKS;
const SCI_TYPE_MODEM_BIN: u32 = 1;
const SCI_LAST: u32 = 0x100;
const SCI_SHA1: u32 = 0x400;
const SHA1_LEN: u32 = 20;

pub const HEADER_LEN: usize = 0x600;
pub const OLD_HEAD_MAGIC: u32 = 0x5043_454D;
pub const NEW_HEAD_MAGIC: u32 = 0x4448_5043;
const NAME_LEN: usize = 20;
const MAX_HEAD_REGIONS: usize = 12;
const MAX_BOOT_WORDS: usize = 50;

const OLD_BOOT_COUNT_AT: usize = 208;
const OLD_BOOT_CODE_AT: usize = 212;
const OLD_REGIONS_AT: usize = 416;
const OLD_REGION_STRIDE: usize = 48;

const DESC_AT: usize = 4;
const DESC_STRIDE: usize = 28;
const NEW_REGION_SKIP: usize = 8;
const NEW_REGION_STRIDE: usize = 40;

const DESC_DECOUPLE: &str = "decoup-desc";
const DESC_BOOT_CODE: &str = "boot-code";

// ─── Container ──────────────────────────────────────────────────────────────

/// Where the loadable payload sits inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLocation {
    pub offset: u64,
    pub length: u64,
    /// Whole container length (equals `length` for bare images).
    pub total: u64,
    pub container: bool,
}

impl ImageLocation {
    pub fn whole(length: u64) -> Self {
        Self {
            offset: 0,
            length,
            total: length,
            container: false,
        }
    }
}

fn slice_at(buf: &[u8], at: usize, len: usize) -> Result<&[u8], ImageError> {
    buf.get(at..at + len).ok_or(ImageError::Truncated {
        need: at + len,
        have: buf.len(),
    })
}

fn u32_at(buf: &[u8], at: usize) -> Result<u32, ImageError> {
    Ok(slice_at(buf, at, 4)?.get_u32_le())
}

fn u64_at(buf: &[u8], at: usize) -> Result<u64, ImageError> {
    Ok(slice_at(buf, at, 8)?.get_u64_le())
}

fn name_at(buf: &[u8], at: usize) -> Result<String, ImageError> {
    let raw = slice_at(buf, at, NAME_LEN)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

/// Parse an SCI container header.
pub fn parse_container(buf: &[u8]) -> Result<ImageLocation, ImageError> {
    let magic = slice_at(buf, 0, 4)?;
    if magic != SCI_MAGIC {
        return Err(ImageError::UnknownMagic((&magic[..]).get_u32_le()));
    }
    let mut blocks = slice_at(buf, 0, SCI_HEADER_LEN)?;
    blocks.advance(SCI_BLOCK_LEN);

    let mut modem: Option<(u32, u32)> = None;
    let mut total = None;
    while blocks.remaining() >= SCI_BLOCK_LEN {
        let type_flags = blocks.get_u32_le();
        let offset = blocks.get_u32_le();
        let length = blocks.get_u32_le();

        if type_flags & 0xff == SCI_TYPE_MODEM_BIN {
            modem = Some(if type_flags & SCI_SHA1 != 0 {
                (offset.wrapping_add(SHA1_LEN), length.saturating_sub(SHA1_LEN))
            } else {
                (offset, length)
            });
        }
        if type_flags & SCI_LAST != 0 {
            total = Some(u64::from(offset) + u64::from(length));
            break;
        }
    }

    let (offset, length) = modem.ok_or(ImageError::MissingModemBlock)?;
    let total = total.ok_or(ImageError::MissingLast)?;
    Ok(ImageLocation {
        offset: u64::from(offset),
        length: u64::from(length),
        total,
        container: true,
    })
}

/// Payload location for a buffer read from the start of a partition, with
/// whole-image fallback.
pub fn locate(buf: &[u8], whole_len: u64) -> ImageLocation {
    match parse_container(buf) {
        Ok(loc) => {
            tracing::debug!(offset = loc.offset, length = loc.length, total = loc.total, "sci container");
            loc
        }
        Err(ImageError::UnknownMagic(_)) => ImageLocation::whole(whole_len),
        Err(e) => {
            tracing::warn!(error = %e, "malformed sci container, loading whole image");
            ImageLocation::whole(whole_len)
        }
    }
}

/// Locate the payload of a partition entry. Only modem partitions are ever
/// wrapped; everything else is its full entry size.
pub fn locate_entry(entry: &PartitionEntry) -> ImageLocation {
    if !entry.read_path.to_string_lossy().contains(MODEM_BANK) {
        return ImageLocation::whole(entry.size);
    }
    let mut head = Vec::with_capacity(SCI_HEADER_LEN);
    let read = File::open(&entry.read_path)
        .and_then(|f| f.take(SCI_HEADER_LEN as u64).read_to_end(&mut head));
    match read {
        Ok(_) => locate(&head, entry.size),
        Err(e) => {
            tracing::warn!(path = %entry.read_path.display(), error = %e, "read container header");
            ImageLocation::whole(entry.size)
        }
    }
}

// ─── Decoupling header ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderRegion {
    pub name: String,
    pub base: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModemHeader {
    pub regions: Vec<HeaderRegion>,
    /// Instructions written to the CP boot-code region.
    pub boot_code: Vec<u8>,
}

fn region_at(buf: &[u8], at: usize) -> Result<HeaderRegion, ImageError> {
    Ok(HeaderRegion {
        name: name_at(buf, at)?,
        base: u64_at(buf, at + 24)?,
        size: u32_at(buf, at + 32)?,
    })
}

fn parse_old(buf: &[u8]) -> Result<ModemHeader, ImageError> {
    let mut header = ModemHeader::default();
    for i in 0..MAX_HEAD_REGIONS {
        let region = region_at(buf, OLD_REGIONS_AT + i * OLD_REGION_STRIDE)?;
        if region.name.is_empty() {
            break;
        }
        header.regions.push(region);
    }
    let words = (u32_at(buf, OLD_BOOT_COUNT_AT)? as usize).min(MAX_BOOT_WORDS);
    header.boot_code = slice_at(buf, OLD_BOOT_CODE_AT, words * 4)?.to_vec();
    Ok(header)
}

fn parse_new(buf: &[u8]) -> Result<ModemHeader, ImageError> {
    let mut header = ModemHeader::default();
    let mut at = DESC_AT;
    while at + DESC_STRIDE <= buf.len() {
        let name = name_at(buf, at)?;
        let offs = u32_at(buf, at + NAME_LEN)? as usize;
        let size = u32_at(buf, at + NAME_LEN + 4)? as usize;
        if size == 0 {
            break;
        }
        match name.as_str() {
            DESC_DECOUPLE => {
                header.regions.clear();
                let base = offs + NEW_REGION_SKIP;
                for i in 0..MAX_HEAD_REGIONS {
                    let region = region_at(buf, base + i * NEW_REGION_STRIDE)?;
                    if region.size == 0 {
                        break;
                    }
                    header.regions.push(region);
                }
            }
            DESC_BOOT_CODE => header.boot_code = slice_at(buf, offs, size)?.to_vec(),
            _ => {}
        }
        at += DESC_STRIDE;
    }
    Ok(header)
}

/// Parse the decoupling header at the start of the modem binary.
pub fn parse_modem_header(buf: &[u8]) -> Result<ModemHeader, ImageError> {
    match u32_at(buf, 0)? {
        OLD_HEAD_MAGIC => parse_old(buf),
        NEW_HEAD_MAGIC => parse_new(buf),
        other => Err(ImageError::UnknownMagic(other)),
    }
}

/// Read [`HEADER_LEN`] bytes at the payload offset of the modem entry.
pub fn read_modem_header(entry: &PartitionEntry) -> io::Result<Vec<u8>> {
    let loc = locate_entry(entry);
    let mut file = File::open(&entry.read_path)?;
    file.seek(SeekFrom::Start(loc.offset))?;
    let mut buf = vec![0u8; HEADER_LEN];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Correct table addresses and sizes from the header regions.
///
/// Matching entries take the region's base and size. An unmatched entry
/// is invalidated, except that a configured table keeps its non-modem
/// entries.
pub fn apply_header(table: &mut PartitionTable, header: &ModemHeader) -> Result<(), ImageError> {
    if header.regions.is_empty() {
        return Err(ImageError::NoRegions);
    }
    let keep_unmatched = table.externally_described;
    for entry in &mut table.entries {
        match header.regions.iter().find(|r| r.name == entry.name) {
            Some(region) => {
                tracing::debug!(entry = %entry.name, base = region.base, size = region.size, "header region");
                entry.address = region.base;
                entry.size = u64::from(region.size);
            }
            None => {
                if !keep_unmatched || entry.flags.intersects(FlagBitmask::MODEM_EXCEPT_HEAD_MASK) {
                    if entry.size != 0 {
                        tracing::info!(entry = %entry.name, "not described by modem header, invalidated");
                    }
                    entry.size = 0;
                }
            }
        }
    }
    Ok(())
}

/// Locate, read, parse and apply the modem header for a CP table. Returns
/// the parsed header so boot code stays available to the loader.
pub fn correct_from_header(table: &mut PartitionTable) -> Result<ModemHeader, ImageError> {
    let header = match table.find(MODEM_BANK) {
        Some(entry) => match read_modem_header(entry) {
            Ok(buf) => parse_modem_header(&buf).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "modem header unparsable");
                ModemHeader::default()
            }),
            Err(e) => {
                tracing::warn!(path = %entry.read_path.display(), error = %e, "read modem header");
                ModemHeader::default()
            }
        },
        None => {
            tracing::warn!("no modem entry to read header from");
            ModemHeader::default()
        }
    };
    apply_header(table, &header)?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::partition::Subsystem;

    fn block(type_flags: u32, offset: u32, length: u32) -> [u8; 12] {
        let mut b = [0u8; 12];
        b[0..4].copy_from_slice(&type_flags.to_le_bytes());
        b[4..8].copy_from_slice(&offset.to_le_bytes());
        b[8..12].copy_from_slice(&length.to_le_bytes());
        b
    }

    fn container(blocks: &[[u8; 12]]) -> Vec<u8> {
        let mut buf = vec![0u8; SCI_HEADER_LEN];
        buf[..4].copy_from_slice(SCI_MAGIC);
        for (i, b) in blocks.iter().enumerate() {
            let at = (i + 1) * SCI_BLOCK_LEN;
            buf[at..at + 12].copy_from_slice(b);
        }
        buf
    }

    // ─── Container ──────────────────────────────────────────────────────────

    #[test]
    fn bare_image_is_whole_file() {
        let buf = vec![0x11u8; 512];
        assert_eq!(locate(&buf, 4096), ImageLocation::whole(4096));
    }

    #[test]
    fn container_yields_modem_block() {
        let buf = container(&[block(2, 0x200, 0x100), block(1 | SCI_LAST, 0x400, 0x8000)]);
        let loc = parse_container(&buf).unwrap();
        assert_eq!(loc.offset, 0x400);
        assert_eq!(loc.length, 0x8000);
        assert_eq!(loc.total, 0x8400);
        assert!(loc.container);
    }

    #[test]
    fn sha1_prefix_is_skipped() {
        let buf = container(&[block(1 | SCI_SHA1, 0x200, 0x1000), block(3 | SCI_LAST, 0x1200, 0x10)]);
        let loc = parse_container(&buf).unwrap();
        assert_eq!(loc.offset, 0x200 + 20);
        assert_eq!(loc.length, 0x1000 - 20);
        assert_eq!(loc.total, 0x1210);
    }

    #[test]
    fn missing_last_flag_is_a_parse_failure() {
        let buf = container(&[block(1, 0x200, 0x1000)]);
        assert_eq!(parse_container(&buf), Err(ImageError::MissingLast));
        assert_eq!(locate(&buf, 77), ImageLocation::whole(77), "falls back to whole file");
    }

    #[test]
    fn missing_modem_block_is_a_parse_failure() {
        let buf = container(&[block(2 | SCI_LAST, 0x200, 0x10)]);
        assert_eq!(parse_container(&buf), Err(ImageError::MissingModemBlock));
    }

    #[test]
    fn truncated_container_falls_back() {
        let buf = container(&[block(1 | SCI_LAST, 0x200, 0x10)]);
        assert!(matches!(parse_container(&buf[..40]), Err(ImageError::Truncated { .. })));
        assert_eq!(locate(&buf[..40], 9), ImageLocation::whole(9));
    }

    #[test]
    fn non_modem_entries_are_never_parsed() {
        let entry = PartitionEntry {
            name: "fixnv".into(),
            read_path: "/nonexistent/fixnv".into(),
            size: 0x100,
            ..Default::default()
        };
        assert_eq!(locate_entry(&entry), ImageLocation::whole(0x100));
    }

    // ─── Decoupling header ──────────────────────────────────────────────────

    fn put_name(buf: &mut [u8], at: usize, name: &str) {
        buf[at..at + name.len()].copy_from_slice(name.as_bytes());
    }

    fn put_region(buf: &mut [u8], at: usize, name: &str, base: u64, size: u32) {
        put_name(buf, at, name);
        buf[at + 24..at + 32].copy_from_slice(&base.to_le_bytes());
        buf[at + 32..at + 36].copy_from_slice(&size.to_le_bytes());
    }

    fn old_header() -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&OLD_HEAD_MAGIC.to_le_bytes());
        buf[OLD_BOOT_COUNT_AT..OLD_BOOT_COUNT_AT + 4].copy_from_slice(&2u32.to_le_bytes());
        buf[OLD_BOOT_CODE_AT..OLD_BOOT_CODE_AT + 8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        put_region(&mut buf, OLD_REGIONS_AT, "modem", 0x8b00_0000, 0x80_0000);
        put_region(&mut buf, OLD_REGIONS_AT + OLD_REGION_STRIDE, "ldsp", 0x8900_0000, 0x40_0000);
        buf
    }

    #[test]
    fn legacy_header_regions_and_boot_code() {
        let h = parse_modem_header(&old_header()).unwrap();
        assert_eq!(h.regions.len(), 2);
        assert_eq!(h.regions[0].name, "modem");
        assert_eq!(h.regions[0].base, 0x8b00_0000);
        assert_eq!(h.regions[1].size, 0x40_0000);
        assert_eq!(h.boot_code, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn descriptor_header_regions_and_boot_code() {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&NEW_HEAD_MAGIC.to_le_bytes());
        // descriptor 0: boot-code at 0x100, 6 bytes
        put_name(&mut buf, DESC_AT, DESC_BOOT_CODE);
        buf[DESC_AT + 20..DESC_AT + 24].copy_from_slice(&0x100u32.to_le_bytes());
        buf[DESC_AT + 24..DESC_AT + 28].copy_from_slice(&6u32.to_le_bytes());
        // descriptor 1: decoup-desc at 0x200
        let d1 = DESC_AT + DESC_STRIDE;
        put_name(&mut buf, d1, DESC_DECOUPLE);
        buf[d1 + 20..d1 + 24].copy_from_slice(&0x200u32.to_le_bytes());
        buf[d1 + 24..d1 + 28].copy_from_slice(&0x80u32.to_le_bytes());
        buf[0x100..0x106].copy_from_slice(&[9, 9, 8, 8, 7, 7]);
        put_region(&mut buf, 0x208, "modem", 0x1000, 0x2000);
        put_region(&mut buf, 0x208 + NEW_REGION_STRIDE, "cdsp", 0x3000, 0x400);

        let h = parse_modem_header(&buf).unwrap();
        assert_eq!(h.boot_code, vec![9, 9, 8, 8, 7, 7]);
        assert_eq!(
            h.regions,
            vec![
                HeaderRegion { name: "modem".into(), base: 0x1000, size: 0x2000 },
                HeaderRegion { name: "cdsp".into(), base: 0x3000, size: 0x400 },
            ]
        );
    }

    #[test]
    fn unknown_header_magic() {
        let buf = vec![0u8; HEADER_LEN];
        assert_eq!(parse_modem_header(&buf), Err(ImageError::UnknownMagic(0)));
    }

    fn entry(name: &str, size: u64, flags: FlagBitmask) -> PartitionEntry {
        PartitionEntry {
            name: name.into(),
            size,
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn apply_header_corrects_and_invalidates() {
        let header = parse_modem_header(&old_header()).unwrap();
        let mut t = PartitionTable::empty(Subsystem::Cp);
        t.entries = vec![
            entry("modem", 1, FlagBitmask::MODEM),
            entry("ldsp", 1, FlagBitmask::MODEM_DSP),
            entry("fixnv", 1, FlagBitmask::NV | FlagBitmask::MODEM_OTHER),
        ];
        apply_header(&mut t, &header).unwrap();
        assert_eq!(t.entries[0].address, 0x8b00_0000);
        assert_eq!(t.entries[1].size, 0x40_0000);
        assert_eq!(t.entries[2].size, 0, "probed table drops undescribed entries");
    }

    #[test]
    fn configured_table_keeps_non_modem_entries() {
        let header = parse_modem_header(&old_header()).unwrap();
        let mut t = PartitionTable::empty(Subsystem::Cp);
        t.externally_described = true;
        t.entries = vec![
            entry("fixnv", 0x100, FlagBitmask::NV),
            entry("gdsp", 0x100, FlagBitmask::MODEM_DSP),
            entry("head", 0x100, FlagBitmask::MODEM_HEAD),
        ];
        apply_header(&mut t, &header).unwrap();
        assert_eq!(t.entries[0].size, 0x100);
        assert_eq!(t.entries[1].size, 0);
        assert_eq!(t.entries[2].size, 0x100, "head bit is not a modem-binary bit");
    }

    #[test]
    fn empty_header_reports_no_regions() {
        let mut t = PartitionTable::empty(Subsystem::Cp);
        assert_eq!(apply_header(&mut t, &ModemHeader::default()), Err(ImageError::NoRegions));
    }

    #[test]
    fn header_read_through_container_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("l_modem");
        let mut image = container(&[block(1 | SCI_LAST, 0x200, HEADER_LEN as u32)]);
        image.resize(0x200, 0);
        image.extend(old_header());
        std::fs::write(&path, &image).unwrap();

        let mut t = PartitionTable::empty(Subsystem::Cp);
        t.entries = vec![PartitionEntry {
            name: "modem".into(),
            read_path: path,
            size: 0x10,
            flags: FlagBitmask::MODEM,
            ..Default::default()
        }];
        let header = correct_from_header(&mut t).unwrap();
        assert_eq!(header.regions.len(), 2);
        assert_eq!(t.entries[0].size, 0x80_0000);
    }
}
