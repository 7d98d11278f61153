//! Container reader for the vdex format: header validation, checksum
//! verification and enumeration of the embedded dex archives and their
//! quicken side-tables.
//!
//! Container layout (little-endian):
//!
//! ```text
//! 0   magic      "vdex"
//! 4   version    ASCII, e.g. "019\0"
//! 8   dex_count  u32
//! 12  checksum   CRC-32 of every byte from offset 16 to EOF
//! 16  dex_count * { dex_off u32, dex_size u32, table_off u32, table_size u32 }
//! ... dex blobs (4-aligned) and side-tables
//! ```

use std::fs;
use std::ops::Range;
use std::path::Path;

use log::debug;

use crate::dex::dex_file::{CHECKSUM_OFFSET, HEADER_SIZE as DEX_HEADER_SIZE};
use crate::dex::{read_u4, read_x, writer};
use crate::error::{fail_format, fail_integrity, VdexError, VdexResult};

pub const VDEX_MAGIC: [u8; 4] = *b"vdex";
/// Container versions this converter understands; anything else is rejected.
pub const SUPPORTED_VDEX_VERSIONS: [[u8; 4]; 1] = [*b"019\0"];

const VDEX_HEADER_SIZE: usize = 16;
const SECTION_SIZE: usize = 16;

#[derive(Debug, PartialEq, Eq)]
pub struct VdexHeader {
    pub magic: [u8; 4],
    pub version: [u8; 4],
    pub dex_count: u32,
    pub checksum: u32,
}

impl VdexHeader {
    fn read(bytes: &[u8], ix: &mut usize) -> VdexResult<VdexHeader> {
        if bytes.len() < VDEX_HEADER_SIZE {
            fail_format!("not enough bytes for vdex header: {}", bytes.len());
        }
        let magic = <[u8; 4]>::try_from(read_x(bytes, ix, 4)?).unwrap();
        if magic != VDEX_MAGIC {
            fail_format!("invalid vdex magic value {:02x?}", magic);
        }
        let version = <[u8; 4]>::try_from(read_x(bytes, ix, 4)?).unwrap();
        if !SUPPORTED_VDEX_VERSIONS.contains(&version) {
            fail_format!(
                "unsupported vdex version {:?}",
                String::from_utf8_lossy(&version[..3])
            );
        }
        Ok(VdexHeader {
            magic,
            version,
            dex_count: read_u4(bytes, ix)?,
            checksum: read_u4(bytes, ix)?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct VdexSection {
    dex_off: u32,
    dex_size: u32,
    table_off: u32,
    table_size: u32,
}

impl VdexSection {
    fn dex_range(&self) -> Range<usize> {
        self.dex_off as usize..self.dex_off as usize + self.dex_size as usize
    }

    fn table_range(&self) -> Range<usize> {
        self.table_off as usize..self.table_off as usize + self.table_size as usize
    }
}

/// Locator for one archive record inside an open container.
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    pub index: usize,
    dex: Range<usize>,
    table: Range<usize>,
}

/// An open, validated vdex container. The backing bytes are read-only for
/// the lifetime of the invocation; extraction copies out of them.
#[derive(Debug)]
pub struct VdexFile {
    bytes: Vec<u8>,
    header: VdexHeader,
    sections: Vec<VdexSection>,
}

impl VdexFile {
    pub fn open(path: &Path) -> VdexResult<VdexFile> {
        let bytes = fs::read(path)?;
        Self::from_bytes(bytes)
    }

    /// Validates magic, version, the container checksum and every embedded
    /// archive's own structural checksum before anything is handed out.
    /// Fail-fast: a mismatch invalidates the whole container.
    pub fn from_bytes(bytes: Vec<u8>) -> VdexResult<VdexFile> {
        let mut ix = 0;
        let header = VdexHeader::read(&bytes, &mut ix)?;

        let payload_start = (header.dex_count as usize)
            .checked_mul(SECTION_SIZE)
            .and_then(|n| n.checked_add(VDEX_HEADER_SIZE))
            .ok_or_else(|| VdexError::Format("section table size overflows".to_string()))?;
        if payload_start > bytes.len() {
            fail_format!(
                "vdex declares {} dex files but is only {} bytes",
                header.dex_count,
                bytes.len()
            );
        }

        let computed = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&bytes[VDEX_HEADER_SIZE..]);
            hasher.finalize()
        };
        if computed != header.checksum {
            fail_integrity!(
                "vdex checksum mismatch: header says 0x{:08x}, content is 0x{:08x}",
                header.checksum,
                computed
            );
        }

        let mut sections = Vec::with_capacity(header.dex_count as usize);
        for i in 0..header.dex_count as usize {
            let section = VdexSection {
                dex_off: read_u4(&bytes, &mut ix)?,
                dex_size: read_u4(&bytes, &mut ix)?,
                table_off: read_u4(&bytes, &mut ix)?,
                table_size: read_u4(&bytes, &mut ix)?,
            };
            for (what, range) in [("dex blob", section.dex_range()), ("side-table", section.table_range())] {
                if range.start < payload_start || range.end > bytes.len() {
                    fail_format!(
                        "archive record {}: {} [{}, {}) is outside the container payload [{}, {})",
                        i,
                        what,
                        range.start,
                        range.end,
                        payload_start,
                        bytes.len()
                    );
                }
            }
            if (section.dex_size as usize) < DEX_HEADER_SIZE {
                fail_format!(
                    "archive record {}: dex blob of {} bytes is smaller than a dex header",
                    i,
                    section.dex_size
                );
            }
            sections.push(section);
        }

        // Each embedded archive carries its own structural checksum; verify
        // all of them up front, before any archive is extracted.
        for (i, section) in sections.iter().enumerate() {
            let dex = &bytes[section.dex_range()];
            let mut off = CHECKSUM_OFFSET;
            let stored = read_u4(dex, &mut off)?;
            let computed = writer::compute_checksum(dex);
            if stored != computed {
                fail_integrity!(
                    "archive record {}: dex checksum mismatch (stored 0x{:08x}, computed 0x{:08x})",
                    i,
                    stored,
                    computed
                );
            }
        }

        debug!(
            "opened vdex container: version {}, {} dex file(s), {} bytes",
            String::from_utf8_lossy(&header.version[..3]),
            header.dex_count,
            bytes.len()
        );

        Ok(VdexFile {
            bytes,
            header,
            sections,
        })
    }

    pub fn header(&self) -> &VdexHeader {
        &self.header
    }

    /// Lazily enumerates the archive records. The iterator is finite and
    /// not restartable; re-open the container to enumerate again.
    pub fn archives(&self) -> ArchiveIter<'_> {
        ArchiveIter {
            vdex: self,
            next: 0,
        }
    }

    /// The raw bytes of one embedded dex archive (read-only).
    pub fn archive_bytes(&self, handle: &ArchiveHandle) -> &[u8] {
        &self.bytes[handle.dex.clone()]
    }

    /// Locates the quicken side-table associated with an archive record.
    pub fn side_table_bytes(&self, handle: &ArchiveHandle) -> &[u8] {
        &self.bytes[handle.table.clone()]
    }
}

pub struct ArchiveIter<'a> {
    vdex: &'a VdexFile,
    next: usize,
}

impl Iterator for ArchiveIter<'_> {
    type Item = ArchiveHandle;

    fn next(&mut self) -> Option<ArchiveHandle> {
        let section = self.vdex.sections.get(self.next)?;
        let handle = ArchiveHandle {
            index: self.next,
            dex: section.dex_range(),
            table: section.table_range(),
        };
        self.next += 1;
        Some(handle)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.vdex.sections.len() - self.next;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_container() -> Vec<u8> {
        let mut bytes = vec![];
        bytes.extend_from_slice(&VDEX_MAGIC);
        bytes.extend_from_slice(b"019\0");
        bytes.extend_from_slice(&0u32.to_le_bytes()); // dex_count
        bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum patched below
        let crc = crc32fast::hash(&bytes[VDEX_HEADER_SIZE..]);
        bytes[12..16].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    #[test]
    fn opens_an_empty_container() {
        let vdex = VdexFile::from_bytes(empty_container()).unwrap();
        assert_eq!(vdex.header().dex_count, 0);
        assert_eq!(vdex.archives().count(), 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = empty_container();
        bytes[0] = b'x';
        let err = VdexFile::from_bytes(bytes).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = empty_container();
        bytes[4..8].copy_from_slice(b"027\0");
        let err = VdexFile::from_bytes(bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported vdex version"));
    }

    #[test]
    fn rejects_flipped_checksum_byte() {
        let mut bytes = empty_container();
        bytes[12] ^= 0xff;
        let err = VdexFile::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, crate::error::VdexError::Integrity(_)));
    }

    #[test]
    fn rejects_truncated_section_table() {
        let mut bytes = empty_container();
        bytes[8..12].copy_from_slice(&3u32.to_le_bytes()); // dex_count = 3, no sections
        let crc = crc32fast::hash(&bytes[VDEX_HEADER_SIZE..]);
        bytes[12..16].copy_from_slice(&crc.to_le_bytes());
        let err = VdexFile::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, crate::error::VdexError::Format(_)));
    }
}
