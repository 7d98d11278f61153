//! Quicken side-table parsing and per-method record resolution.
//!
//! Side-table layout (little-endian):
//!
//! ```text
//! group_count u32
//! group_count * {
//!     method_idx   u32
//!     record_count u32
//!     record_count * { code_off u32, width u16, bytes u8[width] }
//! }
//! ```
//!
//! `code_off` is a byte offset into the method's insns region and `bytes`
//! holds the canonical (pre-quickening) instruction encoding.

use log::trace;

use crate::dex::{read_u2, read_u4, read_x};
use crate::error::{fail_format, fail_integrity, VdexResult};

/// One rewrite: the canonical bytes that belong at `offset` in a method's
/// instruction region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuickenRecord {
    pub offset: usize,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct MethodGroup {
    method_idx: u32,
    records_off: usize,
    record_count: u32,
}

/// A parsed side-table: a directory of per-method record lists. Record
/// payloads are decoded lazily, per method, by [`QuickenTable::for_method`].
pub struct QuickenTable<'a> {
    bytes: &'a [u8],
    groups: Vec<MethodGroup>,
}

impl<'a> QuickenTable<'a> {
    /// Walks the whole table once, validating its structure and that every
    /// group names a method that exists in the owning archive.
    pub fn parse(bytes: &'a [u8], method_id_count: u32) -> VdexResult<QuickenTable<'a>> {
        let mut ix = 0;
        let group_count = read_u4(bytes, &mut ix)?;
        // A group is at least 8 bytes; a larger count cannot be honest.
        if (group_count as usize).saturating_mul(8) > bytes.len() {
            fail_format!(
                "quicken table declares {} groups in {} bytes",
                group_count,
                bytes.len()
            );
        }
        let mut groups = Vec::with_capacity(group_count as usize);

        for _ in 0..group_count {
            let method_idx = read_u4(bytes, &mut ix)?;
            if method_idx >= method_id_count {
                fail_integrity!(
                    "quicken table names method {} but the archive has {}",
                    method_idx,
                    method_id_count
                );
            }
            if groups.iter().any(|g: &MethodGroup| g.method_idx == method_idx) {
                fail_integrity!("quicken table holds two groups for method {}", method_idx);
            }
            let record_count = read_u4(bytes, &mut ix)?;
            let records_off = ix;
            // Skip over the records to find the next group; the payload is
            // re-read with full validation when the method is resolved.
            for _ in 0..record_count {
                read_u4(bytes, &mut ix)?;
                let width = read_u2(bytes, &mut ix)?;
                read_x(bytes, &mut ix, width as usize)?;
            }
            groups.push(MethodGroup {
                method_idx,
                records_off,
                record_count,
            });
        }

        if ix != bytes.len() {
            fail_format!(
                "quicken table has {} trailing bytes after the last group",
                bytes.len() - ix
            );
        }

        Ok(QuickenTable { bytes, groups })
    }

    /// Number of methods with at least one rewrite record.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Resolves the ordered rewrite list for one method. Methods without a
    /// group resolve to an empty list: they are untouched, which is the
    /// common case, not an error.
    ///
    /// `insns_len` is the byte length of the method's instruction region;
    /// records are validated against it here so the engine can rely on
    /// strictly increasing, non-overlapping, in-bounds offsets.
    pub fn for_method(&self, method_idx: u32, insns_len: usize) -> VdexResult<Vec<QuickenRecord>> {
        let Some(group) = self.groups.iter().find(|g| g.method_idx == method_idx) else {
            return Ok(vec![]);
        };

        let mut ix = group.records_off;
        let mut records = Vec::with_capacity(group.record_count as usize);
        let mut prev_end: Option<usize> = None;

        for _ in 0..group.record_count {
            let offset = read_u4(self.bytes, &mut ix)? as usize;
            let width = read_u2(self.bytes, &mut ix)? as usize;
            let bytes = read_x(self.bytes, &mut ix, width)?;

            if width == 0 || width % 2 != 0 {
                fail_integrity!(
                    "method {}: quicken record at offset {} has width {} (must be a positive number of code units)",
                    method_idx,
                    offset,
                    width
                );
            }
            if offset % 2 != 0 {
                fail_integrity!(
                    "method {}: quicken record offset {} is not code-unit aligned",
                    method_idx,
                    offset
                );
            }
            match prev_end {
                Some(end) if offset < end => fail_integrity!(
                    "method {}: quicken record offsets not strictly increasing ({} after [.., {}))",
                    method_idx,
                    offset,
                    end
                ),
                _ => {}
            }
            if offset + width > insns_len {
                fail_integrity!(
                    "method {}: quicken record [{}, {}) is outside the {} byte bytecode region",
                    method_idx,
                    offset,
                    offset + width,
                    insns_len
                );
            }

            prev_end = Some(offset + width);
            records.push(QuickenRecord { offset, bytes });
        }

        trace!(
            "resolved {} quicken record(s) for method {}",
            records.len(),
            method_idx
        );
        Ok(records)
    }
}
