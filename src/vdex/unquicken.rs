//! The de-quickening engine: a single forward walk over each method's
//! instruction stream, rewriting every recorded offset back to its canonical
//! encoding in place.
//!
//! The whole transform rests on one invariant: a quickened instruction and
//! its canonical counterpart occupy the same number of code units. Because
//! of it, rewrites are purely local — branch targets, try/catch ranges,
//! debug info and switch payloads all stay valid without re-derivation.

use log::{debug, error, trace};

use crate::dex::dex_file::{MethodCode, MutableArchive};
use crate::dex::opcode_format::{insn_width_bytes, is_quickened};
use crate::error::{fail_integrity, VdexResult};
use crate::vdex::quicken::{QuickenRecord, QuickenTable};

/// Progress of one method through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MethodState {
    Untouched,
    Resolving,
    Rewritten,
    Failed,
}

/// Counters for one archive pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnquickenStats {
    pub methods_rewritten: usize,
    pub instructions_rewritten: usize,
}

/// Runs the de-quickening pass over every method in the archive. Any
/// violation aborts the whole conversion: a partially rewritten archive is
/// neither valid quickened form nor valid canonical form, so nothing is
/// ever emitted from a failed pass.
pub fn unquicken_archive(
    archive: &mut MutableArchive,
    table: &QuickenTable<'_>,
) -> VdexResult<UnquickenStats> {
    let mut stats = UnquickenStats::default();
    let codes: Vec<MethodCode> = archive.codes().to_vec();

    for code in codes {
        let mut state = MethodState::Untouched;
        trace!("{}: {state:?}", archive.method_name(code.method_idx));

        // First side-table lookup moves the method into resolution.
        state = MethodState::Resolving;
        trace!("{}: {state:?}", archive.method_name(code.method_idx));
        let records = match table.for_method(code.method_idx, code.insns_len) {
            Ok(records) => records,
            Err(e) => {
                state = MethodState::Failed;
                error!(
                    "resolving quicken records for {} failed ({state:?}): {e}",
                    archive.method_name(code.method_idx)
                );
                return Err(e);
            }
        };
        if records.is_empty() {
            // No records: the method reverts to untouched and is emitted
            // byte-identical between extraction and write.
            state = MethodState::Untouched;
            trace!("{}: {state:?}", archive.method_name(code.method_idx));
            continue;
        }

        match rewrite_method(archive.insns_mut(&code), &records) {
            Ok(()) => {
                state = MethodState::Rewritten;
                stats.methods_rewritten += 1;
                stats.instructions_rewritten += records.len();
                debug!(
                    "{}: {state:?}, {} instruction(s)",
                    archive.method_name(code.method_idx),
                    records.len()
                );
            }
            Err(e) => {
                state = MethodState::Failed;
                error!(
                    "unquickening {} failed ({state:?}): {e}",
                    archive.method_name(code.method_idx)
                );
                return Err(e);
            }
        }
    }

    Ok(stats)
}

/// Walks the instruction stream once, overwriting each recorded site.
///
/// Per record the engine checks that the site holds a quickened opcode and
/// that both the quickened and the canonical encoding are exactly as wide as
/// the record says. A mismatch means length preservation was violated
/// upstream and the stream can no longer be trusted.
fn rewrite_method(code: &mut [u8], records: &[QuickenRecord]) -> VdexResult<()> {
    let mut iter = records.iter();
    let mut next = iter.next();
    let mut pc = 0;

    while pc < code.len() {
        let Some(record) = next else {
            // Past the last record the stream is left untouched.
            break;
        };

        if record.offset == pc {
            let op = code[pc];
            if !is_quickened(op) {
                fail_integrity!(
                    "quicken record at offset {} targets opcode 0x{:02x}, which is not a quickened form",
                    pc,
                    op
                );
            }
            let width = insn_width_bytes(code, pc)?;
            if width != record.bytes.len() {
                fail_integrity!(
                    "length invariance violated at offset {}: instruction is {} bytes, record holds {}",
                    pc,
                    width,
                    record.bytes.len()
                );
            }
            let canonical_width = insn_width_bytes(&record.bytes, 0)?;
            if canonical_width != width {
                fail_integrity!(
                    "length invariance violated at offset {}: canonical encoding is {} bytes, quickened was {}",
                    pc,
                    canonical_width,
                    width
                );
            }
            code[pc..pc + width].copy_from_slice(&record.bytes);
            pc += width;
            next = iter.next();
            continue;
        }

        if record.offset < pc {
            fail_integrity!(
                "quicken record offset {} falls inside the instruction at {}",
                record.offset,
                pc
            );
        }

        pc += insn_width_bytes(code, pc)?;
    }

    if let Some(record) = next {
        fail_integrity!(
            "quicken record offset {} is past the end of the instruction stream",
            record.offset
        );
    }

    Ok(())
}
