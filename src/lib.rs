//! # vdex2dex
//!
//! A library for converting Android vdex containers back into standard,
//! independently verifiable dex files by undoing instruction quickening.
//!
use std::path::Path;

use log::{info, warn};
use serde::Serialize;

use crate::dex::dex_file::MutableArchive;
use crate::dex::writer::write_archive;
use crate::error::{VdexError, VdexResult};
use crate::vdex::container::VdexFile;
use crate::vdex::quicken::QuickenTable;
use crate::vdex::unquicken::unquicken_archive;

pub mod dex;
pub mod error;
mod tests;
pub mod vdex;

/// Summary of one conversion, reported back to the caller for display.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertResult {
    /// Archive records found in the container.
    pub archives_found: usize,
    /// Archive records converted (only ever the first).
    pub archives_converted: usize,
    /// Methods with at least one rewritten instruction.
    pub methods_rewritten: usize,
    /// Total instructions restored to their canonical encoding.
    pub instructions_rewritten: usize,
}

/// Converts the vdex container at `input` into a standard dex file at
/// `output`.
///
/// When the container holds more than one dex file only the first is
/// converted; the total is reported in the result so the caller can warn.
/// Every failure is terminal and leaves the destination untouched.
///
/// # Examples
///
/// ```no_run
///  use std::path::Path;
///  use vdex2dex::convert;
///
///  let result = convert(Path::new("base.vdex"), Path::new("classes.dex")).unwrap();
///  println!("{} dex file(s) found, {} converted.", result.archives_found, result.archives_converted);
/// ```
pub fn convert(input: &Path, output: &Path) -> VdexResult<ConvertResult> {
    let container = VdexFile::open(input)?;

    let mut archives = container.archives();
    let first = archives
        .next()
        .ok_or_else(|| VdexError::Format("vdex container holds no dex files".to_string()))?;
    let archives_found = 1 + archives.count();
    if archives_found > 1 {
        warn!("vdex container holds {archives_found} dex files, only converting the first");
    }

    let mut archive = MutableArchive::from_bytes(container.archive_bytes(&first))?;
    let table = QuickenTable::parse(container.side_table_bytes(&first), archive.method_count())?;
    info!(
        "converting archive record 0: {} code region(s), {} quickened method group(s)",
        archive.codes().len(),
        table.group_count()
    );

    let stats = unquicken_archive(&mut archive, &table)?;
    write_archive(&mut archive, output)?;

    Ok(ConvertResult {
        archives_found,
        archives_converted: 1,
        methods_rewritten: stats.methods_rewritten,
        instructions_rewritten: stats.instructions_rewritten,
    })
}
