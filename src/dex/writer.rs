//! Serializes a mutated archive back to disk with fresh structural
//! checksums. The write is create-then-rename: a prior file at the
//! destination is only replaced on full success.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use adler::adler32_slice;
use log::info;
use sha1::{Digest, Sha1};

use crate::dex::dex_file::{
    CHECKSUM_DATA_START, CHECKSUM_OFFSET, MutableArchive, SIGNATURE_DATA_START, SIGNATURE_OFFSET,
};
use crate::error::{VdexError, VdexResult};

/// Adler-32 over everything the dex structural checksum covers.
pub fn compute_checksum(bytes: &[u8]) -> u32 {
    adler32_slice(&bytes[CHECKSUM_DATA_START..])
}

fn compute_sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Recomputes the SHA-1 signature and then the adler-32 checksum over the
/// final bytes, in that order: the checksum covers the signature field.
pub fn finalize_checksums(archive: &mut MutableArchive) {
    let bytes = archive.bytes_mut();
    let signature = compute_sha1(&bytes[SIGNATURE_DATA_START..]);
    bytes[SIGNATURE_OFFSET..SIGNATURE_OFFSET + 20].copy_from_slice(&signature);
    let checksum = adler32_slice(&bytes[CHECKSUM_DATA_START..]);
    bytes[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
    archive.set_checksums(checksum, signature);
}

fn staging_path(path: &Path) -> VdexResult<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        VdexError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("output path {} has no file name", path.display()),
        ))
    })?;
    let mut staged = name.to_os_string();
    staged.push(".tmp");
    Ok(path.with_file_name(staged))
}

/// Writes the archive to `path`, recomputing its structural checksums first.
/// The bytes land in a `.tmp` sibling which is renamed over the destination,
/// so a failed write never leaves a truncated file at the output name.
pub fn write_archive(archive: &mut MutableArchive, path: &Path) -> VdexResult<()> {
    finalize_checksums(archive);

    let staged = staging_path(path)?;
    fs::write(&staged, archive.bytes())?;
    if let Err(err) = fs::rename(&staged, path) {
        let _ = fs::remove_file(&staged);
        return Err(VdexError::Io(err));
    }

    info!(
        "wrote dex file to {} ({} bytes, checksum 0x{:08x})",
        path.display(),
        archive.bytes().len(),
        archive.header().checksum
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staging_path_keeps_the_directory() {
        let p = staging_path(Path::new("/some/dir/classes.dex")).unwrap();
        assert_eq!(p, Path::new("/some/dir/classes.dex.tmp"));
    }

    #[test]
    fn staging_path_rejects_bare_roots() {
        assert!(staging_path(Path::new("/")).is_err());
    }
}
