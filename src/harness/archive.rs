//! Single-file archive packaging.
//!
//! Converts a byte stream into a gzip-compressed tar holding exactly one
//! entry, the form container engines accept for copying files into a running
//! environment. The entry is named after the base component of the target
//! path; directories are deliberately flattened away.

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Package `contents` as a compressed single-entry archive.
///
/// The whole input is buffered first because the tar header needs the entry
/// size up front, so this is not suitable for unbounded streams.
///
/// # Errors
///
/// Returns an IO error if reading the input or writing the archive fails, or
/// if `target` has no file name component.
pub fn package<R: Read>(contents: R, target: &str, mode: u32) -> io::Result<Vec<u8>> {
    let name = Path::new(target).file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("target path {:?} has no file name", target),
        )
    })?;
    package_entry(contents, Path::new(name), mode)
}

/// Package `contents` under a relative entry path, keeping its directories.
///
/// Engines create missing parent directories on extraction, so this reaches
/// paths below a directory that does not exist yet.
///
/// # Errors
///
/// Returns an IO error if reading or writing fails, or if `entry` is absolute.
pub fn package_entry<R: Read>(mut contents: R, entry: &Path, mode: u32) -> io::Result<Vec<u8>> {
    if entry.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("archive entry {:?} must be relative", entry),
        ));
    }

    let mut buffer = Vec::new();
    contents.read_to_end(&mut buffer)?;

    let mut header = tar::Header::new_gnu();
    header.set_path(entry)?;
    header.set_mode(mode);
    header.set_size(buffer.len() as u64);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append(&header, buffer.as_slice())?;

    let encoder = builder.into_inner()?;
    encoder.finish()
}

/// Extract a compressed archive into `dir`, returning the written paths.
///
/// Entry permission bits are restored on unix.
///
/// # Errors
///
/// Returns an IO error if the archive is malformed or extraction fails.
pub fn unpack(archive: &[u8], dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(GzDecoder::new(archive));
    archive.set_preserve_permissions(true);

    let mut written = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = dir.join(entry.path()?);
        entry.unpack_in(dir)?;
        written.push(path);
    }
    Ok(written)
}
