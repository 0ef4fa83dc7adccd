//! Template staging.
//!
//! Copies a template source tree, file by file, into a working directory.
//! Permission bits are preserved and symbolic links are skipped.

use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

/// Copy `source` into `target`, returning the number of files copied.
///
/// `target` is created if missing. Entries are visited in name order so the
/// copy is reproducible.
///
/// # Errors
///
/// Returns an IO error naming the path that could not be read or written.
pub fn copy_tree(source: &Path, target: &Path) -> io::Result<usize> {
    let metadata = fs::metadata(source).map_err(|e| with_path(e, source))?;
    if !metadata.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("template source {} is not a directory", source.display()),
        ));
    }

    fs::create_dir_all(target).map_err(|e| with_path(e, target))?;
    copy_dir(source, target)
}

fn copy_dir(source: &Path, target: &Path) -> io::Result<usize> {
    let mut entries = fs::read_dir(source)
        .map_err(|e| with_path(e, source))?
        .collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut copied = 0;
    for entry in entries {
        let from = entry.path();
        let to = target.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| with_path(e, &from))?;

        if file_type.is_symlink() {
            debug!("Skipping symlink {}", from.display());
        } else if file_type.is_dir() {
            fs::create_dir_all(&to).map_err(|e| with_path(e, &to))?;
            copied += copy_dir(&from, &to)?;
        } else if file_type.is_file() {
            copy_file(&from, &to)?;
            copied += 1;
        } else {
            debug!("Skipping special file {}", from.display());
        }
    }
    Ok(copied)
}

fn copy_file(from: &Path, to: &Path) -> io::Result<()> {
    let permissions = fs::metadata(from)
        .map_err(|e| with_path(e, from))?
        .permissions();
    fs::copy(from, to).map_err(|e| with_path(e, from))?;
    fs::set_permissions(to, permissions).map_err(|e| with_path(e, to))
}

fn with_path(err: io::Error, path: &Path) -> io::Error {
    io::Error::new(err.kind(), format!("{}: {}", path.display(), err))
}
