//! Local filesystem operations backing mapping tasks.

use std::fs;
use std::io;
use std::os::unix::fs as unix_fs;
use std::path::{Path, PathBuf};

use super::MappingError;

fn io_err(path: impl AsRef<Path>, source: io::Error) -> MappingError {
    MappingError::Io {
        path: path.as_ref().display().to_string(),
        source,
    }
}

/// Create a symlink at `link` resolving to `mounted`.
///
/// A missing mounted source is materialized lazily when the rule denotes a
/// directory (trailing `/`); pipe semantics let a producer job create the
/// shared directory on first use. An existing symlink at the link path is a
/// conflict (a second identical mapping, or leftovers from a previous
/// container); anything else at the link path is removed.
///
/// # Errors
///
/// Returns [`MappingError::MissingMountedSource`], a conflict, a loop, or an
/// io error.
pub fn symlink_from_mounted(mounted: &str, link: &str) -> Result<(), MappingError> {
    if !Path::new(mounted).exists() {
        if mounted.ends_with('/') {
            fs::create_dir_all(mounted).map_err(|e| io_err(mounted, e))?;
        } else {
            return Err(MappingError::MissingMountedSource {
                path: mounted.to_string(),
            });
        }
    }

    let link = link.trim_end_matches('/');
    if let Some(parent) = Path::new(link).parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }

    match fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(MappingError::SymlinkConflict {
                path: link.to_string(),
            });
        },
        Ok(meta) => {
            if meta.is_dir() {
                fs::remove_dir_all(link).map_err(|e| io_err(link, e))?;
            } else {
                fs::remove_file(link).map_err(|e| io_err(link, e))?;
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => return Err(io_err(link, e)),
    }

    unix_fs::symlink(mounted, link).map_err(|e| io_err(link, e))?;

    // Resolve the link once to catch loops before the command trips on them.
    if let Err(e) = fs::canonicalize(link) {
        let _ = fs::remove_file(link);
        if e.raw_os_error() == Some(nix::errno::Errno::ELOOP as i32) {
            return Err(MappingError::SymlinkLoop {
                path: link.to_string(),
            });
        }
        return Err(MappingError::SymlinkResolve {
            path: link.to_string(),
            source: e,
        });
    }

    Ok(())
}

/// Recursively copy a directory tree.
///
/// # Errors
///
/// Returns [`MappingError::NotADirectory`] when the source is not a
/// directory, or an io error from the walk.
pub fn copy_dir_recursive(source: &str, destination: &str) -> Result<(), MappingError> {
    let meta = fs::metadata(source).map_err(|e| io_err(source, e))?;
    if !meta.is_dir() {
        return Err(MappingError::NotADirectory {
            path: source.to_string(),
        });
    }

    fs::create_dir_all(destination).map_err(|e| io_err(destination, e))?;
    copy_tree(Path::new(source), Path::new(destination))
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), MappingError> {
    let mut entries: Vec<_> = fs::read_dir(src)
        .map_err(|e| io_err(src, e))?
        .collect::<io::Result<_>>()
        .map_err(|e| io_err(src, e))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| io_err(&target, e))?;
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| io_err(&target, e))?;
        }
    }
    Ok(())
}

/// Collect every regular file under a directory, depth first, in a stable
/// order.
///
/// # Errors
///
/// Returns the first io error from the walk.
pub fn walk_files(dir: &Path) -> Result<Vec<PathBuf>, MappingError> {
    let mut files = Vec::new();
    walk_into(dir, &mut files)?;
    Ok(files)
}

fn walk_into(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), MappingError> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map_err(|e| io_err(dir, e))?
        .collect::<io::Result<_>>()
        .map_err(|e| io_err(dir, e))?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    for entry in entries {
        let file_type = entry.file_type().map_err(|e| io_err(entry.path(), e))?;
        if file_type.is_dir() {
            walk_into(&entry.path(), files)?;
        } else {
            files.push(entry.path());
        }
    }
    Ok(())
}
