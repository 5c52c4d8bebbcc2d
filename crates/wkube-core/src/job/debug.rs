//! Debug listing of a mapped path before and after the command.
//!
//! Enabled by `DEBUG_WKUBE_MAPPING_PATH`; the walk goes to the fan-out log,
//! which is the whole point: mapping mistakes show up in the remote job log
//! where the user can see them.

use std::fs;
use std::path::Path;

use tracing::info;

/// Walk `path` and log every entry, marking symlinks with their targets.
/// Does nothing when the variable is unset.
pub(crate) fn check_and_list_debug_path(phase: &str, path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };

    info!("DEBUG_WKUBE_MAPPING_PATH is set — listing {path:?} ({phase}):");

    match fs::metadata(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            info!("{path:?} does not exist");
            return;
        },
        Err(err) => {
            info!("Error checking {path:?}: {err}");
            return;
        },
        Ok(meta) if !meta.is_dir() => {
            info!("{path:?} exists but is not a directory");
            return;
        },
        Ok(_) => {},
    }

    list_entry(path);
}

fn list_entry(path: &Path) {
    let Ok(meta) = fs::symlink_metadata(path) else {
        info!("Error lstat {}", path.display());
        return;
    };
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        match fs::read_link(path) {
            Ok(target) => info!("[LINK] {} -> {}", path.display(), target.display()),
            Err(err) => info!("[LINK] {} -> (error reading link target: {err})", path.display()),
        }
        return;
    }

    if file_type.is_dir() {
        info!("[DIR ] {}", path.display());
        let Ok(entries) = fs::read_dir(path) else {
            info!("Error accessing {}", path.display());
            return;
        };
        let mut entries: Vec<_> = entries.flatten().collect();
        entries.sort_by_key(fs::DirEntry::file_name);
        for entry in entries {
            list_entry(&entry.path());
        }
        return;
    }

    if file_type.is_file() {
        info!("[FILE] {}", path.display());
    } else {
        info!("[OTHER] {}", path.display());
    }
}
