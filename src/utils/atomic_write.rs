//! Atomic file write utility.
//!
//! Single implementation of the write-to-temp-then-rename pattern used for
//! the history file and for received files.
//!
//! Invariants:
//! - Write goes to `<name>.tmp` next to the target, then a rename replaces it.
//! - On rename failure, the temp file is cleaned up to avoid stale artifacts.
//! - Parent directories are created if absent.
//!
//! Note: `rename()` is atomic on NTFS, ext4, APFS, and all major filesystems
//! when source and destination are on the same mount.

use anyhow::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

/// Temp path used while writing `path`: the full file name plus `.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Atomically write `content` to `path` via a temporary file and rename.
///
/// # Errors
/// Returns an error if the temp file cannot be written or the rename fails.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = temp_path_for(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}
