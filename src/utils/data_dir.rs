//! Global data directory for persistent storage.
//!
//! Defaults to `~/.peershare/` but can be overridden via `--data-dir`.
//! Must be initialized once at startup via `init()`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to
/// `~/.peershare/`, or `./.peershare/` when no home directory is known.
/// Later calls are ignored.
pub fn init(custom: Option<&Path>) -> &'static Path {
    DATA_DIR.get_or_init(|| match custom {
        Some(p) => p.to_path_buf(),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".peershare"),
    })
}

/// Returns the global data directory path.
///
/// Panics if `init()` has not been called.
pub fn get() -> &'static Path {
    DATA_DIR
        .get()
        .expect("data_dir not initialized, call data_dir::init() first")
}
