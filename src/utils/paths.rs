//! Path helpers for files named by a remote peer.

use std::path::{Path, PathBuf};

/// Reduce a peer-supplied file name to a single safe path component.
///
/// Directory parts, `.`/`..` and characters outside a conservative set are
/// dropped, so the result can never escape the target directory.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .next_back()
        .unwrap_or("");

    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let safe = safe.trim_matches(|c| c == '.' || c == ' ');

    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

/// First path of the form `name`, `name (1)`, `name (2)`... that does not exist.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().into_owned());

    (1u32..)
        .map(|n| {
            let name = match &ext {
                Some(ext) => format!("{stem} ({n}).{ext}"),
                None => format!("{stem} ({n})"),
            };
            parent.join(name)
        })
        .find(|candidate| !candidate.exists())
        .unwrap_or_else(|| path.to_path_buf())
}
