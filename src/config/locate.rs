//! Upward search for the project's `.remote_target` file.

use std::path::{Path, PathBuf};

/// Reserved file name marking a project root.
pub const TARGET_FILE_NAME: &str = ".remote_target";

/// Find the nearest `.remote_target` file at or above `start`.
///
/// Checks `start` first, then each parent in turn, and stops once the parent
/// of the current directory is the directory itself (the filesystem root).
/// Only regular files count; a directory named `.remote_target` is skipped.
pub fn find_target_file(start: &Path) -> Option<PathBuf> {
    let mut current = start;
    loop {
        let candidate = current.join(TARGET_FILE_NAME);
        if candidate.is_file() {
            tracing::debug!(path = %candidate.display(), "found target file");
            return Some(candidate);
        }

        // `Path::parent` yields None at "/" and "" and Some("") for bare
        // relative names; treat all of those as reaching the top.
        match current.parent() {
            Some(parent) if parent != current && !parent.as_os_str().is_empty() => {
                current = parent;
            }
            _ => {
                tracing::debug!(start = %start.display(), "no target file in any parent");
                return None;
            }
        }
    }
}
