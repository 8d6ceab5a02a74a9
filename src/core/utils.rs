//! Utility functions shared by the supervisor and the target-side API.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generate a time-ordered UUID (v7) used to correlate one supervision session
pub fn generate_session_id() -> uuid::Uuid {
    uuid::Uuid::now_v7()
}

/// Normalize a path to an absolute one without touching the filesystem.
///
/// Symlinks are not resolved and no `\\?\` verbatim prefix is produced.
pub fn normalize_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

/// Seconds since the UNIX epoch
pub fn epoch_seconds(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Milliseconds since the UNIX epoch
pub fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Make a kernel object name usable as a file name.
///
/// Named objects such as `Local\Watchdog-12-Args` contain separators that
/// are not valid in file names on every platform.
pub fn sanitize_object_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}
