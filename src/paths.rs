//! File layout for a synchronized database and its sidecars.

use std::path::{Path, PathBuf};

/// The history sidecar next to the database file.
pub fn history_path(db_path: &Path) -> PathBuf {
    sibling(db_path, "history")
}

/// The pending-bootstrap buffer.
pub fn pending_bootstrap_path(db_path: &Path) -> PathBuf {
    sibling(db_path, "pending_bootstrap")
}

/// The fresh copy downloaded during a client reset.
pub fn fresh_copy_path(db_path: &Path) -> PathBuf {
    sibling(db_path, "fresh")
}

/// Where a backed-up file lands before deletion (timestamped by caller).
pub fn backup_path(db_path: &Path, timestamp_ms: u64) -> PathBuf {
    sibling(db_path, &format!("backup-{timestamp_ms}"))
}

/// The metadata store under the base directory.
pub fn metadata_path(base_dir: &Path) -> PathBuf {
    base_dir.join("sync_metadata.sqlite")
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "db".to_string());
    name.push('.');
    name.push_str(suffix);
    db_path.with_file_name(name)
}
