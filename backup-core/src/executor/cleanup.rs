//! Cleanup of snapshots, staging output and partially copied table data.
//!
//! Every routine here logs its own failures and keeps going; none of them
//! can replace the error that made a backup fail.

use crate::fs::layout::{DISTCP_LOG_PREFIX, EXPORT_SNAPSHOT_PREFIX};
use crate::fs::BackupFs;
use crate::services::SnapshotService;
use crate::session::BackupInfo;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Delete every snapshot recorded on the session.
pub async fn delete_snapshots(snapshots: &dyn SnapshotService, session: &BackupInfo) {
    debug!(backup_id = %session.backup_id, "Trying to delete snapshots for full backup");
    for name in session.snapshot_names() {
        match snapshots.delete_snapshot(&name).await {
            Ok(()) => debug!(
                backup_id = %session.backup_id,
                snapshot = %name,
                "Deleted snapshot"
            ),
            Err(e) => warn!(snapshot = %name, "Failed to delete snapshot: {}", e),
        }
    }
}

/// Remove entries of `dir` whose name starts with `prefix`.
fn delete_prefixed(fs: &dyn BackupFs, dir: &Path, prefix: &str) {
    let entries = match fs.list(dir) {
        Ok(Some(entries)) => entries,
        Ok(None) => return,
        Err(e) => {
            warn!("Cannot list {}: {}", dir.display(), e);
            return;
        }
    };

    for entry in entries {
        let matches = entry
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix));
        if !matches {
            continue;
        }
        debug!("Delete staging output: {}", entry.display());
        if let Err(e) = fs.delete_recursive(&entry) {
            warn!("Can not delete {}: {}", entry.display(), e);
        }
    }
}

/// Staging directories left behind by snapshot export.
pub fn cleanup_export_snapshot_log(fs: &dyn BackupFs, staging_root: &Path) {
    delete_prefixed(fs, staging_root, EXPORT_SNAPSHOT_PREFIX);
}

/// Staging directories left behind by log copies, next to the log target dir.
pub fn cleanup_distcp_log(fs: &dyn BackupFs, session: &BackupInfo) {
    if let Some(parent) = session.hlog_target_dir.as_deref().and_then(Path::parent) {
        delete_prefixed(fs, parent, DISTCP_LOG_PREFIX);
    }
}

/// Remove partially copied table data once the backup reached a copy phase.
///
/// Each table is its own unit: its backup directory is deleted, then the table
/// directory above it if nothing else is left there.
pub fn cleanup_target_dir(fs: &dyn BackupFs, session: &BackupInfo) {
    debug!(
        backup_id = %session.backup_id,
        phase = %session.phase,
        "Trying to cleanup up target dir"
    );
    if !session.phase.has_copied_data() {
        return;
    }

    for table in &session.tables {
        let Some(status) = session.backup_status(table) else {
            continue;
        };
        let target = &status.target_dir;
        match fs.delete_recursive(target) {
            Ok(true) => info!("Cleaning up uncompleted backup data at {} done.", target.display()),
            Ok(false) => info!("No data has been copied to {}.", target.display()),
            Err(e) => {
                error!(
                    backup_id = %session.backup_id,
                    table = %table,
                    "Cleaning up uncompleted backup data at {} failed: {}",
                    target.display(),
                    e
                );
                continue;
            }
        }

        let Some(table_dir) = target.parent() else {
            continue;
        };
        match fs.list(table_dir) {
            Ok(Some(entries)) if !entries.is_empty() => {}
            Ok(_) => {
                if let Err(e) = fs.delete_recursive(table_dir) {
                    warn!("Can not delete {}: {}", table_dir.display(), e);
                } else {
                    debug!("{} is empty, remove it.", table_dir.display());
                }
            }
            Err(e) => warn!("Cannot list {}: {}", table_dir.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::LocalFs;
    use crate::manifest::BackupType;
    use crate::session::{BackupPhase, BackupRequest};
    use std::fs;
    use tempfile::TempDir;

    fn session(root: &Path, tables: &[&str]) -> BackupInfo {
        let request = BackupRequest::new(
            BackupType::Full,
            tables.iter().map(|t| t.parse().unwrap()).collect(),
            root.to_path_buf(),
        );
        BackupInfo::new("backup_2", &request).unwrap()
    }

    #[test]
    fn test_cleanup_target_dir_per_table() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut info = session(root, &["t1", "t2", "t3"]);

        // t1: partial copy, nothing else in the table dir
        fs::create_dir_all(root.join("default/t1/backup_2")).unwrap();
        fs::write(root.join("default/t1/backup_2/data"), b"x").unwrap();
        // t2: partial copy next to an older backup
        fs::create_dir_all(root.join("default/t2/backup_2")).unwrap();
        fs::create_dir_all(root.join("default/t2/backup_1")).unwrap();
        // t3: never copied

        info.phase = BackupPhase::Request;
        cleanup_target_dir(&LocalFs::new(), &info);
        assert!(root.join("default/t1/backup_2/data").exists());

        info.phase = BackupPhase::SnapshotCopy;
        cleanup_target_dir(&LocalFs::new(), &info);
        assert!(!root.join("default/t1").exists());
        assert!(!root.join("default/t2/backup_2").exists());
        assert!(root.join("default/t2/backup_1").exists());
        assert!(!root.join("default/t3").exists());
    }

    #[test]
    fn test_staging_cleanup_matches_prefix_only() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path();
        fs::create_dir_all(staging.join("exportSnapshot-123/a")).unwrap();
        fs::create_dir_all(staging.join("keep-me")).unwrap();
        cleanup_export_snapshot_log(&LocalFs::new(), staging);
        assert!(!staging.join("exportSnapshot-123").exists());
        assert!(staging.join("keep-me").exists());

        // missing staging root is not an error
        cleanup_export_snapshot_log(&LocalFs::new(), &staging.join("absent"));
    }

    #[test]
    fn test_distcp_log_cleanup_next_to_log_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let request = BackupRequest::new(BackupType::Incremental, vec!["t1".parse().unwrap()], root.to_path_buf());
        let info = BackupInfo::new("backup_3", &request).unwrap();

        fs::create_dir_all(root.join("WALs/_distcp_logs_77")).unwrap();
        fs::create_dir_all(root.join("WALs/backup_2")).unwrap();
        cleanup_distcp_log(&LocalFs::new(), &info);
        assert!(!root.join("WALs/_distcp_logs_77").exists());
        assert!(root.join("WALs/backup_2").exists());
    }
}
