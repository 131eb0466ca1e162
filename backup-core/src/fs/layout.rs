//! Directory layout under a backup root.
//!
//! ```text
//! <root>/<namespace>/<qualifier>/<backup_id>/.backup.manifest   table image
//! <root>/WALs/<backup_id>/.backup.manifest                      overall incremental image
//! ```

use crate::manifest::TableName;
use std::path::{Path, PathBuf};

/// Directory holding the overall manifests of incremental backups.
pub const LOG_DIR_NAME: &str = "WALs";

/// Staging directories left by snapshot export.
pub const EXPORT_SNAPSHOT_PREFIX: &str = "exportSnapshot-";

/// Staging directories left by incremental log copies.
pub const DISTCP_LOG_PREFIX: &str = "_distcp_logs";

pub fn table_backup_dir(root: &Path, backup_id: &str, table: &TableName) -> PathBuf {
    root.join(table.namespace())
        .join(table.qualifier())
        .join(backup_id)
}

pub fn log_backup_dir(root: &Path, backup_id: &str) -> PathBuf {
    root.join(LOG_DIR_NAME).join(backup_id)
}
