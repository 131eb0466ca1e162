//! Ancestor selection for a new backup from the completed backup history.

use super::coverage::can_cover_image_set;
use super::image::{BackupImage, BackupType, TableName};
use crate::session::{BackupInfo, BackupState};
use crate::utils::errors::Result;
use tracing::debug;

/// Images the backup in `session` depends on.
///
/// Full backups depend on nothing. For an incremental backup, `history` is
/// walked newest first: full images are collected unless the ones already
/// collected cover them, and the first incremental image ends the walk. If
/// that incremental image is not covered, the image loaded from its overall
/// log manifest (with its own ancestors) is added.
pub fn compute_ancestors<F>(
    session: &BackupInfo,
    history: &[BackupInfo],
    mut load_log_image: F,
) -> Result<Vec<BackupImage>>
where
    F: FnMut(&BackupInfo) -> Result<BackupImage>,
{
    let mut ancestors: Vec<BackupImage> = Vec::new();
    if session.backup_type == BackupType::Full {
        return Ok(ancestors);
    }

    let mut candidates: Vec<&BackupInfo> = history
        .iter()
        .filter(|b| {
            b.state == BackupState::Complete
                && b.backup_id != session.backup_id
                && b.target_root_dir == session.target_root_dir
        })
        .collect();
    candidates.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));

    for backup in candidates {
        let image = backup.to_image();
        match backup.backup_type {
            BackupType::Full => {
                if !can_cover_image_set(&ancestors, &image) {
                    ancestors.push(image);
                }
            }
            BackupType::Incremental => {
                if !can_cover_image_set(&ancestors, &image) {
                    ancestors.push(load_log_image(backup)?);
                }
                break;
            }
        }
    }

    debug!(
        backup_id = %session.backup_id,
        ancestors = ?ancestors.iter().map(|a| a.backup_id()).collect::<Vec<_>>(),
        "Computed backup ancestors"
    );
    Ok(ancestors)
}

/// The part of `ancestors` relevant to `table`, up to and including the first
/// full image that contains it.
pub fn table_ancestors(ancestors: &[BackupImage], table: &TableName) -> Vec<BackupImage> {
    let mut result = Vec::new();
    for image in ancestors {
        if image.has_table(table) {
            result.push(image.clone());
            if image.backup_type() == BackupType::Full {
                break;
            }
        }
    }
    result
}
