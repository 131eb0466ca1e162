//! Coverage checks used by retention: can newer full backups stand in for
//! an older backup when planning a restore?

use super::image::{BackupImage, BackupType};
use std::collections::HashSet;
use tracing::debug;

/// `full` covers `image` when it is a full backup, started no earlier than
/// `image`, and backs up every table of `image`.
pub fn can_cover_image(full: &BackupImage, image: &BackupImage) -> bool {
    if full.backup_type() == BackupType::Incremental {
        return false;
    }
    if full.start_ts() < image.start_ts() {
        return false;
    }
    if !image.tables().iter().all(|t| full.has_table(t)) {
        return false;
    }

    debug!("Backup image {} can cover {}", full.backup_id(), image.backup_id());
    true
}

/// Set form of [`can_cover_image`]: every member must be a full backup started
/// no earlier than `image`, and together they must back up every table of `image`.
pub fn can_cover_image_set(full_images: &[BackupImage], image: &BackupImage) -> bool {
    if full_images
        .iter()
        .any(|f| f.backup_type() == BackupType::Incremental || f.start_ts() < image.start_ts())
    {
        return false;
    }

    let covered: HashSet<_> = full_images.iter().flat_map(|f| f.tables()).collect();
    if !image.tables().iter().all(|t| covered.contains(t)) {
        return false;
    }

    debug!("Full image set can cover image {}", image.backup_id());
    true
}
