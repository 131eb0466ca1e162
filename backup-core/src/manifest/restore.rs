//! Restore chain planning over the ancestor graph of a backup image.

use super::image::{BackupImage, BackupType, TableName};
use std::collections::HashSet;

/// The image and every ancestor reachable from it, oldest first (newest first
/// if `reverse`).
///
/// Images are de-duplicated by backup id; two distinct images sharing a start
/// timestamp are both kept and ordered by id.
pub fn restore_dependent_list(image: &BackupImage, reverse: bool) -> Vec<BackupImage> {
    let mut seen = HashSet::new();
    let mut images = Vec::new();
    let mut stack = vec![image];
    while let Some(next) = stack.pop() {
        if !seen.insert(next.backup_id()) {
            continue;
        }
        images.push(next.clone());
        stack.extend(next.ancestors().iter().rev());
    }

    images.sort_by(|a, b| {
        a.start_ts()
            .cmp(&b.start_ts())
            .then_with(|| a.backup_id().cmp(b.backup_id()))
    });
    if reverse {
        images.reverse();
    }
    images
}

/// Minimal chain to restore `table` to this image: newest images touching
/// the table back to (and including) the first full one, returned oldest first.
pub fn dependent_list_by_table(image: &BackupImage, table: &TableName) -> Vec<BackupImage> {
    let mut chain = Vec::new();
    for candidate in restore_dependent_list(image, true) {
        if candidate.has_table(table) {
            let is_full = candidate.backup_type() == BackupType::Full;
            chain.push(candidate);
            if is_full {
                break;
            }
        }
    }
    chain.reverse();
    chain
}

/// Every image in the dependency scope that touches `table`, oldest first.
pub fn all_dependent_list_by_table(image: &BackupImage, table: &TableName) -> Vec<BackupImage> {
    restore_dependent_list(image, false)
        .into_iter()
        .filter(|i| i.has_table(table))
        .collect()
}
