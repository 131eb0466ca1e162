//! Backup manifests.
//!
//! A manifest persists one [`BackupImage`] (with its ancestors and, for
//! incremental backups, the per-server log timestamps) as `.backup.manifest`
//! inside a table backup directory or a log backup directory.

pub mod coverage;
pub mod image;
pub mod lineage;
pub mod restore;

use crate::fs::layout::LOG_DIR_NAME;
use crate::fs::BackupFs;
use crate::session::{BackupInfo, BackupRequest};
use crate::utils::errors::{BackupError, Result};
use image::ImageRecord;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub use coverage::{can_cover_image, can_cover_image_set};
pub use image::{BackupImage, BackupType, IncrTimestampMap, TableName};

pub const MANIFEST_FILE_NAME: &str = ".backup.manifest";

/// Where a manifest is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    /// `<root>/<namespace>/<qualifier>/<backup_id>`
    TableDir(PathBuf),
    /// `<root>/WALs/<backup_id>`
    LogDir(PathBuf),
}

impl ManifestLocation {
    pub fn dir(&self) -> &Path {
        match self {
            ManifestLocation::TableDir(dir) | ManifestLocation::LogDir(dir) => dir,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.dir().join(MANIFEST_FILE_NAME)
    }
}

/// The ways a manifest comes into existence.
#[derive(Debug, Clone, Copy)]
pub enum ManifestSource<'a> {
    /// Overall manifest of an ongoing incremental backup.
    Building(&'a BackupInfo),
    /// Table-scoped manifest of an ongoing backup.
    FromTable(&'a BackupInfo, &'a TableName),
    /// Read back from a backup directory.
    Loaded(&'a Path),
}

#[derive(Debug, Clone)]
pub struct BackupManifest {
    root_dir: PathBuf,
    location: ManifestLocation,
    log_backup_dir: Option<PathBuf>,
    image: BackupImage,
}

impl BackupManifest {
    pub fn open(fs: &dyn BackupFs, source: ManifestSource<'_>) -> Result<Self> {
        match source {
            ManifestSource::Building(session) => Self::for_backup(session),
            ManifestSource::FromTable(session, table) => Self::for_table(session, table),
            ManifestSource::Loaded(dir) => Self::load(fs, dir),
        }
    }

    /// Overall manifest for an ongoing backup, stored under its log backup
    /// directory. Only incremental backups have one.
    pub fn for_backup(session: &BackupInfo) -> Result<Self> {
        let log_dir = session.hlog_target_dir.clone().ok_or_else(|| {
            BackupError::Config(format!(
                "Backup {} has no log backup directory for an overall manifest",
                session.backup_id
            ))
        })?;

        Ok(Self {
            root_dir: session.target_root_dir.clone(),
            location: ManifestLocation::LogDir(log_dir.clone()),
            log_backup_dir: Some(log_dir),
            image: session.to_image(),
        })
    }

    /// Manifest for one table of an ongoing backup, stored with that table's data.
    pub fn for_table(session: &BackupInfo, table: &TableName) -> Result<Self> {
        let status = session.backup_status(table).ok_or_else(|| {
            BackupError::Config(format!(
                "Table {} is not part of backup {}",
                table, session.backup_id
            ))
        })?;

        let image = BackupImage::new(
            session.backup_id.clone(),
            session.backup_type,
            session.target_root_dir.display().to_string(),
            vec![table.clone()],
            session.start_ts,
            session.end_ts,
        );

        Ok(Self {
            root_dir: session.target_root_dir.clone(),
            location: ManifestLocation::TableDir(status.target_dir.clone()),
            log_backup_dir: session.hlog_target_dir.clone(),
            image,
        })
    }

    /// Read the manifest stored in `backup_dir`.
    ///
    /// The backup root is inferred from the directory layout: two levels up
    /// for a log backup directory, three levels up for a table backup directory.
    pub fn load(fs: &dyn BackupFs, backup_dir: &Path) -> Result<Self> {
        debug!("Loading manifest from: {}", backup_dir.display());

        let entries = fs
            .list(backup_dir)?
            .ok_or_else(|| BackupError::ManifestNotFound(backup_dir.to_path_buf()))?;
        let manifest_path = entries
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == MANIFEST_FILE_NAME))
            .ok_or_else(|| BackupError::ManifestNotFound(backup_dir.to_path_buf()))?;

        let bytes = fs.read(&manifest_path)?;
        let record: ImageRecord = serde_json::from_slice(&bytes)?;
        let image = BackupImage::from_record(record)?;

        let shallow = || {
            BackupError::Config(format!(
                "Manifest directory {} is not inside a backup root",
                backup_dir.display()
            ))
        };
        let parent = backup_dir.parent().ok_or_else(shallow)?;
        let (root_dir, location, log_backup_dir) =
            if parent.file_name().is_some_and(|n| n == LOG_DIR_NAME) {
                let root = parent.parent().ok_or_else(shallow)?;
                (
                    root.to_path_buf(),
                    ManifestLocation::LogDir(backup_dir.to_path_buf()),
                    Some(backup_dir.to_path_buf()),
                )
            } else {
                let root = parent.parent().and_then(Path::parent).ok_or_else(shallow)?;
                (
                    root.to_path_buf(),
                    ManifestLocation::TableDir(backup_dir.to_path_buf()),
                    None,
                )
            };

        debug!("Loaded manifest instance from manifest file: {}", manifest_path.display());
        Ok(Self {
            root_dir,
            location,
            log_backup_dir,
            image,
        })
    }

    /// Persist the manifest, replacing any previous one at the same location.
    pub fn store(&self, fs: &dyn BackupFs) -> Result<()> {
        let data = serde_json::to_vec(&self.image.to_record()?)?;
        let path = self.location.manifest_path();
        fs.write_atomic(&path, &data)?;

        info!("Manifest file stored to {}", path.display());
        Ok(())
    }

    pub fn backup_image(&self) -> &BackupImage {
        &self.image
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn location(&self) -> &ManifestLocation {
        &self.location
    }

    pub fn backup_type(&self) -> BackupType {
        self.image.backup_type()
    }

    pub fn table_list(&self) -> &[TableName] {
        self.image.tables()
    }

    pub fn add_dependent_image(&mut self, image: BackupImage) {
        self.image.add_ancestor(image);
    }

    pub fn set_incr_timestamp_map(&mut self, map: IncrTimestampMap) {
        self.image.set_incr_time_ranges(map);
    }

    pub fn incr_timestamp_map(&self) -> &IncrTimestampMap {
        self.image.incr_time_ranges()
    }

    pub fn restore_dependent_list(&self, reverse: bool) -> Vec<BackupImage> {
        restore::restore_dependent_list(&self.image, reverse)
    }

    pub fn dependent_list_by_table(&self, table: &TableName) -> Vec<BackupImage> {
        restore::dependent_list_by_table(&self.image, table)
    }

    pub fn all_dependent_list_by_table(&self, table: &TableName) -> Vec<BackupImage> {
        restore::all_dependent_list_by_table(&self.image, table)
    }

    /// Minimal session describing the backup this manifest belongs to.
    pub fn to_backup_info(&self) -> Result<BackupInfo> {
        let request = BackupRequest::new(
            self.image.backup_type(),
            self.image.tables().to_vec(),
            self.root_dir.clone(),
        );
        let mut info = BackupInfo::new(self.image.backup_id(), &request)?;
        info.start_ts = self.image.start_ts();
        if self.image.backup_type() == BackupType::Incremental {
            info.hlog_target_dir = self.log_backup_dir.clone();
        }
        Ok(info)
    }
}
