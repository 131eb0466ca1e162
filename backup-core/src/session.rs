//! Backup requests and the session context of one backup attempt.

use crate::fs::layout::{log_backup_dir, table_backup_dir};
use crate::manifest::{BackupImage, BackupType, IncrTimestampMap, TableName};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupState {
    Waiting,
    Running,
    Complete,
    Failed,
    Cancelled,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupState::Waiting => "WAITING",
            BackupState::Running => "RUNNING",
            BackupState::Complete => "COMPLETE",
            BackupState::Failed => "FAILED",
            BackupState::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupPhase {
    Request,
    #[serde(rename = "SNAPSHOTCOPY")]
    SnapshotCopy,
    IncrementalCopy,
    StoreManifest,
}

impl BackupPhase {
    /// Whether data may already have been written under the target root.
    pub fn has_copied_data(self) -> bool {
        !matches!(self, BackupPhase::Request)
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupPhase::Request => "REQUEST",
            BackupPhase::SnapshotCopy => "SNAPSHOTCOPY",
            BackupPhase::IncrementalCopy => "INCREMENTAL_COPY",
            BackupPhase::StoreManifest => "STORE_MANIFEST",
        };
        f.write_str(s)
    }
}

/// What the caller asked to back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub tables: Vec<TableName>,
    pub target_root_dir: PathBuf,
    /// Parallelism hint for the copy service
    #[serde(default)]
    pub workers: Option<u32>,
    /// Bandwidth limit per worker in MB/s, for the copy service
    #[serde(default)]
    pub bandwidth: Option<u64>,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType, tables: Vec<TableName>, target_root_dir: PathBuf) -> Self {
        Self {
            backup_type,
            tables,
            target_root_dir,
            workers: None,
            bandwidth: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBackupStatus {
    pub target_dir: PathBuf,
    pub snapshot_name: Option<String>,
    pub bytes_copied: u64,
}

/// Session context of one backup attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub backup_id: String,
    pub backup_type: BackupType,
    pub target_root_dir: PathBuf,
    /// Requested tables, duplicates removed, request order kept
    pub tables: Vec<TableName>,
    pub table_status: BTreeMap<TableName, TableBackupStatus>,
    pub state: BackupState,
    pub phase: BackupPhase,
    pub start_ts: i64,
    pub end_ts: i64,
    pub progress: u8,
    pub failed_msg: Option<String>,
    #[serde(default)]
    pub incr_timestamp_map: IncrTimestampMap,
    pub hlog_target_dir: Option<PathBuf>,
    pub total_bytes_copied: u64,
    pub workers: Option<u32>,
    pub bandwidth: Option<u64>,
}

impl BackupInfo {
    pub fn new(backup_id: impl Into<String>, request: &BackupRequest) -> Result<Self> {
        let backup_id = backup_id.into();
        if backup_id.is_empty() || backup_id.contains(['/', ':']) {
            return Err(BackupError::InvalidBackupId(backup_id));
        }
        if request.tables.is_empty() {
            return Err(BackupError::Config(format!(
                "Backup {backup_id} requests no tables"
            )));
        }

        let mut tables: Vec<TableName> = Vec::with_capacity(request.tables.len());
        for table in &request.tables {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }

        let root = &request.target_root_dir;
        let table_status = tables
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    TableBackupStatus {
                        target_dir: table_backup_dir(root, &backup_id, t),
                        snapshot_name: None,
                        bytes_copied: 0,
                    },
                )
            })
            .collect();

        let hlog_target_dir = match request.backup_type {
            BackupType::Incremental => Some(log_backup_dir(root, &backup_id)),
            BackupType::Full => None,
        };

        Ok(Self {
            backup_id,
            backup_type: request.backup_type,
            target_root_dir: root.clone(),
            tables,
            table_status,
            state: BackupState::Waiting,
            phase: BackupPhase::Request,
            start_ts: 0,
            end_ts: 0,
            progress: 0,
            failed_msg: None,
            incr_timestamp_map: HashMap::new(),
            hlog_target_dir,
            total_bytes_copied: 0,
            workers: request.workers,
            bandwidth: request.bandwidth,
        })
    }

    pub fn backup_status(&self, table: &TableName) -> Option<&TableBackupStatus> {
        self.table_status.get(table)
    }

    pub fn set_snapshot_name(&mut self, table: &TableName, name: String) {
        if let Some(status) = self.table_status.get_mut(table) {
            status.snapshot_name = Some(name);
        }
    }

    pub fn snapshot_name(&self, table: &TableName) -> Option<&str> {
        self.table_status
            .get(table)
            .and_then(|s| s.snapshot_name.as_deref())
    }

    /// Snapshots taken so far, in table order.
    pub fn snapshot_names(&self) -> Vec<String> {
        self.tables
            .iter()
            .filter_map(|t| self.snapshot_name(t).map(str::to_string))
            .collect()
    }

    pub fn add_bytes_copied(&mut self, table: &TableName, bytes: u64) {
        if let Some(status) = self.table_status.get_mut(table) {
            status.bytes_copied += bytes;
        }
        self.total_bytes_copied += bytes;
    }

    /// Image describing this backup, without ancestors.
    pub fn to_image(&self) -> BackupImage {
        let mut image = BackupImage::new(
            self.backup_id.clone(),
            self.backup_type,
            self.target_root_dir.display().to_string(),
            self.tables.clone(),
            self.start_ts,
            self.end_ts,
        );
        if self.backup_type == BackupType::Incremental {
            image.set_incr_time_ranges(self.incr_timestamp_map.clone());
        }
        image
    }

    pub fn table_list_as_string(&self) -> String {
        self.tables
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// One-line summary written when the backup completes.
    pub fn metadata_summary(&self) -> String {
        format!(
            "type={},tablelist={},targetRootDir={},startts={},completets={},bytescopied={}",
            self.backup_type,
            self.table_list_as_string(),
            self.target_root_dir.display(),
            self.start_ts,
            self.end_ts,
            self.total_bytes_copied
        )
    }

    /// One-line record written when the backup fails.
    pub fn failure_record(&self) -> String {
        format!(
            "BackupId={},startts={},failedts={},failedphase={},failedmessage={}",
            self.backup_id,
            self.start_ts,
            self.end_ts,
            self.phase,
            self.failed_msg.as_deref().unwrap_or_default()
        )
    }
}
