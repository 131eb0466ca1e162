//! Backup history store: sessions, start codes and log roll bookkeeping.

use crate::fs::layout::log_backup_dir;
use crate::fs::BackupFs;
use crate::manifest::lineage::{compute_ancestors, table_ancestors};
use crate::manifest::{BackupImage, BackupManifest, IncrTimestampMap, TableName};
use crate::session::{BackupInfo, BackupState};
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Durable record of backup sessions and log roll watermarks.
#[async_trait]
pub trait BackupHistory: Send + Sync {
    /// Insert or replace the record of a session.
    async fn update_backup_info(&self, info: &BackupInfo) -> Result<()>;

    async fn backup_info(&self, backup_id: &str) -> Result<Option<BackupInfo>>;

    /// Completed sessions under `root`, newest first.
    async fn completed_history(&self, root: &Path) -> Result<Vec<BackupInfo>>;

    /// Images the backup in `info` depends on.
    async fn get_ancestors(&self, info: &BackupInfo) -> Result<Vec<BackupImage>>;

    async fn get_table_ancestors(
        &self,
        info: &BackupInfo,
        table: &TableName,
    ) -> Result<Vec<BackupImage>> {
        let ancestors = self.get_ancestors(info).await?;
        Ok(table_ancestors(&ancestors, table))
    }

    /// `None` (or 0) means no backup has been taken under `root` yet.
    async fn read_backup_start_code(&self, root: &Path) -> Result<Option<i64>>;

    async fn write_backup_start_code(&self, start_code: i64, root: &Path) -> Result<()>;

    /// Per region server, the timestamp of its last log roll.
    async fn read_region_server_last_log_roll_result(
        &self,
        root: &Path,
    ) -> Result<HashMap<String, i64>>;

    async fn write_region_server_last_log_roll_result(
        &self,
        server: &str,
        timestamp: i64,
        root: &Path,
    ) -> Result<()>;

    /// Record log files as covered by `backup_id`.
    async fn record_wal_files(&self, files: &[String], backup_id: &str, root: &Path) -> Result<()>;

    async fn add_incremental_backup_table_set(
        &self,
        tables: &[TableName],
        root: &Path,
    ) -> Result<()>;

    async fn incremental_backup_table_set(&self, root: &Path) -> Result<BTreeSet<TableName>>;

    /// Record, for every table, the log timestamps of all servers.
    async fn write_region_server_log_timestamp(
        &self,
        tables: &[TableName],
        timestamps: &HashMap<String, i64>,
        root: &Path,
    ) -> Result<()>;

    async fn read_log_timestamp_map(&self, root: &Path) -> Result<IncrTimestampMap>;
}

/// Per server, the smallest timestamp recorded for it across tables.
pub fn rs_log_timestamp_mins(map: &IncrTimestampMap) -> HashMap<String, i64> {
    let mut mins: HashMap<String, i64> = HashMap::new();
    for servers in map.values() {
        for (server, ts) in servers {
            mins.entry(server.clone())
                .and_modify(|m| *m = (*m).min(*ts))
                .or_insert(*ts);
        }
    }
    mins
}

/// Ancestor images of `session`, loading overall manifests of incremental
/// backups from the backup root when needed.
pub fn ancestors_from_history(
    fs: &dyn BackupFs,
    session: &BackupInfo,
    history: &[BackupInfo],
) -> Result<Vec<BackupImage>> {
    compute_ancestors(session, history, |backup| {
        let dir = backup
            .hlog_target_dir
            .clone()
            .unwrap_or_else(|| log_backup_dir(&backup.target_root_dir, &backup.backup_id));
        Ok(BackupManifest::load(fs, &dir)?.backup_image().clone())
    })
}

#[derive(Default)]
struct HistoryTables {
    sessions: BTreeMap<String, BackupInfo>,
    start_codes: HashMap<PathBuf, i64>,
    roll_results: HashMap<PathBuf, HashMap<String, i64>>,
    wal_files: HashMap<PathBuf, BTreeMap<String, String>>,
    incr_table_sets: HashMap<PathBuf, BTreeSet<TableName>>,
    log_timestamps: HashMap<PathBuf, IncrTimestampMap>,
}

/// History kept in memory, for tests and embedders without a database.
pub struct InMemoryHistory {
    fs: Arc<dyn BackupFs>,
    tables: RwLock<HistoryTables>,
}

impl InMemoryHistory {
    pub fn new(fs: Arc<dyn BackupFs>) -> Self {
        Self {
            fs,
            tables: RwLock::new(HistoryTables::default()),
        }
    }

    /// Log files recorded under `root`, with the backup that covered them.
    pub async fn wal_files(&self, root: &Path) -> BTreeMap<String, String> {
        self.tables
            .read()
            .await
            .wal_files
            .get(root)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BackupHistory for InMemoryHistory {
    async fn update_backup_info(&self, info: &BackupInfo) -> Result<()> {
        self.tables
            .write()
            .await
            .sessions
            .insert(info.backup_id.clone(), info.clone());
        Ok(())
    }

    async fn backup_info(&self, backup_id: &str) -> Result<Option<BackupInfo>> {
        Ok(self.tables.read().await.sessions.get(backup_id).cloned())
    }

    async fn completed_history(&self, root: &Path) -> Result<Vec<BackupInfo>> {
        let mut history: Vec<BackupInfo> = self
            .tables
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.state == BackupState::Complete && s.target_root_dir == root)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
        Ok(history)
    }

    async fn get_ancestors(&self, info: &BackupInfo) -> Result<Vec<BackupImage>> {
        let history = self.completed_history(&info.target_root_dir).await?;
        ancestors_from_history(self.fs.as_ref(), info, &history)
    }

    async fn read_backup_start_code(&self, root: &Path) -> Result<Option<i64>> {
        Ok(self.tables.read().await.start_codes.get(root).copied())
    }

    async fn write_backup_start_code(&self, start_code: i64, root: &Path) -> Result<()> {
        self.tables
            .write()
            .await
            .start_codes
            .insert(root.to_path_buf(), start_code);
        Ok(())
    }

    async fn read_region_server_last_log_roll_result(
        &self,
        root: &Path,
    ) -> Result<HashMap<String, i64>> {
        Ok(self
            .tables
            .read()
            .await
            .roll_results
            .get(root)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_region_server_last_log_roll_result(
        &self,
        server: &str,
        timestamp: i64,
        root: &Path,
    ) -> Result<()> {
        self.tables
            .write()
            .await
            .roll_results
            .entry(root.to_path_buf())
            .or_default()
            .insert(server.to_string(), timestamp);
        Ok(())
    }

    async fn record_wal_files(&self, files: &[String], backup_id: &str, root: &Path) -> Result<()> {
        let mut tables = self.tables.write().await;
        let entry = tables.wal_files.entry(root.to_path_buf()).or_default();
        for file in files {
            entry.insert(file.clone(), backup_id.to_string());
        }
        Ok(())
    }

    async fn add_incremental_backup_table_set(
        &self,
        tables: &[TableName],
        root: &Path,
    ) -> Result<()> {
        self.tables
            .write()
            .await
            .incr_table_sets
            .entry(root.to_path_buf())
            .or_default()
            .extend(tables.iter().cloned());
        Ok(())
    }

    async fn incremental_backup_table_set(&self, root: &Path) -> Result<BTreeSet<TableName>> {
        Ok(self
            .tables
            .read()
            .await
            .incr_table_sets
            .get(root)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_region_server_log_timestamp(
        &self,
        tables: &[TableName],
        timestamps: &HashMap<String, i64>,
        root: &Path,
    ) -> Result<()> {
        let mut guard = self.tables.write().await;
        let map = guard.log_timestamps.entry(root.to_path_buf()).or_default();
        for table in tables {
            map.insert(table.clone(), timestamps.clone());
        }
        Ok(())
    }

    async fn read_log_timestamp_map(&self, root: &Path) -> Result<IncrTimestampMap> {
        Ok(self
            .tables
            .read()
            .await
            .log_timestamps
            .get(root)
            .cloned()
            .unwrap_or_default())
    }
}
