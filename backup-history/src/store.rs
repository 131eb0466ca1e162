use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::models::session::SessionProgress;
use crate::models::{log_roll, meta, session};
use async_trait::async_trait;
use backup_core::fs::BackupFs;
use backup_core::history::{ancestors_from_history, BackupHistory};
use backup_core::manifest::{BackupImage, IncrTimestampMap, TableName};
use backup_core::session::BackupInfo;
use backup_core::Result;
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

fn root_key(root: &Path) -> String {
    root.display().to_string()
}

/// [`BackupHistory`] persisted in SQLite.
pub struct SqliteBackupHistory {
    pool: DbPool,
    fs: Arc<dyn BackupFs>,
}

impl SqliteBackupHistory {
    /// Open (and migrate) the database at `db_path`.
    pub fn open(db_path: &Path, fs: Arc<dyn BackupFs>) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let pool = create_pool(db_path)?;
        migrate(&pool)?;
        info!("Backup history opened at {}", db_path.display());
        Ok(Self { pool, fs })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        let value = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(anyhow::Error::from)??;
        Ok(value)
    }

    /// Every completed session, newest first, across all roots.
    pub async fn all_completed(&self) -> Result<Vec<BackupInfo>> {
        self.blocking(|conn| session::find_completed(conn, None)).await
    }

    pub async fn progress(&self, backup_id: &str) -> Result<Option<SessionProgress>> {
        let id = backup_id.to_string();
        self.blocking(move |conn| session::find_progress(conn, &id)).await
    }

    /// Covered log files of `root` with the backup that covered them.
    pub async fn wal_files(&self, root: &Path) -> Result<BTreeMap<String, String>> {
        let root = root_key(root);
        let rows = self
            .blocking(move |conn| log_roll::wal_files(conn, &root))
            .await?;
        Ok(rows.into_iter().collect())
    }
}

#[async_trait]
impl BackupHistory for SqliteBackupHistory {
    async fn update_backup_info(&self, info: &BackupInfo) -> Result<()> {
        let info = info.clone();
        debug!(backup_id = %info.backup_id, state = %info.state, "Persisting backup session");
        self.blocking(move |conn| session::upsert(conn, &info)).await
    }

    async fn backup_info(&self, backup_id: &str) -> Result<Option<BackupInfo>> {
        let id = backup_id.to_string();
        self.blocking(move |conn| session::find_by_id(conn, &id)).await
    }

    async fn completed_history(&self, root: &Path) -> Result<Vec<BackupInfo>> {
        let root = root_key(root);
        self.blocking(move |conn| session::find_completed(conn, Some(&root)))
            .await
    }

    async fn get_ancestors(&self, info: &BackupInfo) -> Result<Vec<BackupImage>> {
        let history = self.completed_history(&info.target_root_dir).await?;
        ancestors_from_history(self.fs.as_ref(), info, &history)
    }

    async fn read_backup_start_code(&self, root: &Path) -> Result<Option<i64>> {
        let root = root_key(root);
        let value = self
            .blocking(move |conn| meta::get(conn, &root, meta::START_CODE_KEY))
            .await?;
        match value {
            Some(v) => Ok(Some(v.parse::<i64>().map_err(anyhow::Error::from)?)),
            None => Ok(None),
        }
    }

    async fn write_backup_start_code(&self, start_code: i64, root: &Path) -> Result<()> {
        let root = root_key(root);
        self.blocking(move |conn| {
            meta::set(conn, &root, meta::START_CODE_KEY, &start_code.to_string())
        })
        .await
    }

    async fn read_region_server_last_log_roll_result(
        &self,
        root: &Path,
    ) -> Result<HashMap<String, i64>> {
        let root = root_key(root);
        self.blocking(move |conn| log_roll::roll_results(conn, &root))
            .await
    }

    async fn write_region_server_last_log_roll_result(
        &self,
        server: &str,
        timestamp: i64,
        root: &Path,
    ) -> Result<()> {
        let root = root_key(root);
        let server = server.to_string();
        self.blocking(move |conn| log_roll::set_roll_result(conn, &root, &server, timestamp))
            .await
    }

    async fn record_wal_files(&self, files: &[String], backup_id: &str, root: &Path) -> Result<()> {
        let root = root_key(root);
        let files = files.to_vec();
        let backup_id = backup_id.to_string();
        self.blocking(move |conn| log_roll::record_wal_files(conn, &root, &files, &backup_id))
            .await
    }

    async fn add_incremental_backup_table_set(
        &self,
        tables: &[TableName],
        root: &Path,
    ) -> Result<()> {
        let root = root_key(root);
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        self.blocking(move |conn| meta::add_incr_tables(conn, &root, &tables))
            .await
    }

    async fn incremental_backup_table_set(&self, root: &Path) -> Result<BTreeSet<TableName>> {
        let root = root_key(root);
        let names = self
            .blocking(move |conn| meta::incr_tables(conn, &root))
            .await?;
        names.iter().map(|n| n.parse()).collect()
    }

    async fn write_region_server_log_timestamp(
        &self,
        tables: &[TableName],
        timestamps: &HashMap<String, i64>,
        root: &Path,
    ) -> Result<()> {
        let root = root_key(root);
        let tables: Vec<String> = tables.iter().map(|t| t.to_string()).collect();
        let timestamps = timestamps.clone();
        self.blocking(move |conn| log_roll::write_table_timestamps(conn, &root, &tables, &timestamps))
            .await
    }

    async fn read_log_timestamp_map(&self, root: &Path) -> Result<IncrTimestampMap> {
        let root = root_key(root);
        let rows = self
            .blocking(move |conn| log_roll::table_timestamps(conn, &root))
            .await?;

        let mut map: IncrTimestampMap = HashMap::new();
        for (table, server, ts) in rows {
            map.entry(table.parse()?).or_default().insert(server, ts);
        }
        Ok(map)
    }
}
