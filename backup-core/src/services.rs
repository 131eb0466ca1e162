//! Cluster services the backup driver calls out to.

use crate::manifest::{BackupType, TableName};
use crate::session::BackupInfo;
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

#[async_trait]
pub trait SnapshotService: Send + Sync {
    async fn take_snapshot(&self, name: &str, table: &TableName) -> Result<()>;

    async fn delete_snapshot(&self, name: &str) -> Result<()>;
}

/// Copies a snapshot (or log files) into the backup root.
#[async_trait]
pub trait CopyService: Send + Sync {
    /// Returns the exit code of the copy; 0 means success. The service may
    /// record bytes copied on `session`.
    async fn copy(
        &self,
        session: &mut BackupInfo,
        backup_type: BackupType,
        request: &CopyRequest,
    ) -> Result<i32>;
}

/// Lists write-ahead log files of the cluster.
#[async_trait]
pub trait WalCatalog: Send + Sync {
    /// Log files of each server older than that server's timestamp in
    /// `roll_timestamps` (keyed by `host:port`).
    async fn files_older_than(&self, roll_timestamps: &HashMap<String, i64>) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub snapshot_name: String,
    pub target_dir: PathBuf,
    /// Number of parallel copy workers
    pub workers: Option<u32>,
    /// Per worker limit in MB/s
    pub bandwidth: Option<u64>,
}

impl CopyRequest {
    /// Positional arguments for tool-style copy services.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-snapshot".to_string(),
            self.snapshot_name.clone(),
            "-copy-to".to_string(),
            self.target_dir.display().to_string(),
        ];
        if let Some(workers) = self.workers {
            args.push("-mappers".to_string());
            args.push(workers.to_string());
        }
        if let Some(bandwidth) = self.bandwidth {
            args.push("-bandwidth".to_string());
            args.push(bandwidth.to_string());
        }
        args
    }
}
