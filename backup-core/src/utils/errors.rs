//! Error types for the backup core.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Unregistered procedure, malformed request or unbound manifest.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Procedure '{signature} : {instance}' wasn't completed in expectedTime:{max_wait_ms} ms")]
    ProcedureTimeout {
        signature: String,
        instance: String,
        max_wait_ms: u64,
    },

    #[error("Interrupted: {0}")]
    Cancelled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No manifest file found in: {}", .0.display())]
    ManifestNotFound(PathBuf),

    #[error("Manifest decode error: {0}")]
    ManifestDecode(#[from] serde_json::Error),

    #[error("Invalid backup id: {0}")]
    InvalidBackupId(String),

    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Invalid server address: {0}")]
    InvalidServerAddress(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Failed of exporting snapshot {snapshot} to {} with reason code {code}", .target.display())]
    CopyFailed {
        snapshot: String,
        target: PathBuf,
        code: i32,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    /// Message recorded on a failed session; never empty.
    pub fn failure_message(&self) -> String {
        let msg = self.to_string();
        if msg.is_empty() {
            "BackupError".to_string()
        } else {
            msg
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
