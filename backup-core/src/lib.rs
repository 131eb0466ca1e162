//! Backup Core Library
//!
//! Orchestration core for full table backups: the backup image lineage graph,
//! manifest persistence, restore chain planning, procedure polling and the
//! phased full-backup driver with transactional cleanup on failure.

pub mod config;
pub mod executor;
pub mod fs;
pub mod history;
pub mod manifest;
pub mod procedure;
pub mod services;
pub mod session;
pub mod utils;

// Re-export commonly used types
pub use config::BackupConfig;
pub use executor::{BackupOutcome, BackupServices, FullTableBackupClient};
pub use manifest::{BackupImage, BackupManifest, BackupType, TableName};
pub use session::{BackupInfo, BackupPhase, BackupRequest, BackupState};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
