//! Utility modules for the backup core.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
