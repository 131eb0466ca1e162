//! Storage access for manifests and cleanup.
//!
//! The driver only touches the backup root through [`BackupFs`]; the layout
//! helpers in [`layout`] fix where each backup's data and manifests live.

pub mod layout;
pub mod local;

use crate::utils::errors::Result;
use std::path::{Path, PathBuf};

pub use local::LocalFs;

pub trait BackupFs: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Direct children of `dir`, or `None` if `dir` does not exist.
    fn list(&self, dir: &Path) -> Result<Option<Vec<PathBuf>>>;

    /// Remove `path` and everything below it. Returns `false` if it was absent.
    fn delete_recursive(&self, path: &Path) -> Result<bool>;

    /// Create or overwrite `path`; readers never observe a partial file.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;
}
