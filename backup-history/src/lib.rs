//! SQLite-backed backup history store.
//!
//! Sessions, start codes, log roll results and covered log files are kept in
//! one SQLite database per backup system, shared by every backup root.

pub mod db;
pub mod models;
pub mod store;

pub use db::connection::{create_pool, DbPool};
pub use store::SqliteBackupHistory;
