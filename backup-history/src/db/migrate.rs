use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_sessions (
  backup_id TEXT PRIMARY KEY,
  root_dir TEXT NOT NULL,
  backup_type TEXT NOT NULL CHECK(backup_type IN ('FULL','INCREMENTAL')),
  state TEXT NOT NULL CHECK(state IN ('WAITING','RUNNING','COMPLETE','FAILED','CANCELLED')),
  phase TEXT NOT NULL,
  start_ts INTEGER NOT NULL DEFAULT 0,
  end_ts INTEGER NOT NULL DEFAULT 0,
  progress INTEGER NOT NULL DEFAULT 0,
  failed_msg TEXT,
  info TEXT NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS backup_meta (
  root_dir TEXT NOT NULL,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  PRIMARY KEY (root_dir, key)
);

CREATE TABLE IF NOT EXISTS rs_log_roll (
  root_dir TEXT NOT NULL,
  server TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  PRIMARY KEY (root_dir, server)
);

CREATE TABLE IF NOT EXISTS table_rs_timestamps (
  root_dir TEXT NOT NULL,
  table_name TEXT NOT NULL,
  server TEXT NOT NULL,
  timestamp INTEGER NOT NULL,
  PRIMARY KEY (root_dir, table_name, server)
);

CREATE TABLE IF NOT EXISTS wal_files (
  root_dir TEXT NOT NULL,
  file TEXT NOT NULL,
  backup_id TEXT NOT NULL,
  PRIMARY KEY (root_dir, file)
);

CREATE TABLE IF NOT EXISTS incr_backup_tables (
  root_dir TEXT NOT NULL,
  table_name TEXT NOT NULL,
  PRIMARY KEY (root_dir, table_name)
);

CREATE INDEX IF NOT EXISTS idx_backup_sessions_root ON backup_sessions(root_dir, start_ts DESC);
CREATE INDEX IF NOT EXISTS idx_backup_sessions_state ON backup_sessions(state);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
