use backup_core::session::BackupInfo;
use rusqlite::{params, Connection, Row};

/// State and progress of a session, as shown to status pollers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgress {
    pub state: String,
    pub phase: String,
    pub progress: i64,
}

fn row_to_info(row: &Row) -> rusqlite::Result<String> {
    row.get("info")
}

fn decode(rows: Vec<String>) -> anyhow::Result<Vec<BackupInfo>> {
    rows.iter()
        .map(|json| serde_json::from_str::<BackupInfo>(json).map_err(anyhow::Error::from))
        .collect()
}

pub fn upsert(conn: &Connection, info: &BackupInfo) -> anyhow::Result<()> {
    let json = serde_json::to_string(info)?;
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO backup_sessions (backup_id, root_dir, backup_type, state, phase, start_ts, end_ts, progress, failed_msg, info, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(backup_id) DO UPDATE SET
           root_dir = excluded.root_dir,
           backup_type = excluded.backup_type,
           state = excluded.state,
           phase = excluded.phase,
           start_ts = excluded.start_ts,
           end_ts = excluded.end_ts,
           progress = excluded.progress,
           failed_msg = excluded.failed_msg,
           info = excluded.info,
           updated_at = excluded.updated_at",
        params![
            info.backup_id,
            info.target_root_dir.display().to_string(),
            info.backup_type.to_string(),
            info.state.to_string(),
            info.phase.to_string(),
            info.start_ts,
            info.end_ts,
            info.progress,
            info.failed_msg,
            json,
            now,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, backup_id: &str) -> anyhow::Result<Option<BackupInfo>> {
    let mut stmt = conn.prepare("SELECT info FROM backup_sessions WHERE backup_id = ?")?;
    let mut rows = stmt.query_map(params![backup_id], |row| row_to_info(row))?;
    match rows.next() {
        Some(json) => Ok(Some(serde_json::from_str(&json?)?)),
        None => Ok(None),
    }
}

/// Completed sessions, newest first, optionally limited to one root.
pub fn find_completed(conn: &Connection, root_dir: Option<&str>) -> anyhow::Result<Vec<BackupInfo>> {
    let rows: Vec<String> = match root_dir {
        Some(root) => {
            let mut stmt = conn.prepare(
                "SELECT info FROM backup_sessions WHERE state = 'COMPLETE' AND root_dir = ?
                 ORDER BY start_ts DESC, backup_id DESC",
            )?;
            let rows = stmt.query_map(params![root], |row| row_to_info(row))?;
            rows.collect::<rusqlite::Result<_>>()?
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT info FROM backup_sessions WHERE state = 'COMPLETE'
                 ORDER BY start_ts DESC, backup_id DESC",
            )?;
            let rows = stmt.query_map([], |row| row_to_info(row))?;
            rows.collect::<rusqlite::Result<_>>()?
        }
    };
    decode(rows)
}

pub fn find_progress(conn: &Connection, backup_id: &str) -> anyhow::Result<Option<SessionProgress>> {
    let mut stmt =
        conn.prepare("SELECT state, phase, progress FROM backup_sessions WHERE backup_id = ?")?;
    let mut rows = stmt.query_map(params![backup_id], |row| {
        Ok(SessionProgress {
            state: row.get(0)?,
            phase: row.get(1)?,
            progress: row.get(2)?,
        })
    })?;
    Ok(rows.next().transpose()?)
}
