//! Log roll results, per-table log timestamps and covered log files.

use rusqlite::{params, Connection};
use std::collections::HashMap;

pub fn set_roll_result(conn: &Connection, root_dir: &str, server: &str, timestamp: i64) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO rs_log_roll (root_dir, server, timestamp) VALUES (?1, ?2, ?3)
         ON CONFLICT(root_dir, server) DO UPDATE SET timestamp = excluded.timestamp",
        params![root_dir, server, timestamp],
    )?;
    Ok(())
}

pub fn roll_results(conn: &Connection, root_dir: &str) -> anyhow::Result<HashMap<String, i64>> {
    let mut stmt = conn.prepare("SELECT server, timestamp FROM rs_log_roll WHERE root_dir = ?")?;
    let rows = stmt.query_map(params![root_dir], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut map = HashMap::new();
    for r in rows {
        let (server, ts) = r?;
        map.insert(server, ts);
    }
    Ok(map)
}

/// Replace the server timestamps of each table in `tables`.
pub fn write_table_timestamps(
    conn: &Connection,
    root_dir: &str,
    tables: &[String],
    timestamps: &HashMap<String, i64>,
) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for table in tables {
        tx.execute(
            "DELETE FROM table_rs_timestamps WHERE root_dir = ?1 AND table_name = ?2",
            params![root_dir, table],
        )?;
        for (server, ts) in timestamps {
            tx.execute(
                "INSERT INTO table_rs_timestamps (root_dir, table_name, server, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![root_dir, table, server, ts],
            )?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// `(table, server, timestamp)` rows of one root.
pub fn table_timestamps(conn: &Connection, root_dir: &str) -> anyhow::Result<Vec<(String, String, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT table_name, server, timestamp FROM table_rs_timestamps WHERE root_dir = ?",
    )?;
    let rows = stmt.query_map(params![root_dir], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

pub fn record_wal_files(conn: &Connection, root_dir: &str, files: &[String], backup_id: &str) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for file in files {
        tx.execute(
            "INSERT INTO wal_files (root_dir, file, backup_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(root_dir, file) DO UPDATE SET backup_id = excluded.backup_id",
            params![root_dir, file, backup_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Covered log files of one root with the backup that covered them.
pub fn wal_files(conn: &Connection, root_dir: &str) -> anyhow::Result<Vec<(String, String)>> {
    let mut stmt = conn.prepare("SELECT file, backup_id FROM wal_files WHERE root_dir = ? ORDER BY file")?;
    let rows = stmt.query_map(params![root_dir], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
