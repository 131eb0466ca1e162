//! Per-root key/value bookkeeping: start code and incremental table set.

use rusqlite::{params, Connection};

pub const START_CODE_KEY: &str = "startcode";

pub fn get(conn: &Connection, root_dir: &str, key: &str) -> anyhow::Result<Option<String>> {
    let mut stmt = conn.prepare("SELECT value FROM backup_meta WHERE root_dir = ? AND key = ?")?;
    let mut rows = stmt.query_map(params![root_dir, key], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

pub fn set(conn: &Connection, root_dir: &str, key: &str, value: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO backup_meta (root_dir, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(root_dir, key) DO UPDATE SET value = excluded.value",
        params![root_dir, key, value],
    )?;
    Ok(())
}

pub fn add_incr_tables(conn: &Connection, root_dir: &str, tables: &[String]) -> anyhow::Result<()> {
    let tx = conn.unchecked_transaction()?;
    for table in tables {
        tx.execute(
            "INSERT OR IGNORE INTO incr_backup_tables (root_dir, table_name) VALUES (?1, ?2)",
            params![root_dir, table],
        )?;
    }
    tx.commit()?;
    Ok(())
}

pub fn incr_tables(conn: &Connection, root_dir: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT table_name FROM incr_backup_tables WHERE root_dir = ? ORDER BY table_name",
    )?;
    let rows = stmt.query_map(params![root_dir], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
