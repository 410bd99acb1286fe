//! Schema and migration boundary for the session store.

use anyhow::Context;
use rusqlite::Connection;
use std::collections::HashSet;

pub(crate) fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            status TEXT NOT NULL,
            nonce TEXT,
            worker_context TEXT,
            capability_token TEXT,
            progress INTEGER,
            phase TEXT,
            message TEXT,
            result_json TEXT,
            error_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_updated_at ON sessions(updated_at);",
    )
    .context("create sessions schema")?;
    migrate_additive(conn)?;
    Ok(())
}

/// Additive column migrations for stores created by older builds.
pub(crate) fn migrate_additive(conn: &Connection) -> anyhow::Result<()> {
    let cols = get_columns(conn, "sessions")?;
    add_column_if_missing(conn, &cols, "sessions", "capability_token", "TEXT")?;
    add_column_if_missing(conn, &cols, "sessions", "progress", "INTEGER")?;
    add_column_if_missing(conn, &cols, "sessions", "completed_at", "TEXT")?;
    Ok(())
}

pub(crate) fn get_columns(conn: &Connection, table: &str) -> anyhow::Result<HashSet<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", table))
        .context("prepare pragma table_info")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

pub(crate) fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> anyhow::Result<()> {
    if !cols.contains(col) {
        let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty);
        conn.execute(&sql, []).context("alter table add column")?;
    }
    Ok(())
}
