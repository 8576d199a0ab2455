//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- One row per known node
        CREATE TABLE IF NOT EXISTS nodes (
            id TEXT PRIMARY KEY,
            online INTEGER NOT NULL DEFAULT 0,
            allowed INTEGER NOT NULL DEFAULT 0,
            last_seen TEXT
        );

        -- Latest reading per node
        CREATE TABLE IF NOT EXISTS node_data (
            id TEXT PRIMARY KEY REFERENCES nodes(id) ON DELETE CASCADE,
            timestamp TEXT NOT NULL,
            temperature REAL NOT NULL,
            pressure INTEGER NOT NULL,
            altitude REAL NOT NULL,
            humidity INTEGER NOT NULL,
            lux INTEGER NOT NULL,
            sound INTEGER NOT NULL
        );

        -- Permission changes appended by an external authority
        CREATE TABLE IF NOT EXISTS audit (
            entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_id TEXT NOT NULL,
            allowed_value INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        PRAGMA user_version = 1;
        ",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('nodes', 'node_data', 'audit')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
