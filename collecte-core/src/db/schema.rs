//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version of the application store
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: entities, outbox, device metadata
    r#"
    -- Collected records. Ids are either client-assigned or allocated here.
    CREATE TABLE IF NOT EXISTS entities (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        fields           JSON NOT NULL,
        created_at       DATETIME NOT NULL,
        server_id        TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_entities_created_at ON entities(created_at);
    CREATE INDEX IF NOT EXISTS idx_entities_server_id ON entities(server_id);

    -- Pending remote mutations. AUTOINCREMENT keeps qids strictly increasing
    -- and never reused, even after the newest item is removed.
    CREATE TABLE IF NOT EXISTS outbox (
        qid              INTEGER PRIMARY KEY AUTOINCREMENT,
        action           JSON NOT NULL,
        enqueued_at      DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS meta (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );
    "#,
];

/// Run all pending migrations of the application store
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    apply_migrations(conn, MIGRATIONS, "store")
}

/// Apply every migration newer than the database's `user_version`.
///
/// Each migration and its version bump commit together.
pub fn apply_migrations(
    conn: &Connection,
    migrations: &[&str],
    label: &str,
) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = migrations.len() as i32;

    tracing::info!(
        database = label,
        current_version,
        target_version,
        "Checking database migrations"
    );

    for (i, migration) in migrations.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(database = label, version, "Running migration");
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
        }
    }

    if current_version < target_version {
        tracing::info!(
            database = label,
            from = current_version,
            to = target_version,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        // Run migrations twice - should be idempotent
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_tables_and_indexes_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["entities", "outbox", "meta"] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Table {} should exist", table);
        }

        let index_exists: i32 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name='idx_entities_created_at'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(index_exists, 1);
    }
}
