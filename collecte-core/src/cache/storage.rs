//! SQLite-backed named cache generations
//!
//! Each generation holds response snapshots keyed by request url. Entries keep
//! insertion order: writing an existing key replaces the snapshot and moves it
//! to the end, which is what FIFO trimming evicts by.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::request::Response;
use crate::db::schema::apply_migrations;
use crate::error::{Error, Result};

const CACHE_MIGRATIONS: &[&str] = &[
    // Version 1: generations and their entries
    r#"
    CREATE TABLE IF NOT EXISTS generations (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        name             TEXT NOT NULL UNIQUE,
        created_at       DATETIME NOT NULL
    );

    -- seq is the insertion order used for eviction
    CREATE TABLE IF NOT EXISTS entries (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        generation       TEXT NOT NULL,
        request_key      TEXT NOT NULL,
        status           INTEGER NOT NULL,
        headers          JSON NOT NULL,
        body             BLOB NOT NULL,
        cached_at        DATETIME NOT NULL,
        UNIQUE (generation, request_key)
    );

    CREATE INDEX IF NOT EXISTS idx_entries_key ON entries(request_key);

    -- Controller lifecycle and similar small values
    CREATE TABLE IF NOT EXISTS controller_state (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );
    "#,
];

/// Entry count of one generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationStatus {
    pub name: String,
    pub entries: usize,
}

/// Cache storage with a single serialized connection
pub struct CacheStore {
    conn: Mutex<Connection>,
}

impl CacheStore {
    /// Open or create the cache database at `path`
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(|e| match Error::from(e) {
                Error::Database(e) => Error::StoreUnavailable(e.to_string()),
                other => other,
            })?;

        Self::with_connection(conn)
    }

    /// In-memory cache (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        apply_migrations(&conn, CACHE_MIGRATIONS, "cache")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("cache lock poisoned: {}", e)))
    }

    /// Create the generation if it does not exist yet
    pub fn open_generation(&self, name: &str) -> Result<()> {
        let conn = self.connection()?;
        Self::ensure_generation(&conn, name)
    }

    fn ensure_generation(conn: &Connection, name: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO generations (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Generation names in creation order
    pub fn generations(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT name FROM generations ORDER BY id ASC")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    /// Drop a generation and all of its entries; returns whether it existed
    pub fn delete_generation(&self, name: &str) -> Result<bool> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM entries WHERE generation = ?", [name])?;
        let removed = tx.execute("DELETE FROM generations WHERE name = ?", [name])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Store a snapshot, replacing any previous one for the same key
    pub fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()> {
        let headers = serde_json::to_string(&response.headers)?;

        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;
        Self::ensure_generation(&tx, generation)?;
        tx.execute(
            "DELETE FROM entries WHERE generation = ?1 AND request_key = ?2",
            params![generation, key],
        )?;
        tx.execute(
            "INSERT INTO entries (generation, request_key, status, headers, body, cached_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                generation,
                key,
                response.status,
                headers,
                response.body,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Look up a key in one generation
    pub fn get(&self, generation: &str, key: &str) -> Result<Option<Response>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT status, headers, body FROM entries
                 WHERE generation = ?1 AND request_key = ?2",
                params![generation, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(Self::to_response).transpose()
    }

    /// Look up a key across generations, oldest generation first
    pub fn match_any(&self, key: &str) -> Result<Option<Response>> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT e.status, e.headers, e.body FROM entries e
                 JOIN generations g ON g.name = e.generation
                 WHERE e.request_key = ?
                 ORDER BY g.id ASC
                 LIMIT 1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(Self::to_response).transpose()
    }

    fn to_response((status, headers, body): (u16, String, Vec<u8>)) -> Result<Response> {
        Ok(Response {
            status,
            headers: serde_json::from_str(&headers)?,
            body,
        })
    }

    /// Keys of a generation in insertion order
    pub fn keys(&self, generation: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT request_key FROM entries WHERE generation = ? ORDER BY seq ASC")?;
        let keys = stmt
            .query_map([generation], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    pub fn count(&self, generation: &str) -> Result<usize> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM entries WHERE generation = ?",
            [generation],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    /// Evict the oldest entries until at most `max_entries` remain.
    /// Returns the number evicted.
    pub fn trim(&self, generation: &str, max_entries: usize) -> Result<usize> {
        let conn = self.connection()?;
        let tx = conn.unchecked_transaction()?;
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM entries WHERE generation = ?",
            [generation],
            |r| r.get(0),
        )?;
        let excess = (count - max_entries as i64).max(0);
        let evicted = tx.execute(
            "DELETE FROM entries WHERE seq IN (
                 SELECT seq FROM entries WHERE generation = ?1
                 ORDER BY seq ASC
                 LIMIT ?2
             )",
            params![generation, excess],
        )?;
        tx.commit()?;
        if evicted > 0 {
            tracing::debug!(generation, evicted, max_entries, "Cache trimmed");
        }
        Ok(evicted)
    }

    pub fn state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                "SELECT value FROM controller_state WHERE key = ?",
                [key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR REPLACE INTO controller_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Every generation with its entry count
    pub fn status(&self) -> Result<Vec<GenerationStatus>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT g.name, COUNT(e.seq) FROM generations g
             LEFT JOIN entries e ON e.generation = g.name
             GROUP BY g.id
             ORDER BY g.id ASC",
        )?;
        let status = stmt
            .query_map([], |row| {
                Ok(GenerationStatus {
                    name: row.get(0)?,
                    entries: row.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(status)
    }
}
