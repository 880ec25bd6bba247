//! Durable outbox of pending remote mutations
//!
//! Items are totally ordered by `qid`, which the store assigns from a
//! strictly increasing sequence (gaps are possible, reuse is not). Consumers
//! must process [`OutboxManager::list`] in the returned order: later items may
//! depend on earlier ones having been applied remotely first.

use crate::db::repo::parse_datetime;
use crate::db::Database;
use crate::error::Result;
use crate::types::{Action, OutboxItem};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;

/// Enqueue, list and remove over the outbox table
#[derive(Clone)]
pub struct OutboxManager {
    db: Arc<Database>,
}

impl OutboxManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Persist an action and return its queue id.
    ///
    /// The action is committed before this returns.
    pub fn enqueue(&self, action: &Action) -> Result<i64> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO outbox (action, enqueued_at) VALUES (?1, ?2)",
            params![action.as_value().to_string(), Utc::now().to_rfc3339()],
        )?;
        let qid = conn.last_insert_rowid();
        tracing::info!(qid, method = %action.method(), "Action enqueued");
        Ok(qid)
    }

    /// Remove an item; a missing qid is a no-op
    pub fn remove(&self, qid: i64) -> Result<()> {
        let conn = self.db.connection()?;
        let removed = conn.execute("DELETE FROM outbox WHERE qid = ?", [qid])?;
        if removed > 0 {
            tracing::debug!(qid, "Outbox item removed");
        }
        Ok(())
    }

    /// All pending items, oldest first
    pub fn list(&self) -> Result<Vec<OutboxItem>> {
        let conn = self.db.connection()?;
        let mut stmt =
            conn.prepare("SELECT qid, action, enqueued_at FROM outbox ORDER BY qid ASC")?;

        let items = stmt
            .query_map([], Self::row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(items)
    }

    /// Get a single item
    pub fn get(&self, qid: i64) -> Result<Option<OutboxItem>> {
        let conn = self.db.connection()?;
        Ok(conn
            .query_row(
                "SELECT qid, action, enqueued_at FROM outbox WHERE qid = ?",
                [qid],
                Self::row_to_item,
            )
            .optional()?)
    }

    /// Number of pending items
    pub fn count(&self) -> Result<i64> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM outbox", [], |r| r.get(0))?;
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    fn row_to_item(row: &Row) -> rusqlite::Result<OutboxItem> {
        let action_str: String = row.get(1)?;
        let enqueued_at_str: String = row.get(2)?;

        let action = serde_json::from_str(&action_str).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;

        Ok(OutboxItem {
            qid: row.get(0)?,
            action: Action::from_value(action),
            enqueued_at: parse_datetime(&enqueued_at_str),
        })
    }
}
