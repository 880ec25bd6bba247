//! Database repository layer
//!
//! Provides query and insert operations for the entity table and device
//! metadata. Outbox access lives in [`crate::outbox`].

use crate::error::{Error, Result};
use crate::types::{Entity, NewEntity};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Rows fetched per round-trip by [`EntityCursor`]
const CURSOR_PAGE_SIZE: usize = 64;

const DEVICE_ID_KEY: &str = "device_id";

/// Database handle with a single serialized connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    ///
    /// Fails with [`Error::StoreUnavailable`] when another connection keeps the
    /// file locked for longer than `busy_timeout`.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // WAL lets readers proceed while the single writer commits
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )
        .map_err(|e| match Error::from(e) {
            Error::Database(e) => Error::StoreUnavailable(e.to_string()),
            other => other,
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.connection()?;
        super::schema::run_migrations(&conn)
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("connection lock poisoned: {}", e)))
    }

    // ============================================
    // Entity operations
    // ============================================

    /// Create an entity; fails with [`Error::ConstraintViolation`] if the id exists
    pub fn add_entity(&self, entity: &NewEntity) -> Result<i64> {
        let conn = self.connection()?;
        let id = Self::insert_entity(&conn, entity)?;
        tracing::debug!(id, "Entity added");
        Ok(id)
    }

    /// Insert or fully replace an entity
    pub fn put_entity(&self, entity: &Entity) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            r#"
            INSERT INTO entities (id, fields, created_at, server_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                fields = excluded.fields,
                created_at = excluded.created_at,
                server_id = excluded.server_id
            "#,
            params![
                entity.id,
                Value::Object(entity.fields.clone()).to_string(),
                entity.created_at.to_rfc3339(),
                entity.server_id,
            ],
        )?;
        tracing::debug!(id = entity.id, "Entity upserted");
        Ok(())
    }

    /// Get an entity by id
    pub fn get_entity(&self, id: i64) -> Result<Option<Entity>> {
        let conn = self.connection()?;
        Ok(conn
            .query_row(
                "SELECT id, fields, created_at, server_id FROM entities WHERE id = ?",
                [id],
                Self::row_to_entity,
            )
            .optional()?)
    }

    /// All entities in store order (ascending id)
    pub fn get_all_entities(&self) -> Result<Vec<Entity>> {
        let conn = self.connection()?;
        let mut stmt =
            conn.prepare("SELECT id, fields, created_at, server_id FROM entities ORDER BY id ASC")?;

        let entities = stmt
            .query_map([], Self::row_to_entity)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entities)
    }

    /// Count entities
    pub fn count_entities(&self) -> Result<i64> {
        let conn = self.connection()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM entities", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Remove every entity
    pub fn clear_entities(&self) -> Result<()> {
        let conn = self.connection()?;
        let removed = conn.execute("DELETE FROM entities", [])?;
        tracing::info!(removed, "Entities cleared");
        Ok(())
    }

    /// Delete one entity (explicit user action)
    pub fn delete_entity(&self, id: i64) -> Result<bool> {
        let conn = self.connection()?;
        let removed = conn.execute("DELETE FROM entities WHERE id = ?", [id])?;
        Ok(removed > 0)
    }

    /// Insert many entities in one transaction.
    ///
    /// All-or-nothing: if any item fails the whole batch is rolled back and
    /// the error of the failing item is returned.
    pub fn bulk_add_entities(&self, entities: &[NewEntity]) -> Result<Vec<i64>> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;

        let mut ids = Vec::with_capacity(entities.len());
        for (index, entity) in entities.iter().enumerate() {
            match Self::insert_entity(&tx, entity) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    tracing::warn!(index, error = %e, "Bulk insert failed, rolling back batch");
                    return Err(e);
                }
            }
        }

        tx.commit()?;
        tracing::info!(count = ids.len(), "Bulk insert committed");
        Ok(ids)
    }

    /// Set the server id of an entity, leaving every other field untouched.
    ///
    /// Returns false when the entity does not exist.
    pub fn merge_server_id(&self, id: i64, server_id: &str) -> Result<bool> {
        let conn = self.connection()?;
        let updated = conn.execute(
            "UPDATE entities SET server_id = ?1 WHERE id = ?2",
            params![server_id, id],
        )?;
        Ok(updated > 0)
    }

    /// Lazily iterate entities in store order.
    pub fn iter_entities(&self) -> EntityCursor<'_> {
        EntityCursor {
            db: self,
            after: None,
            page: VecDeque::new(),
            exhausted: false,
        }
    }

    fn insert_entity(conn: &Connection, entity: &NewEntity) -> Result<i64> {
        conn.execute(
            "INSERT INTO entities (id, fields, created_at, server_id) VALUES (?1, ?2, ?3, NULL)",
            params![
                entity.id,
                Value::Object(entity.fields.clone()).to_string(),
                entity.created_at.to_rfc3339(),
            ],
        )?;
        Ok(entity.id.unwrap_or_else(|| conn.last_insert_rowid()))
    }

    /// Next page after `after`, with the count and last id of the rows
    /// scanned (readable or not)
    fn fetch_page(&self, after: Option<i64>) -> Result<EntityPage> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, fields, created_at, server_id FROM entities
             WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )?;

        let mut rows = stmt.query(params![after.unwrap_or(i64::MIN), CURSOR_PAGE_SIZE as i64])?;

        let mut page = EntityPage::default();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            page.scanned += 1;
            page.last_id = Some(id);
            match Self::row_to_entity(row) {
                Ok(entity) => page.entities.push(entity),
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable entity row"),
            }
        }
        Ok(page)
    }

    fn row_to_entity(row: &Row) -> rusqlite::Result<Entity> {
        let fields_str: String = row.get(1)?;
        let created_at_str: String = row.get(2)?;

        let fields = match serde_json::from_str::<Value>(&fields_str) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        Ok(Entity {
            id: row.get(0)?,
            fields,
            created_at: parse_datetime(&created_at_str),
            server_id: row.get(3)?,
        })
    }

    // ============================================
    // Device metadata
    // ============================================

    /// Stable identifier of this device, created on first use
    pub fn device_id(&self) -> Result<String> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
            params![DEVICE_ID_KEY, uuid::Uuid::new_v4().to_string()],
        )?;
        let id: String = conn.query_row(
            "SELECT value FROM meta WHERE key = ?",
            [DEVICE_ID_KEY],
            |r| r.get(0),
        )?;
        Ok(id)
    }
}

/// Lazy, finite, non-restartable sequence over entities in id order.
///
/// Rows are pulled in pages, so entities added behind the cursor are not
/// seen and entities added ahead of it are. Unreadable rows are logged and
/// skipped; a store failure is yielded once and ends the sequence.
pub struct EntityCursor<'a> {
    db: &'a Database,
    after: Option<i64>,
    page: VecDeque<Entity>,
    exhausted: bool,
}

#[derive(Default)]
struct EntityPage {
    entities: Vec<Entity>,
    scanned: usize,
    last_id: Option<i64>,
}

impl Iterator for EntityCursor<'_> {
    type Item = Result<Entity>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.page.is_empty() && !self.exhausted {
            match self.db.fetch_page(self.after) {
                Ok(page) => {
                    if page.scanned < CURSOR_PAGE_SIZE {
                        self.exhausted = true;
                    }
                    if page.last_id.is_some() {
                        self.after = page.last_id;
                    }
                    self.page.extend(page.entities);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        self.page.pop_front().map(Ok)
    }
}

/// Parse a stored RFC 3339 timestamp, falling back to now for legacy rows
pub(crate) fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_entity_crud() {
        let db = test_db();

        let id = db
            .add_entity(&NewEntity::new(fields(json!({"nom": "Rakoto", "prenom": "Jean"}))))
            .unwrap();

        let entity = db.get_entity(id).unwrap().unwrap();
        assert_eq!(entity.fields["nom"], "Rakoto");
        assert!(entity.server_id.is_none());

        let mut updated = entity.clone();
        updated.fields.insert("village".to_string(), json!("Ambositra"));
        db.put_entity(&updated).unwrap();

        assert_eq!(db.get_entity(id).unwrap().unwrap(), updated);
        assert_eq!(db.count_entities().unwrap(), 1);

        assert!(db.delete_entity(id).unwrap());
        assert!(!db.delete_entity(id).unwrap());
        assert!(db.get_entity(id).unwrap().is_none());
    }

    #[test]
    fn test_add_duplicate_is_constraint_violation() {
        let db = test_db();
        db.add_entity(&NewEntity::with_id(7, Map::new())).unwrap();

        let err = db.add_entity(&NewEntity::with_id(7, Map::new())).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));

        // put on the same id is an upsert
        let entity = db.get_entity(7).unwrap().unwrap();
        db.put_entity(&entity).unwrap();
        assert_eq!(db.count_entities().unwrap(), 1);
    }

    #[test]
    fn test_bulk_add_is_all_or_nothing() {
        let db = test_db();
        db.add_entity(&NewEntity::with_id(3, Map::new())).unwrap();

        let batch = vec![
            NewEntity::with_id(1, Map::new()),
            NewEntity::with_id(2, Map::new()),
            NewEntity::with_id(3, Map::new()),
            NewEntity::with_id(4, Map::new()),
        ];
        let err = db.bulk_add_entities(&batch).unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(_)));
        assert_eq!(db.count_entities().unwrap(), 1);

        let ids = db.bulk_add_entities(&batch[..2]).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(db.count_entities().unwrap(), 3);
    }

    #[test]
    fn test_merge_server_id_touches_only_that_field() {
        let db = test_db();
        let id = db
            .add_entity(&NewEntity::new(fields(json!({"nom": "Rabe"}))))
            .unwrap();

        assert!(db.merge_server_id(id, "123").unwrap());
        let entity = db.get_entity(id).unwrap().unwrap();
        assert_eq!(entity.server_id.as_deref(), Some("123"));
        assert_eq!(entity.fields["nom"], "Rabe");

        assert!(!db.merge_server_id(999, "1").unwrap());
    }

    #[test]
    fn test_cursor_walks_all_pages_in_order() {
        let db = test_db();
        let batch: Vec<NewEntity> = (0..150)
            .map(|i| NewEntity::new(fields(json!({ "n": i }))))
            .collect();
        db.bulk_add_entities(&batch).unwrap();

        let mut cursor = db.iter_entities();
        let first = cursor.next().unwrap().unwrap();
        assert_eq!(first.fields["n"], 0);

        let rest: Vec<Entity> = cursor.by_ref().map(|r| r.unwrap()).collect();
        assert_eq!(rest.len(), 149);
        assert!(rest.windows(2).all(|w| w[0].id < w[1].id));

        // finite and not restartable
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_cursor_skips_unreadable_row_and_keeps_going() {
        let db = test_db();
        let batch: Vec<NewEntity> = (0..100)
            .map(|i| NewEntity::new(fields(json!({ "n": i }))))
            .collect();
        let ids = db.bulk_add_entities(&batch).unwrap();

        db.connection()
            .unwrap()
            .execute(
                "UPDATE entities SET fields = x'00ff' WHERE id = ?",
                [ids[9]],
            )
            .unwrap();

        let seen: Vec<i64> = db.iter_entities().map(|r| r.unwrap().id).collect();
        assert_eq!(seen.len(), 99);
        assert!(!seen.contains(&ids[9]));
        assert_eq!(seen.last(), ids.last());
    }

    #[test]
    fn test_clear_and_get_all() {
        let db = test_db();
        db.add_entity(&NewEntity::with_id(2, Map::new())).unwrap();
        db.add_entity(&NewEntity::with_id(1, Map::new())).unwrap();

        let all = db.get_all_entities().unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);

        db.clear_entities().unwrap();
        assert_eq!(db.count_entities().unwrap(), 0);
        assert!(db.iter_entities().next().is_none());
    }

    #[test]
    fn test_device_id_is_stable() {
        let db = test_db();
        let first = db.device_id().unwrap();
        assert_eq!(first, db.device_id().unwrap());
        assert_eq!(first.len(), 36);
    }
}
