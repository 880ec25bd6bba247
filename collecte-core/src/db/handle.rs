//! Shared store handle
//!
//! [`StoreHandle`] is the one place that opens the application store. Every
//! component that needs the database asks the handle instead of opening its
//! own connection:
//!
//! - the first successful [`StoreHandle::open`] connects and runs migrations;
//! - later calls return the same `Arc<Database>` without touching the schema;
//! - a failed open caches nothing, so the next call retries;
//! - [`StoreHandle::close`] forgets the connection, and the next `open`
//!   reconnects (existing `Arc`s stay usable until dropped).

use super::Database;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Idempotent-open capability for the application store
pub struct StoreHandle {
    location: Location,
    busy_timeout: Duration,
    shared: Mutex<Option<Arc<Database>>>,
}

enum Location {
    File(PathBuf),
    Memory,
}

impl StoreHandle {
    /// Handle for the store at `path`
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            location: Location::File(path.into()),
            busy_timeout,
            shared: Mutex::new(None),
        }
    }

    /// Handle for a private in-memory store (for testing)
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            busy_timeout: Duration::ZERO,
            shared: Mutex::new(None),
        }
    }

    /// Open the store, or return the already open one
    pub fn open(&self) -> Result<Arc<Database>> {
        let mut shared = self
            .shared
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("store handle poisoned: {}", e)))?;

        if let Some(db) = shared.as_ref() {
            return Ok(Arc::clone(db));
        }

        let db = match &self.location {
            Location::File(path) => {
                tracing::info!(path = %path.display(), "Opening store");
                Database::open(path, self.busy_timeout)?
            }
            Location::Memory => Database::open_in_memory()?,
        };
        db.migrate()?;

        let db = Arc::new(db);
        *shared = Some(Arc::clone(&db));
        Ok(db)
    }

    /// Whether a connection is currently held
    pub fn is_open(&self) -> bool {
        self.shared.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Forget the shared connection
    pub fn close(&self) {
        if let Ok(mut shared) = self.shared.lock() {
            if shared.take().is_some() {
                tracing::info!("Store handle closed");
            }
        }
    }

    /// On-disk location, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }
}
