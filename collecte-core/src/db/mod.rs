//! Database layer for collecte
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - Repository pattern for entity queries
//! - A shared, idempotently opened store handle

pub mod handle;
pub mod repo;
pub mod schema;

pub use handle::StoreHandle;
pub use repo::{Database, EntityCursor};
