//! # collecte-core
//!
//! Offline resilience for a field data-collection client.
//!
//! This library provides:
//! - A durable local store of collected entities ([`db`])
//! - An ordered outbox of pending remote mutations ([`outbox`])
//! - A single-flight sync engine that drains the outbox against the remote
//!   collector and reconciles server-assigned ids ([`sync`])
//! - A request-intercepting cache with a precached shell and a bounded
//!   runtime cache ([`cache`])
//! - The message bridge between the cache controller and application
//!   instances ([`control`])
//!
//! ## Example
//!
//! ```rust,no_run
//! use collecte_core::{Action, Config, OutboxManager, StoreHandle};
//!
//! let config = Config::load().expect("failed to load config");
//! let store = StoreHandle::new(Config::database_path(), config.store.busy_timeout());
//! let db = store.open().expect("failed to open store");
//!
//! let outbox = OutboxManager::new(db);
//! let qid = outbox
//!     .enqueue(&Action::new("POST", Some("/api/personnes/"), serde_json::json!({"nom": "Rabe"})))
//!     .expect("failed to enqueue");
//! println!("queued as {}", qid);
//! ```

// Re-export commonly used items at the crate root
pub use cache::{CacheController, CacheSettings, CacheStore, HttpFetcher};
pub use config::Config;
pub use control::{ClientHandle, ClientNotification, ControlChannel, ControlMessage};
pub use db::{Database, StoreHandle};
pub use error::{Error, Result};
pub use outbox::OutboxManager;
pub use sync::{FlushOutcome, HttpTransport, SyncEngine, SyncScheduler, SyncSettings};
pub use types::*;

// Public modules
pub mod cache;
pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod logging;
pub mod outbox;
pub mod sync;
pub mod types;
