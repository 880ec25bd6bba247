//! Offline request cache
//!
//! - [`request`]: requests, response snapshots and classification
//! - [`storage`]: SQLite-backed cache generations
//! - [`fetcher`]: the network seam and its reqwest implementation
//! - [`controller`]: install/activate lifecycle and per-class fetch policy

pub mod controller;
pub mod fetcher;
pub mod request;
pub mod storage;

pub use controller::{
    ActivateReport, CacheController, CacheSettings, ControllerStatus, InstallReport, Lifecycle,
    ResponseSource, Served,
};
pub use fetcher::{Fetcher, HttpFetcher};
pub use request::{classify, Destination, Mode, Request, RequestClass, Response};
pub use storage::{CacheStore, GenerationStatus};
