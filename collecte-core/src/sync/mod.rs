//! Outbox synchronization against the remote collector
//!
//! - [`transport`]: the network seam and its reqwest implementation
//! - [`engine`]: single-flight, ordered flush with mapping reconciliation
//! - [`scheduler`]: connectivity, control-channel and periodic triggers

pub mod engine;
pub mod scheduler;
pub mod transport;

pub use engine::{FlushFailure, FlushOutcome, FlushReport, SyncEngine, SyncSettings};
pub use scheduler::{Connectivity, ConnectivityProbe, SyncScheduler, Trigger};
pub use transport::{HttpTransport, SyncRequest, SyncResponse, Transport};
