//! Outbox flush against the remote collector
//!
//! A flush walks the outbox oldest-first and stops at the first item that
//! cannot be confirmed, so nothing is ever delivered ahead of an item that is
//! still pending. Delivery is at-least-once: if a response is lost after the
//! collector applied a mutation, the next flush sends it again with the same
//! `Idempotency-Key`.
//!
//! Only one flush runs at a time. A flush requested while another is running
//! returns [`FlushOutcome::Coalesced`] immediately and makes the running
//! flush take one more pass once it has drained successfully.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Url};
use serde::Serialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::outbox::OutboxManager;
use crate::types::{Mapping, OutboxItem};

use super::transport::{SyncRequest, SyncResponse, Transport};

/// Header carrying the per-item idempotency key
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Request construction and retry settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Collector base URL; relative action urls resolve against it
    pub base_url: Url,
    /// Used when an action has no url
    pub default_path: String,
    /// Retries after the first attempt when no response is obtained
    pub max_retries: u32,
    /// The n-th retry waits `n * backoff`
    pub backoff: Duration,
    pub csrf_token: Option<String>,
    pub csrf_header: String,
}

impl SyncSettings {
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            base_url: config.collector_base()?,
            default_path: config.sync_path.clone(),
            max_retries: config.max_retries,
            backoff: config.backoff(),
            csrf_token: config.resolve_csrf_token(),
            csrf_header: config.csrf_header.clone(),
        })
    }
}

/// Why a flush stopped early
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushFailure {
    /// Retries exhausted without any response
    Network(String),
    /// The collector answered with a non-2xx status
    Rejected { status: u16 },
    /// The item cannot be turned into a request (e.g. an unparsable url)
    InvalidAction(String),
}

/// Result of one flush call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The outbox was drained
    Completed { delivered: usize },
    /// Stopped at `qid`; it and every later item remain queued
    Halted {
        delivered: usize,
        qid: i64,
        failure: FlushFailure,
    },
    /// Another flush was already running
    Coalesced,
}

impl FlushOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, FlushOutcome::Halted { .. })
    }

    /// HTTP status of a rejection
    pub fn status(&self) -> Option<u16> {
        match self {
            FlushOutcome::Halted {
                failure: FlushFailure::Rejected { status },
                ..
            } => Some(*status),
            _ => None,
        }
    }

    pub fn delivered(&self) -> usize {
        match self {
            FlushOutcome::Completed { delivered } | FlushOutcome::Halted { delivered, .. } => {
                *delivered
            }
            FlushOutcome::Coalesced => 0,
        }
    }

    /// Wire-style summary: `{success, delivered, status?, cause?, error?}`
    pub fn report(&self) -> FlushReport {
        let mut report = FlushReport {
            success: self.is_success(),
            delivered: self.delivered(),
            status: self.status(),
            cause: None,
            error: None,
            coalesced: matches!(self, FlushOutcome::Coalesced),
        };
        if let FlushOutcome::Halted { failure, .. } = self {
            match failure {
                FlushFailure::Network(message) => {
                    report.cause = Some("network");
                    report.error = Some(message.clone());
                }
                FlushFailure::Rejected { .. } => report.cause = Some("rejected"),
                FlushFailure::InvalidAction(message) => {
                    report.cause = Some("invalid_action");
                    report.error = Some(message.clone());
                }
            }
        }
        report
    }
}

/// Serializable flush summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub success: bool,
    pub delivered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub coalesced: bool,
}

/// Clears the in-flight flag when the flush ends, however it ends
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Bookkeeping shared by every pass of one flush call
#[derive(Default)]
struct FlushProgress {
    /// Items removed after a 2xx answer
    delivered: usize,
    /// Items that got an answer in this flush
    attempted: HashSet<i64>,
    /// Items removed by a mapping `client_qid`
    acknowledged: HashSet<i64>,
}

impl FlushProgress {
    fn is_settled(&self, qid: i64) -> bool {
        self.attempted.contains(&qid) || self.acknowledged.contains(&qid)
    }

    fn halt(&self, qid: i64, failure: FlushFailure) -> FlushOutcome {
        FlushOutcome::Halted {
            delivered: self.delivered,
            qid,
            failure,
        }
    }
}

/// Drains the outbox against the collector
pub struct SyncEngine<T: Transport> {
    db: Arc<Database>,
    outbox: OutboxManager,
    transport: T,
    settings: SyncSettings,
    device_id: String,
    in_flight: AtomicBool,
    rerun: AtomicBool,
}

impl<T: Transport> SyncEngine<T> {
    pub fn new(db: Arc<Database>, transport: T, settings: SyncSettings) -> Result<Self> {
        let device_id = db.device_id()?;
        Ok(Self {
            outbox: OutboxManager::new(Arc::clone(&db)),
            db,
            transport,
            settings,
            device_id,
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        })
    }

    pub fn outbox(&self) -> &OutboxManager {
        &self.outbox
    }

    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Attempt delivery of every queued item, oldest first.
    ///
    /// Store failures are returned as errors; delivery failures are reported
    /// through [`FlushOutcome::Halted`].
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            self.rerun.store(true, Ordering::Release);
            tracing::debug!("Flush already in flight, coalescing request");
            return Ok(FlushOutcome::Coalesced);
        };

        let mut progress = FlushProgress::default();
        loop {
            self.rerun.store(false, Ordering::Release);

            if let Some(halted) = self.drain(&mut progress).await? {
                return Ok(halted);
            }

            if !self.rerun.swap(false, Ordering::AcqRel) {
                break;
            }
            tracing::debug!("Flush requested during pass, draining again");
        }

        let delivered = progress.delivered;
        tracing::info!(delivered, "Outbox flush complete");
        Ok(FlushOutcome::Completed { delivered })
    }

    /// One pass over the current outbox contents.
    ///
    /// Items already sent or acknowledged earlier in the same flush are
    /// skipped, so a rerun only picks up items enqueued since.
    async fn drain(&self, progress: &mut FlushProgress) -> Result<Option<FlushOutcome>> {
        let items: Vec<OutboxItem> = self
            .outbox
            .list()?
            .into_iter()
            .filter(|item| !progress.is_settled(item.qid))
            .collect();
        if items.is_empty() {
            return Ok(None);
        }
        tracing::info!(pending = items.len(), "Flushing outbox");

        for item in items {
            // Acknowledged by a mapping earlier in this pass
            if progress.is_settled(item.qid) {
                continue;
            }

            let request = match self.build_request(&item) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(qid = item.qid, error = %e, "Outbox item is not deliverable");
                    return Ok(Some(progress.halt(
                        item.qid,
                        FlushFailure::InvalidAction(e.to_string()),
                    )));
                }
            };

            let response = match self.send_with_retry(&request).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(qid = item.qid, error = %e, "Flush stopped: no response");
                    return Ok(Some(
                        progress.halt(item.qid, FlushFailure::Network(e.to_string())),
                    ));
                }
            };
            progress.attempted.insert(item.qid);

            if !response.is_success() {
                tracing::warn!(
                    qid = item.qid,
                    status = response.status,
                    "Flush stopped: collector rejected item"
                );
                return Ok(Some(progress.halt(
                    item.qid,
                    FlushFailure::Rejected {
                        status: response.status,
                    },
                )));
            }

            let removed = match mapping_entries(&response) {
                Some(entries) => {
                    self.apply_mappings(item.qid, entries, &mut progress.acknowledged);
                    progress.acknowledged.contains(&item.qid)
                }
                None => {
                    self.outbox.remove(item.qid)?;
                    true
                }
            };

            if removed {
                progress.delivered += 1;
                tracing::debug!(qid = item.qid, status = response.status, "Item delivered");
            } else {
                tracing::info!(
                    qid = item.qid,
                    "Item accepted without acknowledgement, kept for the next flush"
                );
            }
        }

        Ok(None)
    }

    /// Build the request for an outbox item
    pub fn build_request(&self, item: &OutboxItem) -> Result<SyncRequest> {
        let action = &item.action;

        let method = Method::from_bytes(action.method().as_bytes())
            .map_err(|e| Error::Config(format!("invalid method in qid {}: {}", item.qid, e)))?;

        let target = action.url().unwrap_or(&self.settings.default_path);
        let url = self
            .settings
            .base_url
            .join(target)
            .map_err(|e| Error::Config(format!("invalid url '{}': {}", target, e)))?;

        let mut headers = vec![(
            IDEMPOTENCY_HEADER.to_string(),
            item.idempotency_key(&self.device_id),
        )];

        // The anti-forgery token never leaves the collector's origin
        if let Some(token) = &self.settings.csrf_token {
            if url.origin() == self.settings.base_url.origin() {
                headers.push((self.settings.csrf_header.clone(), token.clone()));
            }
        }

        let body = if method == Method::GET || method == Method::HEAD {
            None
        } else {
            Some(action.body().clone())
        };

        Ok(SyncRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Send with linear backoff; only missing responses are retried
    async fn send_with_retry(&self, request: &SyncRequest) -> Result<SyncResponse> {
        let mut last_error = None;

        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = self.settings.backoff * attempt;
                tracing::debug!(
                    "Retrying sync request (attempt {}/{}), waiting {:?}",
                    attempt + 1,
                    self.settings.max_retries + 1,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            match self.transport.send(request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transport() => {
                    tracing::warn!(url = %request.url, "Transient error sending item: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::TransportFailure("max retries exceeded".into())))
    }

    /// Apply a mapping payload. Entry failures are logged and skipped.
    fn apply_mappings(&self, qid: i64, entries: &[Value], acknowledged: &mut HashSet<i64>) {
        tracing::debug!(qid, entries = entries.len(), "Applying mappings");

        for (index, entry) in entries.iter().enumerate() {
            let mapping: Mapping = match serde_json::from_value(entry.clone()) {
                Ok(mapping) => mapping,
                Err(e) => {
                    let err = Error::MappingApplyFailure(format!("malformed entry: {}", e));
                    tracing::warn!(qid, index, error = %err, "Skipping mapping entry");
                    continue;
                }
            };

            if let Err(e) = self.apply_mapping(&mapping, acknowledged) {
                tracing::warn!(qid, index, error = %e, "Mapping entry not applied");
            }
        }
    }

    fn apply_mapping(&self, mapping: &Mapping, acknowledged: &mut HashSet<i64>) -> Result<()> {
        let mut failure = None;

        if let (Some(client_id), Some(server_id)) = (mapping.client_id, &mapping.server_id) {
            match self.db.merge_server_id(client_id, server_id) {
                Ok(true) => {
                    tracing::debug!(client_id, server_id = %server_id, "Server id merged")
                }
                Ok(false) => {
                    failure = Some(Error::MappingApplyFailure(format!(
                        "entity {} not found",
                        client_id
                    )))
                }
                Err(e) => failure = Some(Error::MappingApplyFailure(e.to_string())),
            }
        }

        if let Some(client_qid) = mapping.client_qid {
            match self.outbox.remove(client_qid) {
                Ok(()) => {
                    acknowledged.insert(client_qid);
                }
                Err(e) => failure = Some(Error::MappingApplyFailure(e.to_string())),
            }
        }

        failure.map_or(Ok(()), Err)
    }
}

/// Non-empty `mappings` array of a success payload
fn mapping_entries(response: &SyncResponse) -> Option<&[Value]> {
    response
        .body
        .as_ref()?
        .get("mappings")?
        .as_array()
        .filter(|entries| !entries.is_empty())
        .map(Vec::as_slice)
}
