//! Request-intercepting cache controller
//!
//! The controller owns two cache generations: SHELL, filled once at install
//! time from the precache manifest, and RUNTIME, filled by successful fetches
//! and kept under a fixed entry bound. Every other generation is garbage on
//! activation.
//!
//! Cache failures never fail a request. A broken cache degrades to plain
//! network access; only pass-through requests surface network errors.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::Url;
use serde::Serialize;

use super::fetcher::Fetcher;
use super::request::{cache_key, classify, Destination, Request, RequestClass, Response};
use super::storage::{CacheStore, GenerationStatus};
use crate::config::Config;
use crate::control::{ClientHandle, ClientNotification, ControlChannel, ControlMessage};
use crate::error::{Error, Result};

const LIFECYCLE_KEY: &str = "lifecycle";

/// Navigation fallbacks tried before the offline page
const SHELL_ROOTS: &[&str] = &["/", "/index.html"];

/// Controller settings
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Origin that relative manifest entries resolve against
    pub origin: Url,
    pub shell_generation: String,
    pub runtime_generation: String,
    pub max_runtime_entries: usize,
    pub navigation_timeout: Duration,
    pub api_prefix: String,
    pub offline_page: String,
    pub precache: Vec<String>,
    /// Activate right after install instead of waiting for `SKIP_WAITING`
    pub skip_waiting: bool,
}

impl CacheSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = &config.cache;
        Ok(Self {
            origin: config.cache_origin()?,
            shell_generation: cache.shell_generation.clone(),
            runtime_generation: cache.runtime_generation.clone(),
            max_runtime_entries: cache.max_runtime_entries,
            navigation_timeout: cache.navigation_timeout(),
            api_prefix: cache.api_prefix.clone(),
            offline_page: cache.offline_page.clone(),
            precache: cache.precache.clone(),
            skip_waiting: cache.skip_waiting,
        })
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| Error::Config(format!("invalid cache url '{}': {}", path, e)))
    }
}

/// Install/activate state of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Nothing installed; requests go straight to the network
    Idle,
    /// Shell populated, waiting to take over
    Installed,
    /// Controlling requests
    Active,
}

impl Lifecycle {
    fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Installed => "installed",
            Lifecycle::Active => "active",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "installed" => Lifecycle::Installed,
            "active" => Lifecycle::Active,
            _ => Lifecycle::Idle,
        }
    }
}

/// Where a served response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Network,
    Cache,
    /// Generated offline response
    Synthetic,
}

/// A response together with its origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Served {
    pub response: Response,
    pub source: ResponseSource,
}

impl Served {
    fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    fn cache(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Cache,
        }
    }

    fn synthetic(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Synthetic,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub cached: Vec<String>,
    pub skipped: Vec<String>,
    pub activated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
    /// Superseded generations that were deleted
    pub deleted: Vec<String>,
    /// Clients notified of the takeover
    pub claimed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub lifecycle: Lifecycle,
    pub generations: Vec<GenerationStatus>,
}

/// Cache controller over a [`CacheStore`] and a [`Fetcher`]
pub struct CacheController<F: Fetcher> {
    store: CacheStore,
    fetcher: F,
    settings: CacheSettings,
    control: ControlChannel,
    lifecycle: Mutex<Lifecycle>,
}

impl<F: Fetcher> CacheController<F> {
    /// Create a controller, resuming the lifecycle persisted in `store`
    pub fn new(store: CacheStore, fetcher: F, settings: CacheSettings) -> Result<Self> {
        let lifecycle = store
            .state(LIFECYCLE_KEY)?
            .map(|s| Lifecycle::parse(&s))
            .unwrap_or(Lifecycle::Idle);

        Ok(Self {
            store,
            fetcher,
            settings,
            control: ControlChannel::new(),
            lifecycle: Mutex::new(lifecycle),
        })
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Register an application instance on the control channel
    pub fn subscribe(&self) -> ClientHandle {
        self.control.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
            .lock()
            .map(|l| *l)
            .unwrap_or(Lifecycle::Idle)
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) -> Result<()> {
        self.store.set_state(LIFECYCLE_KEY, lifecycle.as_str())?;
        let mut current = self
            .lifecycle
            .lock()
            .map_err(|e| Error::StoreUnavailable(format!("lifecycle lock poisoned: {}", e)))?;
        *current = lifecycle;
        Ok(())
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Populate SHELL from the precache manifest.
    ///
    /// Individual fetch or write failures are logged and skipped.
    pub async fn install(&self) -> Result<InstallReport> {
        tracing::info!(
            generation = %self.settings.shell_generation,
            entries = self.settings.precache.len(),
            "Installing cache controller"
        );
        self.store.open_generation(&self.settings.shell_generation)?;

        let mut report = InstallReport::default();
        for path in &self.settings.precache {
            if self.precache_one(path).await {
                report.cached.push(path.clone());
            } else {
                report.skipped.push(path.clone());
            }
        }

        self.set_lifecycle(Lifecycle::Installed)?;
        tracing::info!(
            cached = report.cached.len(),
            skipped = report.skipped.len(),
            "Precache complete"
        );

        if self.settings.skip_waiting {
            self.activate().await?;
            report.activated = true;
        }
        Ok(report)
    }

    async fn precache_one(&self, path: &str) -> bool {
        let url = match self.settings.resolve(path) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(path, error = %e, "Precache entry skipped");
                return false;
            }
        };

        let response = match self.fetcher.fetch(&Request::get(url.clone())).await {
            Ok(response) if response.is_success() => response,
            Ok(response) => {
                tracing::warn!(path, status = response.status, "Precache skipped (not ok)");
                return false;
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "Precache fetch failed");
                return false;
            }
        };

        match self
            .store
            .put(&self.settings.shell_generation, &cache_key(&url), &response)
        {
            Ok(()) => {
                tracing::debug!(path, "Precached");
                true
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "Precache write failed");
                false
            }
        }
    }

    /// Delete unrecognized generations and take control of clients
    pub async fn activate(&self) -> Result<ActivateReport> {
        let recognized = [
            self.settings.shell_generation.as_str(),
            self.settings.runtime_generation.as_str(),
        ];

        let mut report = ActivateReport::default();
        for generation in self.store.generations()? {
            if recognized.contains(&generation.as_str()) {
                continue;
            }
            match self.store.delete_generation(&generation) {
                Ok(_) => {
                    tracing::info!(generation = %generation, "Superseded cache deleted");
                    report.deleted.push(generation);
                }
                Err(e) => {
                    tracing::warn!(generation = %generation, error = %e, "Cache delete failed")
                }
            }
        }

        self.set_lifecycle(Lifecycle::Active)?;
        report.claimed = self.control.broadcast(ClientNotification::ControllerChanged);
        tracing::info!(
            deleted = report.deleted.len(),
            claimed = report.claimed,
            "Cache controller active"
        );
        Ok(report)
    }

    /// Activate an installed-but-waiting controller; otherwise a no-op
    pub async fn skip_waiting(&self) -> Result<Option<ActivateReport>> {
        if self.lifecycle() != Lifecycle::Installed {
            tracing::debug!(lifecycle = ?self.lifecycle(), "Nothing waiting to activate");
            return Ok(None);
        }
        self.activate().await.map(Some)
    }

    /// React to a control message from an application instance.
    ///
    /// The controller never flushes the outbox itself: a sync request is only
    /// rebroadcast to the clients.
    pub async fn handle_message(&self, message: ControlMessage) -> Result<()> {
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting().await?;
            }
            ControlMessage::SyncOutbox => {
                self.control.broadcast(ClientNotification::SyncOutboxRequest);
            }
        }
        Ok(())
    }

    /// Parse and handle a raw JSON control message; unknown types are ignored
    pub async fn handle_raw_message(&self, raw: &str) -> Result<()> {
        match ControlMessage::parse(raw) {
            Some(message) => self.handle_message(message).await,
            None => Ok(()),
        }
    }

    pub fn status(&self) -> Result<ControllerStatus> {
        Ok(ControllerStatus {
            lifecycle: self.lifecycle(),
            generations: self.store.status()?,
        })
    }

    // ============================================
    // Fetch handling
    // ============================================

    /// Answer an intercepted request.
    ///
    /// Errors only for pass-through traffic (or any traffic before
    /// activation) when the network gives no response.
    pub async fn handle(&self, request: &Request) -> Result<Served> {
        if self.lifecycle() != Lifecycle::Active {
            return self.fetcher.fetch(request).await.map(Served::network);
        }

        let class = classify(request, &self.settings.api_prefix);
        tracing::debug!(url = %request.url, ?class, "Handling request");

        match class {
            RequestClass::PassThrough => self.fetcher.fetch(request).await.map(Served::network),
            RequestClass::Api => Ok(self.network_first_api(request).await),
            RequestClass::Navigation => Ok(self.navigate(request).await),
            RequestClass::StaticAsset => Ok(self.cache_first_asset(request).await),
            RequestClass::Other => Ok(self.network_with_fallback(request).await),
        }
    }

    async fn network_first_api(&self, request: &Request) -> Served {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.cache_runtime(request, &response);
                }
                Served::network(response)
            }
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "API fetch failed");
                match self.lookup(&request.cache_key()) {
                    Some(cached) => Served::cache(cached),
                    None => Served::synthetic(Response::offline_api()),
                }
            }
        }
    }

    async fn navigate(&self, request: &Request) -> Served {
        let fetch = self.fetcher.fetch(request);
        match tokio::time::timeout(self.settings.navigation_timeout, fetch).await {
            Ok(Ok(response)) => return Served::network(response),
            Ok(Err(e)) => tracing::debug!(url = %request.url, error = %e, "Navigation failed"),
            Err(_) => tracing::debug!(
                url = %request.url,
                timeout = ?self.settings.navigation_timeout,
                "Navigation timed out"
            ),
        }

        let fallbacks = SHELL_ROOTS
            .iter()
            .copied()
            .chain(std::iter::once(self.settings.offline_page.as_str()));
        for path in fallbacks {
            if let Some(cached) = self.lookup_path(path) {
                tracing::debug!(path, "Serving navigation fallback");
                return Served::cache(cached);
            }
        }
        Served::synthetic(Response::offline_navigation())
    }

    async fn cache_first_asset(&self, request: &Request) -> Served {
        if let Some(cached) = self.lookup(&request.cache_key()) {
            return Served::cache(cached);
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.cache_runtime(request, &response);
                }
                Served::network(response)
            }
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Asset fetch failed");
                if request.destination == Destination::Image {
                    return Served::synthetic(Response::image_placeholder());
                }
                match self.lookup_path(&self.settings.offline_page) {
                    Some(offline) => Served::cache(offline),
                    None => Served::synthetic(Response::offline_empty()),
                }
            }
        }
    }

    async fn network_with_fallback(&self, request: &Request) -> Served {
        match self.fetcher.fetch(request).await {
            Ok(response) => Served::network(response),
            Err(e) => {
                tracing::debug!(url = %request.url, error = %e, "Fetch failed");
                match self.lookup(&request.cache_key()) {
                    Some(cached) => Served::cache(cached),
                    None => Served::synthetic(Response::offline_empty()),
                }
            }
        }
    }

    /// Lookup across generations; a failing store reads as a miss
    fn lookup(&self, key: &str) -> Option<Response> {
        match self.store.match_any(key) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    fn lookup_path(&self, path: &str) -> Option<Response> {
        let url = self.settings.resolve(path).ok()?;
        self.lookup(&cache_key(&url))
    }

    /// Write into RUNTIME and enforce its bound
    fn cache_runtime(&self, request: &Request, response: &Response) {
        let generation = &self.settings.runtime_generation;
        if let Err(e) = self.store.put(generation, &request.cache_key(), response) {
            tracing::warn!(url = %request.url, error = %e, "Runtime cache write failed");
            return;
        }
        if let Err(e) = self.store.trim(generation, self.settings.max_runtime_entries) {
            tracing::warn!(error = %e, "Runtime cache trim failed");
        }
    }
}
