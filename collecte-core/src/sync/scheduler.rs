//! Flush triggers
//!
//! [`SyncScheduler`] runs flushes when connectivity comes back, when a
//! client receives a sync request over the control channel, and on an
//! optional periodic timer. [`ConnectivityProbe`] feeds the connectivity
//! signal by polling the collector.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::control::{ClientHandle, ClientNotification};
use crate::error::{Error, Result};

use super::engine::SyncEngine;
use super::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Reconnected,
    Requested,
    Periodic,
}

/// Background flush driver
pub struct SyncScheduler<T: Transport> {
    engine: Arc<SyncEngine<T>>,
    connectivity: watch::Receiver<Connectivity>,
    client: Option<ClientHandle>,
    periodic: Option<Duration>,
}

impl<T: Transport> SyncScheduler<T> {
    pub fn new(engine: Arc<SyncEngine<T>>, connectivity: watch::Receiver<Connectivity>) -> Self {
        Self {
            engine,
            connectivity,
            client: None,
            periodic: None,
        }
    }

    /// Flush on `SYNC_OUTBOX_REQUEST` notifications
    pub fn with_client(mut self, client: ClientHandle) -> Self {
        self.client = Some(client);
        self
    }

    /// Flush every `period` while online
    pub fn with_periodic(mut self, period: Option<Duration>) -> Self {
        self.periodic = period;
        self
    }

    /// Run until every trigger source is closed
    pub async fn run(mut self) {
        let mut timer = self.periodic.map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            timer
        });
        let mut state = *self.connectivity.borrow_and_update();
        let mut connectivity_open = true;
        let mut client_open = self.client.is_some();

        tracing::info!(?state, periodic = ?self.periodic, "Sync scheduler started");

        loop {
            let trigger = tokio::select! {
                changed = self.connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        connectivity_open = false;
                        continue;
                    }
                    let previous = state;
                    state = *self.connectivity.borrow_and_update();
                    if previous == Connectivity::Offline && state == Connectivity::Online {
                        Trigger::Reconnected
                    } else {
                        tracing::debug!(?state, "Connectivity changed");
                        continue;
                    }
                }
                notification = next_notification(&mut self.client), if client_open => {
                    match notification {
                        Some(ClientNotification::SyncOutboxRequest) => Trigger::Requested,
                        Some(_) => continue,
                        None => {
                            client_open = false;
                            continue;
                        }
                    }
                }
                _ = next_tick(&mut timer), if timer.is_some() => {
                    if state == Connectivity::Offline {
                        tracing::debug!("Skipping periodic flush while offline");
                        continue;
                    }
                    Trigger::Periodic
                }
                else => break,
            };

            self.flush(trigger).await;
        }

        tracing::info!("Sync scheduler stopped");
    }

    async fn flush(&self, trigger: Trigger) {
        tracing::info!(?trigger, "Triggered flush");
        match self.engine.flush().await {
            Ok(outcome) => {
                let report = outcome.report();
                tracing::info!(
                    ?trigger,
                    success = report.success,
                    delivered = report.delivered,
                    "Triggered flush finished"
                );
            }
            Err(e) => tracing::error!(?trigger, error = %e, "Triggered flush failed"),
        }
    }
}

async fn next_notification(client: &mut Option<ClientHandle>) -> Option<ClientNotification> {
    match client {
        Some(client) => client.recv().await,
        None => pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

/// Polls the collector and publishes connectivity transitions
pub struct ConnectivityProbe {
    http_client: reqwest::Client,
    url: Url,
    interval: Duration,
    sender: watch::Sender<Connectivity>,
}

impl ConnectivityProbe {
    /// Probe `url` every `interval`. The initial state is offline, so the
    /// first successful probe counts as a reconnection.
    pub fn new(url: Url, interval: Duration, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;
        let (sender, _) = watch::channel(Connectivity::Offline);

        Ok(Self {
            http_client,
            url,
            interval,
            sender,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.sender.subscribe()
    }

    /// Any HTTP response means the collector is reachable
    pub async fn check(&self) -> Connectivity {
        match self.http_client.get(self.url.clone()).send().await {
            Ok(response) => {
                tracing::trace!(status = response.status().as_u16(), "Probe answered");
                Connectivity::Online
            }
            Err(e) => {
                tracing::trace!(error = %e, "Probe failed");
                Connectivity::Offline
            }
        }
    }

    /// Publish a state; returns true when it differs from the previous one
    pub fn publish(&self, state: Connectivity) -> bool {
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::info!(?state, url = %self.url, "Connectivity changed");
        }
        changed
    }

    /// Probe until every subscriber is gone
    pub async fn run(self) {
        while !self.sender.is_closed() {
            let state = self.check().await;
            self.publish(state);
            tokio::time::sleep(self.interval).await;
        }
    }
}
