//! Message bridge between the cache controller and application instances
//!
//! Messages are JSON objects tagged by `type`. Applications send
//! [`ControlMessage`]s to the controller; the controller fans
//! [`ClientNotification`]s out to every subscribed [`ClientHandle`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the notification ring; slow clients skip what they missed
const CHANNEL_CAPACITY: usize = 32;

/// Application → controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Activate an installed-but-waiting controller now
    SkipWaiting,
    /// Ask every application instance to flush its outbox
    SyncOutbox,
}

impl ControlMessage {
    /// Parse a raw message. Unknown or untyped messages yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match serde_json::from_str(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring control message");
                None
            }
        }
    }
}

/// Controller → application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientNotification {
    /// Rebroadcast of [`ControlMessage::SyncOutbox`]
    SyncOutboxRequest,
    /// A new controller took control of this client
    ControllerChanged,
}

/// Broadcast side held by the controller
#[derive(Clone)]
pub struct ControlChannel {
    sender: broadcast::Sender<ClientNotification>,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Register an application instance
    pub fn subscribe(&self) -> ClientHandle {
        ClientHandle {
            receiver: self.sender.subscribe(),
        }
    }

    /// Deliver to every subscribed client; returns how many received it
    pub fn broadcast(&self, notification: ClientNotification) -> usize {
        match self.sender.send(notification) {
            Ok(count) => {
                tracing::debug!(?notification, clients = count, "Notification broadcast");
                count
            }
            Err(_) => {
                tracing::debug!(?notification, "No clients to notify");
                0
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving side held by one application instance
pub struct ClientHandle {
    receiver: broadcast::Receiver<ClientNotification>,
}

impl ClientHandle {
    /// Next notification, or `None` once the channel is gone
    pub async fn recv(&mut self) -> Option<ClientNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Client lagged behind control channel");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`ClientHandle::recv`]
    pub fn try_recv(&mut self) -> Option<ClientNotification> {
        loop {
            match self.receiver.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#),
            Some(ControlMessage::SkipWaiting)
        );
        assert_eq!(
            ControlMessage::parse(r#"{"type":"SYNC_OUTBOX","extra":1}"#),
            Some(ControlMessage::SyncOutbox)
        );
        assert_eq!(
            serde_json::to_string(&ClientNotification::SyncOutboxRequest).unwrap(),
            r#"{"type":"SYNC_OUTBOX_REQUEST"}"#
        );
    }

    #[test]
    fn test_unknown_messages_are_ignored() {
        assert!(ControlMessage::parse(r#"{"type":"RELOAD"}"#).is_none());
        assert!(ControlMessage::parse(r#"{"action":"SKIP_WAITING"}"#).is_none());
        assert!(ControlMessage::parse("not json").is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let channel = ControlChannel::new();
        let mut first = channel.subscribe();
        let mut second = channel.subscribe();

        assert_eq!(channel.broadcast(ClientNotification::SyncOutboxRequest), 2);
        assert_eq!(first.recv().await, Some(ClientNotification::SyncOutboxRequest));
        assert_eq!(second.recv().await, Some(ClientNotification::SyncOutboxRequest));
    }

    #[test]
    fn test_broadcast_without_clients() {
        let channel = ControlChannel::new();
        assert_eq!(channel.broadcast(ClientNotification::ControllerChanged), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_when_channel_dropped() {
        let channel = ControlChannel::new();
        let mut client = channel.subscribe();
        drop(channel);
        assert_eq!(client.recv().await, None);
    }
}
