//! Core domain types for collecte
//!
//! - [`Entity`]: a collected record held in the local store
//! - [`OutboxItem`]: a queued remote mutation awaiting delivery
//! - [`Action`]: the immutable request description carried by an outbox item
//! - [`Mapping`]: a server-provided correspondence between local and server identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

// ============================================
// Entities
// ============================================

/// A collected record.
///
/// `id` is assigned by the caller or by the store. `server_id` is only ever
/// written by mapping reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    /// Field values captured on the device
    pub fields: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    /// Authoritative identifier assigned by the collector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

/// An entity that has not been written yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntity {
    /// Client-assigned id; `None` lets the store assign one
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NewEntity {
    /// Entity with store-assigned id created now
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            id: None,
            fields,
            created_at: Utc::now(),
        }
    }

    /// Entity with a client-assigned id created now
    pub fn with_id(id: i64, fields: Map<String, Value>) -> Self {
        Self {
            id: Some(id),
            fields,
            created_at: Utc::now(),
        }
    }
}

impl From<Entity> for NewEntity {
    fn from(entity: Entity) -> Self {
        Self {
            id: Some(entity.id),
            fields: entity.fields,
            created_at: entity.created_at,
        }
    }
}

// ============================================
// Outbox
// ============================================

/// Request description queued in the outbox.
///
/// Stored verbatim as JSON. The conventional shape is
/// `{ "method": "POST", "url": "/api/personnes/", "body": {...} }`; an action
/// without a `body` is sent as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(Value);

impl Action {
    /// Build an action from its explicit parts
    pub fn new(method: &str, url: Option<&str>, body: Value) -> Self {
        let mut map = Map::new();
        map.insert("method".to_string(), Value::String(method.to_string()));
        if let Some(url) = url {
            map.insert("url".to_string(), Value::String(url.to_string()));
        }
        map.insert("body".to_string(), body);
        Self(Value::Object(map))
    }

    /// Wrap an arbitrary JSON value
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// HTTP method, uppercased; POST when absent
    pub fn method(&self) -> String {
        self.0
            .get("method")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .map(str::to_uppercase)
            .unwrap_or_else(|| "POST".to_string())
    }

    /// Target url, if the action names one
    pub fn url(&self) -> Option<&str> {
        self.0
            .get("url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty())
    }

    /// Request body; the whole action when no explicit body is present
    pub fn body(&self) -> &Value {
        match self.0.get("body") {
            Some(body) if !body.is_null() => body,
            _ => &self.0,
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// A queued remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxItem {
    /// Store-assigned, strictly increasing queue id
    pub qid: i64,
    pub action: Action,
    pub enqueued_at: DateTime<Utc>,
}

impl OutboxItem {
    /// Stable idempotency key for this item on this device.
    ///
    /// Hex-encoded SHA-256 of `"{device_id}:{qid}"`, so redelivery of the
    /// same item always carries the same key.
    pub fn idempotency_key(&self, device_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(device_id.as_bytes());
        hasher.update(b":");
        hasher.update(self.qid.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ============================================
// Mapping reconciliation
// ============================================

/// One entry of a collector `mappings` array.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Mapping {
    /// Local entity the server id belongs to
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub client_id: Option<i64>,
    /// Authoritative server identifier
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub server_id: Option<String>,
    /// Outbox item acknowledged by the server
    #[serde(default, deserialize_with = "deserialize_opt_i64")]
    pub client_qid: Option<i64>,
}

/// Accepts a JSON number or string as an identifier
fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Accepts an integer given as a JSON number or numeric string
fn deserialize_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
