//! Message types for GateMQ
//!
//! A message is immutable once it has passed the flow-control gate. The
//! broker wraps accepted messages in an `Arc` and hands clones of that
//! pointer to consumers.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery mode of a message.
///
/// Only the persistence collaborator looks at this; dispatch and flow
/// control treat both modes the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    #[default]
    NonPersistent,
    Persistent,
}

/// A message sent by a producer
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Message {
    /// Unique message identifier
    pub id: MessageId,

    /// Message body (raw bytes)
    #[serde(with = "bytes_serde")]
    #[schema(value_type = String)]
    pub body: Bytes,

    /// Custom attributes/headers
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Persistent or not
    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    /// When the message was created
    pub created_at: DateTime<Utc>,

    /// When the message expires (optional)
    pub expires_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Create a new non-persistent message with the given body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::new(),
            body: body.into(),
            attributes: HashMap::new(),
            delivery_mode: DeliveryMode::NonPersistent,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    /// Create a new message with JSON content
    pub fn json<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(data)?;
        Ok(Self::new(body).with_attribute("content-type", "application/json"))
    }

    /// Set delivery mode
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Mark the message persistent
    pub fn persistent(self) -> Self {
        self.with_delivery_mode(DeliveryMode::Persistent)
    }

    /// Add an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Set expiration time
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Expire `ttl` after creation
    pub fn with_ttl(self, ttl: Duration) -> Self {
        let expires_at = self.created_at + ttl;
        self.with_expiry(expires_at)
    }

    /// Size charged against quotas and producer windows
    pub fn size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether the persistence collaborator should see this message
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == DeliveryMode::Persistent
    }

    /// Check if the message has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a fixed instant
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| now > exp).unwrap_or(false)
    }

    /// Get the body as a string (if valid UTF-8)
    pub fn body_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Deserialize the body as JSON
    pub fn body_as_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Custom serialization for Bytes (as UTF-8 text or base64)
mod bytes_serde {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if let Ok(s) = std::str::from_utf8(bytes) {
            s.serialize(serializer)
        } else {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            encoded.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Bytes::from(s))
    }
}
