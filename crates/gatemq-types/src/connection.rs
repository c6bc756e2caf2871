//! Connection, producer and consumer options

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::DeliveryMode;

/// Unique identifier for a client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random ConnectionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an attached consumer.
///
/// Allocated from a broker-wide counter, so ordering by id is ordering by
/// attachment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
pub struct ConsumerId(pub u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection-level flow control settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionConfig {
    /// Producer window in bytes (unset = unlimited, sends are serialized
    /// per connection instead)
    #[serde(default)]
    pub producer_window_bytes: Option<u64>,

    /// Fail sends to a full destination instead of blocking them
    #[serde(default)]
    pub reject_on_full: bool,
}

impl ConnectionConfig {
    pub fn with_producer_window(mut self, bytes: u64) -> Self {
        self.producer_window_bytes = Some(bytes);
        self
    }

    pub fn with_reject_on_full(mut self, reject: bool) -> Self {
        self.reject_on_full = reject;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.producer_window_bytes == Some(0) {
            return Err(Error::QuotaMisconfigured(
                "producer window must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-send overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Overrides the message's own delivery mode
    pub delivery_mode: Option<DeliveryMode>,

    /// Overrides the connection's reject-on-full setting
    pub reject_on_full: Option<bool>,
}

impl SendOptions {
    pub fn persistent() -> Self {
        Self {
            delivery_mode: Some(DeliveryMode::Persistent),
            ..Default::default()
        }
    }

    pub fn reject_on_full() -> Self {
        Self {
            reject_on_full: Some(true),
            ..Default::default()
        }
    }
}

/// How deliveries are acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Acknowledged as soon as the client receives it
    #[default]
    Auto,
    /// The client calls `ack` explicitly
    Client,
}

/// Subscription options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConsumerOptions {
    /// Maximum unacknowledged deliveries outstanding to this consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    #[serde(default)]
    pub ack_mode: AckMode,

    /// Subscribe as an exclusive consumer even if the reference is untagged
    #[serde(default)]
    pub exclusive: bool,
}

fn default_prefetch() -> usize {
    100
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: default_prefetch(),
            ack_mode: AckMode::Auto,
            exclusive: false,
        }
    }
}

impl ConsumerOptions {
    pub fn client_ack() -> Self {
        Self {
            ack_mode: AckMode::Client,
            ..Default::default()
        }
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch == 0 {
            return Err(Error::QuotaMisconfigured(
                "consumer prefetch must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
