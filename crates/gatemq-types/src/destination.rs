//! Destination types for GateMQ
//!
//! A destination is named by a [`DestinationRef`]. Many references may
//! point at the same destination: the options carried by a reference (for
//! example `?exclusive=true`) never create a second destination, they only
//! influence the one that [`DestinationRef::key`] resolves to.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::connection::ConsumerId;
use crate::error::{Error, Result};

/// Queue or topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    #[default]
    Queue,
    Topic,
}

impl DestinationKind {
    fn scheme(self) -> &'static str {
        match self {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
        }
    }
}

/// Canonical identity of a destination: kind plus name, no options
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct DestinationKey {
    pub kind: DestinationKind,
    pub name: String,
}

impl DestinationKey {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Queue,
            name: name.into(),
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: DestinationKind::Topic,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.kind.scheme(), self.name)
    }
}

/// A reference to a destination as a client spells it.
///
/// Accepted forms: `orders`, `queue://orders`, `topic://prices`, with an
/// optional `?exclusive=true` (or `?consumer.exclusive=true`) suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationRef {
    key: DestinationKey,
    exclusive: bool,
}

impl DestinationRef {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            key: DestinationKey::queue(name),
            exclusive: false,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            key: DestinationKey::topic(name),
            exclusive: false,
        }
    }

    /// The same destination, tagged exclusive
    pub fn with_exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.key.kind
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl From<DestinationKey> for DestinationRef {
    fn from(key: DestinationKey) -> Self {
        Self {
            key,
            exclusive: false,
        }
    }
}

impl std::fmt::Display for DestinationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key)?;
        if self.exclusive {
            write!(f, "?exclusive=true")?;
        }
        Ok(())
    }
}

impl FromStr for DestinationRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (path, query) = match s.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (s, None),
        };

        let (kind, name) = match path.split_once("://") {
            Some(("queue", name)) => (DestinationKind::Queue, name),
            Some(("topic", name)) => (DestinationKind::Topic, name),
            Some((scheme, _)) => {
                return Err(Error::InvalidDestination(format!(
                    "unknown scheme '{scheme}' in '{s}'"
                )))
            }
            None => (DestinationKind::Queue, path),
        };

        if name.is_empty() {
            return Err(Error::InvalidDestination(format!("empty name in '{s}'")));
        }

        let mut exclusive = false;
        for option in query.into_iter().flat_map(|q| q.split('&')) {
            match option.split_once('=') {
                Some(("exclusive" | "consumer.exclusive", value)) => {
                    exclusive = value.parse::<bool>().map_err(|_| {
                        Error::InvalidDestination(format!("bad exclusive value '{value}'"))
                    })?;
                }
                _ => {
                    return Err(Error::InvalidDestination(format!(
                        "unknown option '{option}' in '{s}'"
                    )))
                }
            }
        }

        Ok(Self {
            key: DestinationKey {
                kind,
                name: name.to_string(),
            },
            exclusive,
        })
    }
}

/// Per-destination configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DestinationConfig {
    /// Memory quota in bytes (unset = unlimited)
    #[serde(default)]
    pub memory_quota_bytes: Option<u64>,

    /// Route everything to a single active consumer
    #[serde(default)]
    pub exclusive: bool,

    /// Default message TTL in seconds (0 = no expiry)
    #[serde(default)]
    pub message_ttl_secs: u64,
}

impl DestinationConfig {
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.memory_quota_bytes = Some(bytes);
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Fail fast on a quota no message could ever fit into
    pub fn validate(&self) -> Result<()> {
        if self.memory_quota_bytes == Some(0) {
            return Err(Error::QuotaMisconfigured(
                "destination memory quota must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Destination statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct DestinationStats {
    /// Messages waiting for a consumer
    pub pending_count: u64,

    /// Messages delivered and awaiting acknowledgment
    pub in_flight_count: u64,

    /// Bytes currently charged against the quota
    pub usage_bytes: u64,

    /// Configured quota, if any
    pub quota_bytes: Option<u64>,

    /// Number of attached consumers
    pub consumer_count: u64,

    /// Producers suspended on this destination's quota
    pub blocked_producers: u64,

    /// Whether the destination dispatches exclusively
    pub exclusive: bool,

    /// Currently active exclusive consumer
    pub active_consumer: Option<ConsumerId>,

    /// Total messages accepted
    pub enqueued_total: u64,

    /// Total messages acknowledged
    pub dequeued_total: u64,

    /// Total messages dropped by expiry or purge
    pub discarded_total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_name_is_queue() {
        let r: DestinationRef = "orders".parse().unwrap();
        assert_eq!(r.kind(), DestinationKind::Queue);
        assert_eq!(r.name(), "orders");
        assert!(!r.is_exclusive());
    }

    #[test]
    fn test_parse_exclusive_option() {
        let plain: DestinationRef = "queue://orders".parse().unwrap();
        let tagged: DestinationRef = "queue://orders?consumer.exclusive=true".parse().unwrap();

        assert!(tagged.is_exclusive());
        assert_eq!(plain.key(), tagged.key());
        assert_eq!(tagged.to_string(), "queue://orders?exclusive=true");
    }

    #[test]
    fn test_parse_topic() {
        let r: DestinationRef = "topic://prices".parse().unwrap();
        assert_eq!(r.key(), &DestinationKey::topic("prices"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("http://x".parse::<DestinationRef>().is_err());
        assert!("queue://".parse::<DestinationRef>().is_err());
        assert!("queue://a?exclusive=maybe".parse::<DestinationRef>().is_err());
        assert!("queue://a?prefetch=3".parse::<DestinationRef>().is_err());
    }

    #[test]
    fn test_zero_quota_is_misconfigured() {
        let config = DestinationConfig::default().with_quota(0);
        assert!(matches!(
            config.validate(),
            Err(Error::QuotaMisconfigured(_))
        ));
        assert!(DestinationConfig::default().with_quota(1).validate().is_ok());
    }
}
