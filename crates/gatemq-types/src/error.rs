//! Error types for GateMQ
//!
//! Blocking on a full destination or an exhausted producer window is not an
//! error; it shows up as latency. Only the variants below reach callers.

use thiserror::Error;

use crate::connection::{ConnectionId, ConsumerId};

/// Main error type for GateMQ operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Destination not found
    #[error("Destination not found: {0}")]
    DestinationNotFound(String),

    /// Destination already exists
    #[error("Destination already exists: {0}")]
    DestinationAlreadyExists(String),

    /// Connection not found (never opened or already closed and reaped)
    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    /// Consumer not attached to the destination
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    /// Message not in flight for the acknowledging consumer
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Send rejected because the destination is full and the sender asked
    /// to fail instead of block
    #[error("Resource exhausted: destination {destination} is over its memory quota")]
    ResourceExhausted {
        connection: ConnectionId,
        destination: String,
    },

    /// The connection closed while an operation was in flight
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// Quota, window or prefetch configured with an unusable value
    #[error("Quota misconfigured: {0}")]
    QuotaMisconfigured(String),

    /// Destination reference could not be parsed
    #[error("Invalid destination reference: {0}")]
    InvalidDestination(String),

    /// Invalid message format
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Broker is not running
    #[error("Broker stopped")]
    BrokerStopped,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the two failures a producer must observe explicitly
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted { .. } | Error::ConnectionClosed(_)
        )
    }
}

/// Result type alias for GateMQ operations
pub type Result<T> = std::result::Result<T, Error>;
