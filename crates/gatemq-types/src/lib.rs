//! GateMQ Types - Core domain types for the message broker
//!
//! This crate contains all shared types used across GateMQ components.

pub mod config;
pub mod connection;
pub mod destination;
pub mod error;
pub mod message;

// Re-export commonly used types
pub use config::BrokerConfig;
pub use connection::{
    AckMode, ConnectionConfig, ConnectionId, ConsumerId, ConsumerOptions, SendOptions,
};
pub use destination::{
    DestinationConfig, DestinationKey, DestinationKind, DestinationRef, DestinationStats,
};
pub use error::{Error, Result};
pub use message::{DeliveryMode, Message, MessageId};
