//! Message store trait definition
//!
//! Defines the interface that all persistence backends must implement.

use async_trait::async_trait;
use gatemq_types::{DestinationKey, Message, MessageId, Result};

/// Message store trait - all backends implement this
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Record a persistent message accepted by a destination
    async fn append(&self, destination: &DestinationKey, message: &Message) -> Result<()>;

    /// Forget a message that was acknowledged, expired or purged
    async fn remove(&self, destination: &DestinationKey, message_id: &MessageId) -> Result<()>;

    /// All stored messages of a destination, oldest first
    async fn load(&self, destination: &DestinationKey) -> Result<Vec<Message>>;

    /// Number of stored messages of a destination
    async fn count(&self, destination: &DestinationKey) -> Result<u64>;

    /// Drop everything stored for a destination
    async fn remove_destination(&self, destination: &DestinationKey) -> Result<u64>;
}
