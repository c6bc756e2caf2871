//! In-memory message store
//!
//! Fast, non-persistent storage for development and testing.
//! All data is lost when the process exits.

use std::collections::VecDeque;

use async_trait::async_trait;
use dashmap::DashMap;
use gatemq_types::{DestinationKey, Message, MessageId, Result};
use tracing::{debug, info};

use crate::traits::MessageStore;

/// In-memory store implementation
pub struct MemoryStore {
    /// Stored messages by destination, in append order
    destinations: DashMap<DestinationKey, VecDeque<Message>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        info!("Initializing in-memory message store");
        Self {
            destinations: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, destination: &DestinationKey, message: &Message) -> Result<()> {
        self.destinations
            .entry(destination.clone())
            .or_default()
            .push_back(message.clone());

        debug!(
            destination = %destination,
            message_id = %message.id,
            "Message stored"
        );
        Ok(())
    }

    async fn remove(&self, destination: &DestinationKey, message_id: &MessageId) -> Result<()> {
        if let Some(mut messages) = self.destinations.get_mut(destination) {
            if let Some(pos) = messages.iter().position(|m| &m.id == message_id) {
                messages.remove(pos);
                debug!(
                    destination = %destination,
                    message_id = %message_id,
                    "Message removed from store"
                );
            }
        }
        Ok(())
    }

    async fn load(&self, destination: &DestinationKey) -> Result<Vec<Message>> {
        Ok(self
            .destinations
            .get(destination)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn count(&self, destination: &DestinationKey) -> Result<u64> {
        Ok(self
            .destinations
            .get(destination)
            .map(|messages| messages.len() as u64)
            .unwrap_or(0))
    }

    async fn remove_destination(&self, destination: &DestinationKey) -> Result<u64> {
        let count = self
            .destinations
            .remove(destination)
            .map(|(_, messages)| messages.len() as u64)
            .unwrap_or(0);

        info!(destination = %destination, count = count, "Destination dropped from store");
        Ok(count)
    }
}
