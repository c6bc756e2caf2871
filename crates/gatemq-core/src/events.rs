//! Broker events and listeners
//!
//! Every state transition a collaborator or a test might wait for is
//! published on a broadcast channel. Listeners are the callback flavour of
//! the same thing, for collaborators that cannot hold a receiver.

use std::sync::Arc;

use gatemq_types::{ConnectionId, ConsumerId, DestinationKey};
use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Why a producer is suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Waiting behind an earlier send on the same connection
    SendLane,
    /// Producer window exhausted
    Credit,
    /// Destination at its memory quota
    Quota,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    DestinationCreated {
        destination: DestinationKey,
    },
    DestinationDeleted {
        destination: DestinationKey,
    },
    ConnectionOpened {
        connection: ConnectionId,
    },
    ConnectionClosed {
        connection: ConnectionId,
    },
    ConsumerAttached {
        destination: DestinationKey,
        consumer: ConsumerId,
    },
    ConsumerDetached {
        destination: DestinationKey,
        consumer: ConsumerId,
    },
    ExclusiveConsumerElected {
        destination: DestinationKey,
        consumer: Option<ConsumerId>,
    },
    ProducerBlocked {
        connection: ConnectionId,
        destination: DestinationKey,
        reason: BlockReason,
    },
    ProducerResumed {
        connection: ConnectionId,
        destination: DestinationKey,
    },
    ResourceException {
        connection: ConnectionId,
        destination: DestinationKey,
    },
    MessagesDiscarded {
        destination: DestinationKey,
        count: u64,
    },
}

/// Callback interface for broker collaborators
pub trait BrokerListener: Send + Sync {
    /// A send was rejected under the reject-on-full policy
    fn on_resource_exception(&self, _connection: ConnectionId, _destination: &DestinationKey) {}

    /// Any other broker event
    fn on_event(&self, _event: &BrokerEvent) {}
}

/// Fan-out point for events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BrokerEvent>,
    listeners: Arc<RwLock<Vec<Arc<dyn BrokerListener>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn BrokerListener>) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: BrokerEvent) {
        {
            let listeners = self.listeners.read();
            for listener in listeners.iter() {
                if let BrokerEvent::ResourceException {
                    connection,
                    destination,
                } = &event
                {
                    listener.on_resource_exception(*connection, destination);
                }
                listener.on_event(&event);
            }
        }
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.tx.receiver_count())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}
