//! Consumer handles and deliveries

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gatemq_types::{AckMode, ConnectionId, ConsumerId, DestinationKey, Message, Result};
use tokio::sync::mpsc;
use tracing::debug;

use crate::destination::Destination;

/// A message handed to one consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: DestinationKey,
    pub consumer: ConsumerId,
    /// Position in the destination's enqueue order
    pub seq: u64,
    pub message: Arc<Message>,
    /// 1 on first delivery, higher after a redelivery
    pub delivery_count: u32,
}

impl Delivery {
    pub(crate) fn new(
        destination: &DestinationKey,
        consumer: ConsumerId,
        seq: u64,
        message: &Arc<Message>,
        delivery_count: u32,
    ) -> Self {
        Self {
            destination: destination.clone(),
            consumer,
            seq,
            message: message.clone(),
            delivery_count,
        }
    }

    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    pub fn body_as_str(&self) -> Option<&str> {
        self.message.body_as_str()
    }
}

/// Receiving side of an attached consumer slot
pub struct Inbox {
    pub(crate) rx: mpsc::Receiver<Delivery>,
    pub(crate) detached: Arc<AtomicBool>,
}

impl Inbox {
    /// Whether the destination has let go of this consumer
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

/// A subscription to a destination.
///
/// Dropping the handle detaches the consumer; its unacknowledged queue
/// messages are redelivered to the remaining consumers.
pub struct Consumer {
    id: ConsumerId,
    connection: ConnectionId,
    ack_mode: AckMode,
    destination: Arc<Destination>,
    inbox: Inbox,
    closed: bool,
}

impl Consumer {
    pub(crate) fn new(
        id: ConsumerId,
        connection: ConnectionId,
        ack_mode: AckMode,
        destination: Arc<Destination>,
        inbox: Inbox,
    ) -> Self {
        Self {
            id,
            connection,
            ack_mode,
            destination,
            inbox,
            closed: false,
        }
    }

    pub fn id(&self) -> ConsumerId {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn destination(&self) -> &DestinationKey {
        self.destination.key()
    }

    /// Wait for the next delivery. `None` once the consumer was detached
    /// (unsubscribe, connection close, destination deleted), even if
    /// deliveries were still buffered: those went back to the destination.
    pub async fn receive(&mut self) -> Option<Delivery> {
        let delivery = self.inbox.rx.recv().await?;
        self.accept(delivery)
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`
    pub async fn receive_timeout(&mut self, timeout: Duration) -> Option<Delivery> {
        tokio::time::timeout(timeout, self.receive())
            .await
            .ok()
            .flatten()
    }

    /// Take a delivery only if one is already buffered
    pub fn try_receive(&mut self) -> Option<Delivery> {
        let delivery = self.inbox.rx.try_recv().ok()?;
        self.accept(delivery)
    }

    /// Whether the destination has let go of this consumer
    pub fn is_detached(&self) -> bool {
        self.inbox.is_detached()
    }

    /// Acknowledge a delivery received in client-ack mode. Auto-acked
    /// deliveries are already settled and report `MessageNotFound`.
    pub fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.destination.ack(self.id, delivery.seq)
    }

    /// Detach explicitly
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.destination.detach(self.id)
    }

    fn accept(&mut self, delivery: Delivery) -> Option<Delivery> {
        if self.inbox.is_detached() {
            self.inbox.rx.close();
            return None;
        }
        Some(self.on_received(delivery))
    }

    fn on_received(&self, delivery: Delivery) -> Delivery {
        if self.ack_mode == AckMode::Auto {
            if let Err(e) = self.destination.ack(self.id, delivery.seq) {
                debug!(consumer = %self.id, error = %e, "Auto-ack skipped");
            }
        }
        delivery
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.closed && !self.inbox.is_detached() {
            // Already gone if the connection or destination went first
            let _ = self.destination.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("destination", self.destination.key())
            .field("ack_mode", &self.ack_mode)
            .finish()
    }
}
