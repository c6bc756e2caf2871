//! Client connections
//!
//! A connection owns its send lane and its temporary destinations; its
//! producer window lives in the broker's [`CreditWindow`](crate::CreditWindow).
//! Closing it aborts every send suspended on its behalf.

use std::sync::Arc;

use gatemq_types::{
    ConnectionConfig, ConnectionId, ConsumerOptions, DestinationKey, DestinationRef, Message,
    Result, SendOptions,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::broker::{Broker, SendOutcome, TrySend};
use crate::consumer::Consumer;

/// Broker-side state of a connection
pub struct ConnectionState {
    id: ConnectionId,
    config: ConnectionConfig,
    /// Serializes sends when no producer window is configured
    lane: Arc<tokio::sync::Mutex<()>>,
    closed: watch::Sender<bool>,
    temporaries: Mutex<Vec<DestinationKey>>,
}

impl ConnectionState {
    pub(crate) fn new(id: ConnectionId, config: ConnectionConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            config,
            lane: Arc::new(tokio::sync::Mutex::new(())),
            closed,
            temporaries: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn lane(&self) -> &Arc<tokio::sync::Mutex<()>> {
        &self.lane
    }

    /// Sends proceed independently only under a finite producer window
    pub fn is_windowed(&self) -> bool {
        self.config.producer_window_bytes.is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Mark closed. Returns false if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Resolves once the connection is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn add_temporary(&self, key: DestinationKey) {
        self.temporaries.lock().push(key);
    }

    pub(crate) fn take_temporaries(&self) -> Vec<DestinationKey> {
        std::mem::take(&mut *self.temporaries.lock())
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Client-side handle to a connection
#[derive(Clone)]
pub struct Connection {
    broker: Broker,
    state: Arc<ConnectionState>,
}

impl Connection {
    pub(crate) fn new(broker: Broker, state: Arc<ConnectionState>) -> Self {
        Self { broker, state }
    }

    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.state.config
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Bytes of this connection's sends currently inside the gate
    pub fn outstanding_credit(&self) -> u64 {
        self.broker.credits().outstanding(self.state.id)
    }

    pub async fn send(&self, destination: &DestinationRef, message: Message) -> Result<SendOutcome> {
        self.send_with(destination, message, SendOptions::default())
            .await
    }

    pub async fn send_with(
        &self,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        self.broker
            .send_on(&self.state, destination, message, options)
            .await
    }

    /// Send only if no flow-control wait is needed
    pub fn try_send(&self, destination: &DestinationRef, message: Message) -> Result<TrySend> {
        self.try_send_with(destination, message, SendOptions::default())
    }

    pub fn try_send_with(
        &self,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<TrySend> {
        self.broker
            .try_send_on(&self.state, destination, message, options)
    }

    pub fn subscribe(&self, destination: &DestinationRef) -> Result<Consumer> {
        self.subscribe_with(destination, ConsumerOptions::default())
    }

    pub fn subscribe_with(
        &self,
        destination: &DestinationRef,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        self.broker.subscribe_on(&self.state, destination, options)
    }

    /// A queue that lives until this connection closes
    pub fn create_temporary_queue(&self) -> Result<DestinationRef> {
        self.broker.temporary_queue_on(&self.state)
    }

    /// Close the connection. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.broker.close_connection(self.state.id)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .finish()
    }
}
