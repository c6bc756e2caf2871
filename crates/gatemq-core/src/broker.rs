//! Broker - process-wide registry and send path
//!
//! The Broker owns every destination and connection and wires them to the
//! shared usage tracker, credit windows and flow-control gate. Destinations
//! come into existence on first reference; all references to one name
//! resolve to the same canonical destination.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use gatemq_storage::{MemoryStore, MessageStore};
use gatemq_types::{
    BrokerConfig, ConnectionConfig, ConnectionId, ConsumerId, ConsumerOptions, DestinationConfig,
    DestinationKey, DestinationRef, DestinationStats, Error, Message, Result, SendOptions,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionState};
use crate::consumer::Consumer;
use crate::credit::CreditWindow;
use crate::destination::Destination;
use crate::events::{BlockReason, BrokerEvent, BrokerListener, EventBus};
use crate::gate::{FlowControlGate, GateDecision};
use crate::journal::Journal;
use crate::usage::ResourceUsageTracker;

/// How a send went through the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted,
    /// Accepted after the producer was suspended for a while
    BlockedThenAccepted,
}

/// Result of a non-suspending send
#[derive(Debug)]
pub enum TrySend {
    Accepted,
    /// The send would have to wait; the message is handed back
    Blocked { message: Message, reason: BlockReason },
}

struct BrokerInner {
    config: BrokerConfig,
    store: Arc<dyn MessageStore>,
    journal: Journal,
    events: EventBus,
    tracker: ResourceUsageTracker,
    credits: Arc<CreditWindow>,
    gate: FlowControlGate,
    destinations: DashMap<DestinationKey, Arc<Destination>>,
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
    next_consumer: AtomicU64,
    next_temporary: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Main message broker
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Create a broker backed by an in-memory store
    pub fn new(config: BrokerConfig) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a broker with a custom persistence backend
    pub fn with_store(config: BrokerConfig, store: Arc<dyn MessageStore>) -> Result<Self> {
        config.validate()?;
        info!("Initializing GateMQ broker");

        let events = EventBus::new(config.event_capacity);
        let journal = Journal::new(store.clone());
        let credits = Arc::new(CreditWindow::new());
        Ok(Self {
            inner: Arc::new(BrokerInner {
                gate: FlowControlGate::new(events.clone(), credits.clone()),
                events,
                config,
                store,
                journal,
                tracker: ResourceUsageTracker::new(),
                credits,
                destinations: DashMap::new(),
                connections: DashMap::new(),
                next_consumer: AtomicU64::new(1),
                next_temporary: AtomicU64::new(1),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::Acquire)
    }

    // ==================== Lifecycle ====================

    /// Start the journal and the maintenance task. Must be called from
    /// within a tokio runtime; calling it twice has no further effect.
    ///
    /// Without it the journal still starts on the first persistent
    /// message, but expired messages are only dropped during dispatch.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            debug!("Broker already started");
            return;
        }
        self.inner.journal.start();

        let interval = self.inner.config.maintenance_interval_secs;
        if interval > 0 {
            self.inner.tasks.lock().push(spawn_maintenance(
                Arc::downgrade(&self.inner),
                Duration::from_secs(interval),
            ));
        }

        info!(maintenance_interval_secs = interval, "Broker started");
    }

    /// Close every connection, flush the journal and stop background tasks.
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down broker");

        let connections: Vec<ConnectionId> =
            self.inner.connections.iter().map(|e| *e.key()).collect();
        for id in connections {
            let _ = self.close_connection(id);
        }

        self.inner.journal.stop().await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Broker stopped");
    }

    // ==================== Connections ====================

    /// Open a connection with explicit flow-control settings
    pub fn connect(&self, config: ConnectionConfig) -> Result<Connection> {
        self.ensure_running()?;
        config.validate()?;

        let id = ConnectionId::new();
        self.inner.credits.open(id, config.producer_window_bytes);
        let state = Arc::new(ConnectionState::new(id, config));
        self.inner.connections.insert(id, state.clone());

        info!(
            connection = %id,
            producer_window_bytes = ?state.config().producer_window_bytes,
            reject_on_full = state.config().reject_on_full,
            "Connection opened"
        );
        self.inner
            .events
            .emit(BrokerEvent::ConnectionOpened { connection: id });
        Ok(Connection::new(self.clone(), state))
    }

    /// Open a connection with the broker's default settings
    pub fn connect_default(&self) -> Result<Connection> {
        self.connect(self.inner.config.default_connection.clone())
    }

    /// Close a connection: abort its suspended sends, detach its consumers
    /// and delete its temporary destinations.
    pub fn close_connection(&self, id: ConnectionId) -> Result<()> {
        let (_, state) = self
            .inner
            .connections
            .remove(&id)
            .ok_or(Error::ConnectionNotFound(id))?;
        state.close();

        let destinations: Vec<Arc<Destination>> = self
            .inner
            .destinations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        let mut detached = 0;
        for destination in destinations {
            detached += destination.detach_connection(id);
        }

        for key in state.take_temporaries() {
            if let Err(e) = self.delete_destination(&key) {
                debug!(destination = %key, error = %e, "Temporary destination already gone");
            }
        }
        self.inner.credits.close(id);

        info!(connection = %id, consumers = detached, "Connection closed");
        self.inner
            .events
            .emit(BrokerEvent::ConnectionClosed { connection: id });
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    // ==================== Destinations ====================

    /// Find or create the destination a reference points at. An
    /// exclusive-tagged reference switches a queue to exclusive dispatch.
    pub fn resolve(&self, reference: &DestinationRef) -> Result<Arc<Destination>> {
        let destination = self.get_or_create(reference.key())?;
        if reference.is_exclusive() {
            destination.latch_exclusive();
        }
        Ok(destination)
    }

    /// Create a destination explicitly. `config` defaults to the broker's
    /// configuration for that reference.
    pub fn create_destination(
        &self,
        reference: &DestinationRef,
        config: Option<DestinationConfig>,
    ) -> Result<Arc<Destination>> {
        self.ensure_running()?;
        let key = reference.key();
        let mut config = config.unwrap_or_else(|| self.inner.config.destination_config(key));
        config.exclusive |= reference.is_exclusive();
        config.validate()?;

        let mut created = false;
        let destination = self
            .inner
            .destinations
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                self.build(key.clone(), config, None)
            })
            .clone();

        if !created {
            return Err(Error::DestinationAlreadyExists(key.to_string()));
        }
        self.on_created(&destination);
        Ok(destination)
    }

    pub fn get_destination(&self, key: &DestinationKey) -> Option<Arc<Destination>> {
        self.inner.destinations.get(key).map(|d| d.clone())
    }

    /// All destinations, ordered by reference
    pub fn list_destinations(&self) -> Vec<Arc<Destination>> {
        let mut destinations: Vec<Arc<Destination>> = self
            .inner
            .destinations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        destinations.sort_by_key(|d| d.key().to_string());
        destinations
    }

    /// Delete a destination. Its consumers are detached and the quota it
    /// held is released.
    pub fn delete_destination(&self, key: &DestinationKey) -> Result<()> {
        let (_, destination) = self
            .inner
            .destinations
            .remove(key)
            .ok_or_else(|| Error::DestinationNotFound(key.to_string()))?;

        destination.delete();
        self.inner.tracker.unregister(key);
        self.inner.events.emit(BrokerEvent::DestinationDeleted {
            destination: key.clone(),
        });
        Ok(())
    }

    /// Drop every undelivered message of a destination
    pub fn purge(&self, key: &DestinationKey) -> Result<u64> {
        Ok(self.destination(key)?.purge())
    }

    pub fn stats(&self, key: &DestinationKey) -> Result<DestinationStats> {
        Ok(self.destination(key)?.stats())
    }

    /// Create a queue deleted when `connection` closes
    pub fn create_temporary_queue(&self, connection: ConnectionId) -> Result<DestinationRef> {
        let state = self.connection_state(connection)?;
        self.temporary_queue_on(&state)
    }

    // ==================== Messaging ====================

    /// Send a message, suspending while flow control requires it.
    ///
    /// Fails with `ResourceExhausted` when the destination is full and the
    /// send is reject-on-full, and with `ConnectionClosed` if the
    /// connection closes while the send is suspended.
    pub async fn send(
        &self,
        connection: ConnectionId,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        let state = self.connection_state(connection)?;
        self.send_on(&state, destination, message, options).await
    }

    /// Send without suspending
    pub fn try_send(
        &self,
        connection: ConnectionId,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<TrySend> {
        let state = self.connection_state(connection)?;
        self.try_send_on(&state, destination, message, options)
    }

    /// Attach a consumer. The consumer is exclusive if either the reference
    /// or the options say so.
    pub fn subscribe(
        &self,
        connection: ConnectionId,
        destination: &DestinationRef,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let state = self.connection_state(connection)?;
        self.subscribe_on(&state, destination, options)
    }

    /// Detach a consumer; its unacknowledged messages are redelivered
    pub fn unsubscribe(&self, consumer: Consumer) -> Result<()> {
        consumer.close()
    }

    pub(crate) async fn send_on(
        &self,
        state: &Arc<ConnectionState>,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<SendOutcome> {
        self.ensure_open(state)?;
        let message = match options.delivery_mode {
            Some(mode) => message.with_delivery_mode(mode),
            None => message,
        };
        let reject_on_full = options
            .reject_on_full
            .unwrap_or(state.config().reject_on_full);
        let target = self.resolve(destination)?;

        let admission = self
            .inner
            .gate
            .admit(state, &target, message.size(), reject_on_full)
            .await?;
        let blocked = admission.was_blocked();

        // On failure the admission is dropped and gives its bytes back
        target.enqueue(message)?;
        admission.commit();

        Ok(if blocked {
            SendOutcome::BlockedThenAccepted
        } else {
            SendOutcome::Accepted
        })
    }

    pub(crate) fn try_send_on(
        &self,
        state: &Arc<ConnectionState>,
        destination: &DestinationRef,
        message: Message,
        options: SendOptions,
    ) -> Result<TrySend> {
        self.ensure_open(state)?;
        let message = match options.delivery_mode {
            Some(mode) => message.with_delivery_mode(mode),
            None => message,
        };
        let reject_on_full = options
            .reject_on_full
            .unwrap_or(state.config().reject_on_full);
        let target = self.resolve(destination)?;

        match self
            .inner
            .gate
            .try_send(state, &target, message.size(), reject_on_full)
        {
            GateDecision::Allowed(admission) => {
                target.enqueue(message)?;
                admission.commit();
                Ok(TrySend::Accepted)
            }
            GateDecision::Blocked(reason) => Ok(TrySend::Blocked { message, reason }),
            GateDecision::Rejected => Err(Error::ResourceExhausted {
                connection: state.id(),
                destination: target.key().to_string(),
            }),
        }
    }

    pub(crate) fn subscribe_on(
        &self,
        state: &Arc<ConnectionState>,
        destination: &DestinationRef,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        self.ensure_open(state)?;
        options.validate()?;

        // Latching happens in attach, with the new consumer already counted
        let target = self.get_or_create(destination.key())?;
        let exclusive = destination.is_exclusive() || options.exclusive;

        let id = ConsumerId(self.inner.next_consumer.fetch_add(1, Ordering::Relaxed));
        let inbox = target.attach(id, state.id(), exclusive, options.prefetch)?;

        // Lost a race with close_connection's detach sweep
        if state.is_closed() {
            let _ = target.detach(id);
            return Err(Error::ConnectionClosed(state.id()));
        }

        Ok(Consumer::new(id, state.id(), options.ack_mode, target, inbox))
    }

    pub(crate) fn temporary_queue_on(&self, state: &Arc<ConnectionState>) -> Result<DestinationRef> {
        self.ensure_open(state)?;
        let n = self.inner.next_temporary.fetch_add(1, Ordering::Relaxed);
        let key = DestinationKey::queue(format!("temp-{}-{}", state.id(), n));

        let destination = self.build(
            key.clone(),
            self.inner.config.default_destination.clone(),
            Some(state.id()),
        );
        self.inner
            .destinations
            .insert(key.clone(), destination.clone());
        state.add_temporary(key.clone());
        self.on_created(&destination);

        if state.is_closed() {
            let _ = self.delete_destination(&key);
            return Err(Error::ConnectionClosed(state.id()));
        }
        Ok(DestinationRef::from(key))
    }

    // ==================== Maintenance ====================

    /// Drop expired undelivered messages everywhere. Returns how many.
    pub fn sweep_expired(&self) -> u64 {
        let now = Utc::now();
        self.inner
            .destinations
            .iter()
            .map(|e| e.value().clone())
            .collect::<Vec<_>>()
            .into_iter()
            .map(|d| d.expire(now))
            .sum()
    }

    /// Wait until persistent-message bookkeeping has reached the store
    pub async fn flush(&self) {
        self.inner.journal.flush().await;
    }

    // ==================== Observation ====================

    /// Producers suspended on a destination's quota
    pub fn blocked_producers(&self, key: &DestinationKey) -> usize {
        self.inner.tracker.waiting(key)
    }

    /// Bytes resident across all destinations
    pub fn total_usage(&self) -> u64 {
        self.inner.tracker.total_usage()
    }

    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn BrokerListener>) {
        self.inner.events.add_listener(listener);
    }

    pub fn tracker(&self) -> &ResourceUsageTracker {
        &self.inner.tracker
    }

    pub fn credits(&self) -> &CreditWindow {
        &self.inner.credits
    }

    // ==================== Internals ====================

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(Error::BrokerStopped)
        }
    }

    fn ensure_open(&self, state: &ConnectionState) -> Result<()> {
        self.ensure_running()?;
        if state.is_closed() {
            return Err(Error::ConnectionClosed(state.id()));
        }
        Ok(())
    }

    fn connection_state(&self, id: ConnectionId) -> Result<Arc<ConnectionState>> {
        self.inner
            .connections
            .get(&id)
            .map(|s| s.clone())
            .ok_or(Error::ConnectionNotFound(id))
    }

    fn destination(&self, key: &DestinationKey) -> Result<Arc<Destination>> {
        self.get_destination(key)
            .ok_or_else(|| Error::DestinationNotFound(key.to_string()))
    }

    fn get_or_create(&self, key: &DestinationKey) -> Result<Arc<Destination>> {
        if let Some(destination) = self.get_destination(key) {
            return Ok(destination);
        }
        self.ensure_running()?;

        let mut created = false;
        let destination = self
            .inner
            .destinations
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                self.build(key.clone(), self.inner.config.destination_config(key), None)
            })
            .clone();
        if created {
            self.on_created(&destination);
        }
        Ok(destination)
    }

    fn build(
        &self,
        key: DestinationKey,
        config: DestinationConfig,
        owner: Option<ConnectionId>,
    ) -> Arc<Destination> {
        let usage = self.inner.tracker.register(&key, config.memory_quota_bytes);
        Arc::new(Destination::new(
            key,
            config,
            owner,
            usage,
            self.inner.journal.clone(),
            self.inner.events.clone(),
        ))
    }

    fn on_created(&self, destination: &Destination) {
        info!(
            destination = %destination.key(),
            quota = ?destination.config().memory_quota_bytes,
            exclusive = destination.is_exclusive(),
            temporary = destination.owner().is_some(),
            "Destination created"
        );
        self.inner.events.emit(BrokerEvent::DestinationCreated {
            destination: destination.key().clone(),
        });
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("destinations", &self.inner.destinations.len())
            .field("connections", &self.inner.connections.len())
            .field("running", &self.is_running())
            .finish()
    }
}

fn spawn_maintenance(inner: Weak<BrokerInner>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let broker = Broker { inner };
            if !broker.is_running() {
                break;
            }
            let expired = broker.sweep_expired();
            if expired > 0 {
                info!(count = expired, "Expired messages dropped");
            }
        }
        debug!("Maintenance task finished");
    })
}
