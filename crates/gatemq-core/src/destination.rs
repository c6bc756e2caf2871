//! Destination - message buffer plus attached consumers
//!
//! Queues hand each message to exactly one consumer chosen by the
//! [`DispatchPolicy`]. Topics fan out: every attached subscriber gets a
//! copy, buffered per subscriber while it lacks prefetch capacity.
//!
//! Quota bytes are charged by the flow-control gate before `enqueue` and
//! discharged here, once the last holder of a message lets go of it.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gatemq_types::{
    ConnectionId, ConsumerId, DestinationConfig, DestinationKey, DestinationKind,
    DestinationStats, Error, Message, Result,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::budget::Budget;
use crate::consumer::{Delivery, Inbox};
use crate::dispatch::{DispatchPolicy, DispatchTarget};
use crate::events::{BrokerEvent, EventBus};
use crate::journal::Journal;

/// A message resident in the destination
struct Entry {
    seq: u64,
    message: Arc<Message>,
    delivery_count: u32,
}

/// A dispatched (queue) or fanned-out (topic) message and who still holds it
struct Resident {
    entry: Entry,
    holders: Vec<ConsumerId>,
}

struct ConsumerSlot {
    id: ConsumerId,
    connection: ConnectionId,
    exclusive: bool,
    prefetch: usize,
    /// Delivered and not yet acknowledged
    outstanding: usize,
    /// Topic only: sequences fanned out to this subscriber, not yet delivered
    backlog: VecDeque<u64>,
    tx: mpsc::Sender<Delivery>,
    /// Shared with the consumer handle; set once the slot is removed so
    /// deliveries still buffered in the channel are not handed out
    detached: Arc<AtomicBool>,
}

impl ConsumerSlot {
    fn retire(self) -> ConsumerId {
        self.detached.store(true, Ordering::Release);
        self.id
    }
}

impl DispatchTarget for ConsumerSlot {
    fn consumer_id(&self) -> ConsumerId {
        self.id
    }

    fn is_demand_ready(&self) -> bool {
        self.outstanding < self.prefetch
    }

    fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

struct DestinationState {
    policy: DispatchPolicy,
    /// Attachment order
    consumers: Vec<ConsumerSlot>,
    /// Queue only, ordered by sequence
    pending: VecDeque<Entry>,
    in_flight: BTreeMap<u64, Resident>,
    next_seq: u64,
    deleted: bool,
    enqueued_total: u64,
    dequeued_total: u64,
    discarded_total: u64,
}

/// Work to finish once the state lock is released
#[derive(Default)]
struct Effects {
    freed: u64,
    discarded: u64,
    detached: Vec<ConsumerId>,
    elected: Option<Option<ConsumerId>>,
}

/// A queue or topic with its consumers
pub struct Destination {
    key: DestinationKey,
    config: DestinationConfig,
    /// Connection owning a temporary destination
    owner: Option<ConnectionId>,
    usage: Arc<Budget>,
    journal: Journal,
    events: EventBus,
    state: Mutex<DestinationState>,
}

impl Destination {
    pub fn new(
        key: DestinationKey,
        config: DestinationConfig,
        owner: Option<ConnectionId>,
        usage: Arc<Budget>,
        journal: Journal,
        events: EventBus,
    ) -> Self {
        let policy = if config.exclusive && key.kind == DestinationKind::Queue {
            DispatchPolicy::exclusive()
        } else {
            DispatchPolicy::default()
        };

        Self {
            key,
            config,
            owner,
            usage,
            journal,
            events,
            state: Mutex::new(DestinationState {
                policy,
                consumers: Vec::new(),
                pending: VecDeque::new(),
                in_flight: BTreeMap::new(),
                next_seq: 0,
                deleted: false,
                enqueued_total: 0,
                dequeued_total: 0,
                discarded_total: 0,
            }),
        }
    }

    pub fn key(&self) -> &DestinationKey {
        &self.key
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn owner(&self) -> Option<ConnectionId> {
        self.owner
    }

    /// Quota ledger of this destination
    pub fn usage(&self) -> &Arc<Budget> {
        &self.usage
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.lock().policy.is_exclusive()
    }

    pub fn active_consumer(&self) -> Option<ConsumerId> {
        self.state.lock().policy.active()
    }

    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Switch a queue to exclusive dispatch. Happens at most once; topics
    /// ignore it. Returns true on the transition.
    pub fn latch_exclusive(&self) -> bool {
        if self.key.kind != DestinationKind::Queue {
            return false;
        }
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if !state.policy.make_exclusive(&state.consumers) {
                return false;
            }
            fx.elected = Some(state.policy.active());
            self.dispatch(state, &mut fx);
        }
        info!(destination = %self.key, "Destination switched to exclusive dispatch");
        self.apply(fx);
        true
    }

    /// Accept a message that already passed the gate.
    ///
    /// On error the caller still owns the quota bytes it reserved.
    pub fn enqueue(&self, message: Message) -> Result<u64> {
        let message = Arc::new(self.apply_default_ttl(message));
        let mut fx = Effects::default();

        let seq = {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.deleted {
                return Err(Error::DestinationNotFound(self.key.to_string()));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.enqueued_total += 1;
            self.journal.append(&self.key, &message);

            let entry = Entry {
                seq,
                message,
                delivery_count: 0,
            };

            match self.key.kind {
                DestinationKind::Queue => state.pending.push_back(entry),
                DestinationKind::Topic => {
                    if state.consumers.is_empty() {
                        // Nobody subscribed, nobody will ever see it
                        self.discard(state, &entry, &mut fx);
                    } else {
                        let holders = state.consumers.iter().map(|c| c.id).collect();
                        for slot in state.consumers.iter_mut() {
                            slot.backlog.push_back(seq);
                        }
                        state.in_flight.insert(seq, Resident { entry, holders });
                    }
                }
            }

            self.dispatch(state, &mut fx);
            seq
        };

        debug!(destination = %self.key, seq = seq, "Message enqueued");
        self.apply(fx);
        Ok(seq)
    }

    /// Attach a consumer and start draining pending messages to it.
    ///
    /// An `exclusive` consumer switches a queue to exclusive dispatch. On a
    /// queue that is already exclusive, the newcomer only becomes active if
    /// no consumer is.
    pub fn attach(
        &self,
        id: ConsumerId,
        connection: ConnectionId,
        exclusive: bool,
        prefetch: usize,
    ) -> Result<Inbox> {
        let (tx, rx) = mpsc::channel(prefetch.max(1));
        let detached = Arc::new(AtomicBool::new(false));
        let mut fx = Effects::default();
        let latched;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.deleted {
                return Err(Error::DestinationNotFound(self.key.to_string()));
            }

            state.consumers.push(ConsumerSlot {
                id,
                connection,
                exclusive,
                prefetch,
                outstanding: 0,
                backlog: VecDeque::new(),
                tx,
                detached: detached.clone(),
            });
            // An exclusive subscriber latches the queue with itself in the
            // running; otherwise it only fills a vacant active slot
            latched = exclusive
                && self.key.kind == DestinationKind::Queue
                && state.policy.make_exclusive(&state.consumers);
            if latched {
                fx.elected = Some(state.policy.active());
            } else if let Some(elected) = state.policy.fill_vacancy(&state.consumers) {
                fx.elected = Some(Some(elected));
            }
            self.dispatch(state, &mut fx);
        }

        if latched {
            info!(destination = %self.key, "Destination switched to exclusive dispatch");
        }
        info!(
            destination = %self.key,
            consumer = %id,
            connection = %connection,
            exclusive = exclusive,
            "Consumer attached"
        );
        self.events.emit(BrokerEvent::ConsumerAttached {
            destination: self.key.clone(),
            consumer: id,
        });
        self.apply(fx);
        Ok(Inbox { rx, detached })
    }

    /// Detach a consumer. Its unacknowledged queue messages go back to
    /// pending in their original order.
    pub fn detach(&self, id: ConsumerId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let idx = state
                .consumers
                .iter()
                .position(|c| c.id == id)
                .ok_or(Error::ConsumerNotFound(id))?;
            self.remove_consumer(state, idx, &mut fx);
            self.dispatch(state, &mut fx);
        }
        self.apply(fx);
        Ok(())
    }

    /// Detach every consumer opened by `connection`
    pub fn detach_connection(&self, connection: ConnectionId) -> usize {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            while let Some(idx) = state
                .consumers
                .iter()
                .position(|c| c.connection == connection)
            {
                self.remove_consumer(state, idx, &mut fx);
            }
            self.dispatch(state, &mut fx);
        }
        let count = fx.detached.len();
        self.apply(fx);
        count
    }

    /// Acknowledge one delivery
    pub fn ack(&self, consumer: ConsumerId, seq: u64) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let slot = state
                .consumers
                .iter_mut()
                .find(|c| c.id == consumer)
                .ok_or(Error::ConsumerNotFound(consumer))?;

            let not_found = || Error::MessageNotFound(format!("{}#{}", self.key, seq));
            if slot.backlog.contains(&seq) {
                return Err(not_found());
            }
            let resident = state.in_flight.get_mut(&seq).ok_or_else(not_found)?;
            let pos = resident
                .holders
                .iter()
                .position(|h| *h == consumer)
                .ok_or_else(not_found)?;

            resident.holders.swap_remove(pos);
            slot.outstanding = slot.outstanding.saturating_sub(1);

            if resident.holders.is_empty() {
                if let Some(resident) = state.in_flight.remove(&seq) {
                    fx.freed += resident.entry.message.size();
                    self.journal.remove(&self.key, &resident.entry.message);
                    state.dequeued_total += 1;
                }
            }

            // The acknowledging consumer has room again
            self.dispatch(state, &mut fx);
        }

        debug!(destination = %self.key, consumer = %consumer, seq = seq, "Message acknowledged");
        self.apply(fx);
        Ok(())
    }

    /// Drop every message not yet delivered. Returns how many were dropped.
    pub fn purge(&self) -> u64 {
        let count = self.drop_undelivered(|_| true);
        info!(destination = %self.key, count = count, "Destination purged");
        count
    }

    /// Drop undelivered messages that expired before `now`
    pub fn expire(&self, now: DateTime<Utc>) -> u64 {
        let count = self.drop_undelivered(|m| m.is_expired_at(now));
        if count > 0 {
            debug!(destination = %self.key, count = count, "Expired messages dropped");
        }
        count
    }

    /// Tear down: detach everyone and discharge everything resident.
    pub fn delete(&self) {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.deleted {
                return;
            }
            state.deleted = true;

            // Dropping the senders ends every consumer's receive loop
            fx.detached = state.consumers.drain(..).map(ConsumerSlot::retire).collect();
            for entry in state.pending.drain(..) {
                fx.freed += entry.message.size();
            }
            for (_, resident) in std::mem::take(&mut state.in_flight) {
                fx.freed += resident.entry.message.size();
            }
            self.journal.remove_destination(&self.key);
        }
        info!(destination = %self.key, "Destination deleted");
        self.apply(fx);
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    pub fn stats(&self) -> DestinationStats {
        let state = self.state.lock();
        let in_flight_count = match self.key.kind {
            DestinationKind::Queue => state.in_flight.len() as u64,
            DestinationKind::Topic => state.consumers.iter().map(|c| c.outstanding as u64).sum(),
        };
        let pending_count = match self.key.kind {
            DestinationKind::Queue => state.pending.len() as u64,
            DestinationKind::Topic => state.consumers.iter().map(|c| c.backlog.len() as u64).sum(),
        };

        DestinationStats {
            pending_count,
            in_flight_count,
            usage_bytes: self.usage.used(),
            quota_bytes: self.usage.limit(),
            consumer_count: state.consumers.len() as u64,
            blocked_producers: self.usage.waiting() as u64,
            exclusive: state.policy.is_exclusive(),
            active_consumer: state.policy.active(),
            enqueued_total: state.enqueued_total,
            dequeued_total: state.dequeued_total,
            discarded_total: state.discarded_total,
        }
    }

    // ==================== Internals ====================

    fn apply_default_ttl(&self, message: Message) -> Message {
        if self.config.message_ttl_secs > 0 && message.expires_at.is_none() {
            let ttl = chrono::Duration::seconds(self.config.message_ttl_secs as i64);
            message.with_ttl(ttl)
        } else {
            message
        }
    }

    fn discard(&self, state: &mut DestinationState, entry: &Entry, fx: &mut Effects) {
        fx.freed += entry.message.size();
        fx.discarded += 1;
        state.discarded_total += 1;
        self.journal.remove(&self.key, &entry.message);
    }

    fn dispatch(&self, state: &mut DestinationState, fx: &mut Effects) {
        match self.key.kind {
            DestinationKind::Queue => self.dispatch_queue(state, fx),
            DestinationKind::Topic => self.dispatch_topic(state, fx),
        }
    }

    fn dispatch_queue(&self, state: &mut DestinationState, fx: &mut Effects) {
        let now = Utc::now();
        loop {
            let expired = match state.pending.front() {
                Some(front) => front.message.is_expired_at(now),
                None => break,
            };
            if expired {
                if let Some(entry) = state.pending.pop_front() {
                    self.discard(state, &entry, fx);
                }
                continue;
            }

            let Some(idx) = state.policy.select(&state.consumers) else {
                break;
            };
            let Some(mut entry) = state.pending.pop_front() else {
                break;
            };

            let slot = &mut state.consumers[idx];
            entry.delivery_count += 1;
            let delivery = Delivery::new(
                &self.key,
                slot.id,
                entry.seq,
                &entry.message,
                entry.delivery_count,
            );
            match slot.tx.try_send(delivery) {
                Ok(()) => {
                    slot.outstanding += 1;
                    let holders = vec![slot.id];
                    state.in_flight.insert(entry.seq, Resident { entry, holders });
                }
                Err(_) => {
                    // Consumer handle is gone; treat it as detached and retry
                    // the same message with whoever is elected next
                    entry.delivery_count -= 1;
                    state.pending.push_front(entry);
                    debug!(
                        destination = %self.key,
                        consumer = %slot.id,
                        "Consumer detached during dispatch"
                    );
                    self.remove_consumer(state, idx, fx);
                }
            }
        }
    }

    fn dispatch_topic(&self, state: &mut DestinationState, fx: &mut Effects) {
        let mut dead = Vec::new();
        for (idx, slot) in state.consumers.iter_mut().enumerate() {
            while slot.is_demand_ready() {
                let Some(&seq) = slot.backlog.front() else {
                    break;
                };
                let Some(resident) = state.in_flight.get(&seq) else {
                    slot.backlog.pop_front();
                    continue;
                };
                let delivery = Delivery::new(&self.key, slot.id, seq, &resident.entry.message, 1);
                if slot.tx.try_send(delivery).is_err() {
                    dead.push(idx);
                    break;
                }
                slot.backlog.pop_front();
                slot.outstanding += 1;
            }
        }
        for idx in dead.into_iter().rev() {
            self.remove_consumer(state, idx, fx);
        }
    }

    fn remove_consumer(&self, state: &mut DestinationState, idx: usize, fx: &mut Effects) {
        let id = state.consumers.remove(idx).retire();
        state.policy.on_removed(idx, state.consumers.len());
        fx.detached.push(id);

        let held: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, r)| r.holders.contains(&id))
            .map(|(seq, _)| *seq)
            .collect();

        match self.key.kind {
            DestinationKind::Queue => {
                for seq in held {
                    if let Some(resident) = state.in_flight.remove(&seq) {
                        requeue(&mut state.pending, resident.entry);
                    }
                }
            }
            DestinationKind::Topic => {
                for seq in held {
                    let Some(resident) = state.in_flight.get_mut(&seq) else {
                        continue;
                    };
                    resident.holders.retain(|h| *h != id);
                    if resident.holders.is_empty() {
                        if let Some(resident) = state.in_flight.remove(&seq) {
                            self.discard(state, &resident.entry, fx);
                        }
                    }
                }
            }
        }

        if let Some(elected) = state.policy.reelect(&state.consumers) {
            fx.elected = Some(elected);
        }
    }

    fn drop_undelivered(&self, mut doomed: impl FnMut(&Message) -> bool) -> u64 {
        let mut fx = Effects::default();
        {
            let mut state = self.state.lock();
            let state = &mut *state;

            let mut kept = VecDeque::with_capacity(state.pending.len());
            for entry in std::mem::take(&mut state.pending) {
                if doomed(&entry.message) {
                    self.discard(state, &entry, &mut fx);
                } else {
                    kept.push_back(entry);
                }
            }
            state.pending = kept;

            // Topic copies still waiting in a subscriber's backlog
            let mut orphaned = Vec::new();
            for slot in state.consumers.iter_mut() {
                let id = slot.id;
                let in_flight = &mut state.in_flight;
                slot.backlog.retain(|seq| {
                    let Some(resident) = in_flight.get_mut(seq) else {
                        return false;
                    };
                    if !doomed(&resident.entry.message) {
                        return true;
                    }
                    resident.holders.retain(|h| *h != id);
                    if resident.holders.is_empty() {
                        orphaned.push(*seq);
                    }
                    false
                });
            }
            for seq in orphaned {
                if let Some(resident) = state.in_flight.remove(&seq) {
                    self.discard(state, &resident.entry, &mut fx);
                }
            }

            self.dispatch(state, &mut fx);
        }
        let count = fx.discarded;
        self.apply(fx);
        count
    }

    fn apply(&self, fx: Effects) {
        if fx.freed > 0 {
            self.usage.release(fx.freed);
        }
        if fx.discarded > 0 {
            self.events.emit(BrokerEvent::MessagesDiscarded {
                destination: self.key.clone(),
                count: fx.discarded,
            });
        }
        for consumer in fx.detached {
            info!(destination = %self.key, consumer = %consumer, "Consumer detached");
            self.events.emit(BrokerEvent::ConsumerDetached {
                destination: self.key.clone(),
                consumer,
            });
        }
        if let Some(consumer) = fx.elected {
            info!(destination = %self.key, consumer = ?consumer, "Exclusive consumer elected");
            self.events.emit(BrokerEvent::ExclusiveConsumerElected {
                destination: self.key.clone(),
                consumer,
            });
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("key", &self.key)
            .field("config", &self.config)
            .field("usage", &self.usage)
            .finish()
    }
}

/// Put a returned message back in sequence order
fn requeue(pending: &mut VecDeque<Entry>, entry: Entry) {
    let pos = pending.partition_point(|e| e.seq < entry.seq);
    pending.insert(pos, entry);
}
