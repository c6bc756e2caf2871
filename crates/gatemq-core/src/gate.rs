//! Flow-control gate
//!
//! Every producer send passes here before it reaches a destination. The
//! gate checks, in order:
//!
//! 1. reject-on-full: the destination quota, failing immediately if full;
//! 2. the connection's send lane (only without a producer window);
//! 3. the connection's producer window;
//! 4. the destination quota, waiting for space.
//!
//! Suspended sends are woken by the release that makes room for them,
//! oldest first, and are aborted when their connection closes.

use std::future::Future;
use std::sync::Arc;

use gatemq_types::{ConnectionId, DestinationKey, Error, Result};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::budget::Budget;
use crate::connection::ConnectionState;
use crate::credit::CreditWindow;
use crate::destination::Destination;
use crate::events::{BlockReason, BrokerEvent, EventBus};

/// Outcome of a non-suspending pass through the gate
#[derive(Debug)]
pub enum GateDecision {
    Allowed(Admission),
    Blocked(BlockReason),
    Rejected,
}

/// Permission to enqueue one message.
///
/// Holds the quota reservation, the producer credit and, for unwindowed
/// connections, the send lane. Dropping it gives everything back;
/// [`commit`](Self::commit) hands the quota over to the enqueued message.
#[derive(Debug)]
pub struct Admission {
    bytes: u64,
    connection: ConnectionId,
    /// The budget actually charged; destination names can be reused after
    /// a delete, so the quota is not looked up again by key
    quota: Option<Arc<Budget>>,
    credit: Option<Arc<CreditWindow>>,
    lane: Option<OwnedMutexGuard<()>>,
    blocked: bool,
}

impl Admission {
    fn new(connection: ConnectionId, bytes: u64) -> Self {
        Self {
            bytes,
            connection,
            quota: None,
            credit: None,
            lane: None,
            blocked: false,
        }
    }

    /// Whether the send had to wait at any point
    pub fn was_blocked(&self) -> bool {
        self.blocked
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// The message is enqueued: it now owns the quota bytes, and the
    /// broker acknowledges the send by returning the producer credit.
    pub fn commit(mut self) {
        self.quota = None;
        if let Some(credits) = self.credit.take() {
            credits.replenish(self.connection, self.bytes);
        }
        self.lane = None;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(quota) = self.quota.take() {
            quota.release(self.bytes);
        }
        if let Some(credits) = self.credit.take() {
            credits.replenish(self.connection, self.bytes);
        }
    }
}

/// Gate in front of every destination
#[derive(Debug, Clone)]
pub struct FlowControlGate {
    events: EventBus,
    credits: Arc<CreditWindow>,
}

impl FlowControlGate {
    pub fn new(events: EventBus, credits: Arc<CreditWindow>) -> Self {
        Self { events, credits }
    }

    /// Evaluate a send without suspending. On `Allowed` the caller holds
    /// everything it needs to enqueue.
    pub fn try_send(
        &self,
        connection: &ConnectionState,
        destination: &Destination,
        bytes: u64,
        reject_on_full: bool,
    ) -> GateDecision {
        let quota = destination.usage();
        let mut admission = Admission::new(connection.id(), bytes);

        if reject_on_full {
            if !quota.try_acquire(bytes) {
                self.reject(connection.id(), destination.key());
                return GateDecision::Rejected;
            }
            admission.quota = Some(quota.clone());
        }

        if !connection.is_windowed() {
            match connection.lane().clone().try_lock_owned() {
                Ok(guard) => admission.lane = Some(guard),
                Err(_) => return GateDecision::Blocked(BlockReason::SendLane),
            }
        }

        if !self.credits.try_consume(connection.id(), bytes) {
            return GateDecision::Blocked(BlockReason::Credit);
        }
        admission.credit = Some(self.credits.clone());

        if admission.quota.is_none() {
            if !quota.try_acquire(bytes) {
                return GateDecision::Blocked(BlockReason::Quota);
            }
            admission.quota = Some(quota.clone());
        }

        GateDecision::Allowed(admission)
    }

    /// Pass the gate, suspending as long as necessary.
    ///
    /// Fails with `ResourceExhausted` under reject-on-full, and with
    /// `ConnectionClosed` if the connection closes while suspended.
    pub async fn admit(
        &self,
        connection: &ConnectionState,
        destination: &Destination,
        bytes: u64,
        reject_on_full: bool,
    ) -> Result<Admission> {
        let quota = destination.usage();
        let mut admission = Admission::new(connection.id(), bytes);

        if connection.is_closed() {
            return Err(Error::ConnectionClosed(connection.id()));
        }

        if reject_on_full {
            if !quota.try_acquire(bytes) {
                self.reject(connection.id(), destination.key());
                return Err(Error::ResourceExhausted {
                    connection: connection.id(),
                    destination: destination.key().to_string(),
                });
            }
            admission.quota = Some(quota.clone());
        }

        if !connection.is_windowed() {
            let lane = connection.lane().clone();
            let guard = match lane.clone().try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    self.blocked(&mut admission, connection, destination, BlockReason::SendLane);
                    suspend(connection, lane.lock_owned()).await?
                }
            };
            admission.lane = Some(guard);
        }

        if !self.credits.try_consume(connection.id(), bytes) {
            self.blocked(&mut admission, connection, destination, BlockReason::Credit);
            suspend(connection, self.credits.consume(connection.id(), bytes)).await?;
        }
        admission.credit = Some(self.credits.clone());

        if admission.quota.is_none() {
            if !quota.try_acquire(bytes) {
                self.blocked(&mut admission, connection, destination, BlockReason::Quota);
                suspend(connection, quota.acquire(bytes)).await?;
            }
            admission.quota = Some(quota.clone());
        }

        if admission.blocked {
            debug!(
                connection = %connection.id(),
                destination = %destination.key(),
                "Producer resumed"
            );
            self.events.emit(BrokerEvent::ProducerResumed {
                connection: connection.id(),
                destination: destination.key().clone(),
            });
        }

        Ok(admission)
    }

    fn blocked(
        &self,
        admission: &mut Admission,
        connection: &ConnectionState,
        destination: &Destination,
        reason: BlockReason,
    ) {
        admission.blocked = true;
        debug!(
            connection = %connection.id(),
            destination = %destination.key(),
            reason = ?reason,
            "Producer blocked"
        );
        self.events.emit(BrokerEvent::ProducerBlocked {
            connection: connection.id(),
            destination: destination.key().clone(),
            reason,
        });
    }

    fn reject(&self, connection: ConnectionId, destination: &DestinationKey) {
        warn!(
            connection = %connection,
            destination = %destination,
            "Send rejected, destination over quota"
        );
        self.events.emit(BrokerEvent::ResourceException {
            connection,
            destination: destination.clone(),
        });
    }
}

/// Await `fut` unless the connection closes first
async fn suspend<F: Future>(connection: &ConnectionState, fut: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = connection.closed() => {
            debug!(connection = %connection.id(), "Suspended send aborted by close");
            Err(Error::ConnectionClosed(connection.id()))
        }
        output = fut => Ok(output),
    }
}
