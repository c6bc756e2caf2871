//! GateMQ Core - dispatch and flow control for the message broker
//!
//! This crate contains:
//! - Broker: registry of destinations and connections, send path
//! - FlowControlGate: producer admission against credit windows and quotas
//! - Destination: message buffer with queue or topic dispatch
//! - Consumer: subscription handle with prefetch and acknowledgment

pub mod broker;
pub mod budget;
pub mod connection;
pub mod consumer;
pub mod credit;
pub mod destination;
pub mod dispatch;
pub mod events;
pub mod gate;
pub mod journal;
pub mod usage;

// Re-exports
pub use broker::{Broker, SendOutcome, TrySend};
pub use budget::Budget;
pub use connection::{Connection, ConnectionState};
pub use consumer::{Consumer, Delivery, Inbox};
pub use credit::CreditWindow;
pub use destination::Destination;
pub use dispatch::{DispatchPolicy, DispatchTarget};
pub use events::{BlockReason, BrokerEvent, BrokerListener, EventBus};
pub use gate::{Admission, FlowControlGate, GateDecision};
pub use journal::Journal;
pub use usage::ResourceUsageTracker;
