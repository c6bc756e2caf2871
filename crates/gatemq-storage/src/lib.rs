//! GateMQ Storage - Persistence collaborators for the message broker
//!
//! The broker hands persistent messages to a [`MessageStore`] when they are
//! accepted and tells it when they leave. The store never influences
//! dispatch order or flow control.
//! Currently supports:
//! - In-memory storage (default, for development/testing)

pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use traits::MessageStore;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
