//! Producer credit windows
//!
//! Each connection may negotiate a producer window: the number of bytes it
//! may have in the gate at once. Credit is taken when a send enters the gate
//! and handed back once the broker has accepted (or abandoned) that send.
//! Connections without a window are never held up here.

use std::sync::Arc;

use dashmap::DashMap;
use gatemq_types::ConnectionId;
use tracing::debug;

use crate::budget::Budget;

/// Per-connection credit ledger
#[derive(Debug, Default)]
pub struct CreditWindow {
    connections: DashMap<ConnectionId, Arc<Budget>>,
}

impl CreditWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection with the given window (`None` = unbounded)
    pub fn open(&self, connection: ConnectionId, window: Option<u64>) -> Arc<Budget> {
        debug!(connection = %connection, window = ?window, "Opening producer window");
        let budget = Arc::new(Budget::new(window));
        self.connections.insert(connection, budget.clone());
        budget
    }

    pub fn close(&self, connection: ConnectionId) {
        self.connections.remove(&connection);
    }

    pub fn budget(&self, connection: ConnectionId) -> Option<Arc<Budget>> {
        self.connections.get(&connection).map(|b| b.clone())
    }

    /// Consume credit if `outstanding + bytes` stays within the window.
    pub fn try_consume(&self, connection: ConnectionId, bytes: u64) -> bool {
        match self.connections.get(&connection) {
            Some(budget) => budget.try_acquire(bytes),
            None => true,
        }
    }

    /// Consume credit, waiting for replenishment if the window is spent
    pub async fn consume(&self, connection: ConnectionId, bytes: u64) {
        if let Some(budget) = self.budget(connection) {
            budget.acquire(bytes).await;
        }
    }

    /// Give credit back, never below zero.
    pub fn replenish(&self, connection: ConnectionId, bytes: u64) -> u64 {
        self.connections
            .get(&connection)
            .map(|budget| budget.release(bytes))
            .unwrap_or(0)
    }

    pub fn outstanding(&self, connection: ConnectionId) -> u64 {
        self.connections
            .get(&connection)
            .map(|budget| budget.used())
            .unwrap_or(0)
    }

    pub fn window(&self, connection: ConnectionId) -> Option<u64> {
        self.connections
            .get(&connection)
            .and_then(|budget| budget.limit())
    }
}
