//! Fair byte budget
//!
//! Shared mechanism behind destination quotas and producer windows. Bytes
//! are acquired up front and released later; an acquirer that does not fit
//! parks in a FIFO queue and is handed its bytes directly by `release`, so
//! the longest waiter is always served first and nobody polls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

struct Waiter {
    id: u64,
    bytes: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct BudgetState {
    used: u64,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

/// A byte budget with an optional limit.
pub struct Budget {
    limit: Option<u64>,
    state: Mutex<BudgetState>,
    /// Process-wide counter this budget contributes to
    total: Option<Arc<AtomicU64>>,
}

impl Budget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            state: Mutex::new(BudgetState::default()),
            total: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    /// Also account every acquired byte in `total`
    pub fn with_total(mut self, total: Arc<AtomicU64>) -> Self {
        self.total = Some(total);
        self
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.state.lock().used
    }

    /// Number of parked acquirers
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether the budget is at or beyond its limit
    pub fn is_full(&self) -> bool {
        match self.limit {
            Some(limit) => self.state.lock().used >= limit,
            None => false,
        }
    }

    /// `used + bytes <= limit`, relaxed in one case: a request larger than
    /// the whole limit is granted when nothing is in use, since it could
    /// never pass otherwise. Usage may then exceed the limit until it is
    /// released, and nothing else fits meanwhile.
    fn fits(&self, used: u64, bytes: u64) -> bool {
        match self.limit {
            None => true,
            Some(limit) => used == 0 || used.saturating_add(bytes) <= limit,
        }
    }

    fn charge(&self, state: &mut BudgetState, bytes: u64) {
        state.used += bytes;
        if let Some(total) = &self.total {
            total.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn discharge(&self, state: &mut BudgetState, bytes: u64) -> u64 {
        let freed = bytes.min(state.used);
        state.used -= freed;
        if let Some(total) = &self.total {
            total.fetch_sub(freed, Ordering::Relaxed);
        }
        freed
    }

    /// Hand bytes to parked acquirers, oldest first, until the head no
    /// longer fits.
    fn grant_waiters(&self, state: &mut BudgetState) {
        while let Some(front) = state.waiters.front() {
            if !self.fits(state.used, front.bytes) {
                break;
            }
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            self.charge(state, waiter.bytes);
            if waiter.grant.send(()).is_err() {
                self.discharge(state, waiter.bytes);
            }
        }
    }

    /// Take `bytes` if they fit and nobody is queued ahead. No side effect
    /// on failure.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        if !state.waiters.is_empty() || !self.fits(state.used, bytes) {
            return false;
        }
        self.charge(&mut state, bytes);
        true
    }

    /// Take `bytes`, waiting in line if necessary.
    ///
    /// Cancel-safe: dropping the future gives up the place in line, or
    /// returns the bytes if they were granted in the meantime.
    pub async fn acquire(&self, bytes: u64) {
        let (id, grant) = {
            let mut state = self.state.lock();
            if state.waiters.is_empty() && self.fits(state.used, bytes) {
                self.charge(&mut state, bytes);
                return;
            }
            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                bytes,
                grant: tx,
            });
            (id, rx)
        };

        let mut guard = WaitGuard {
            budget: self,
            id,
            bytes,
            granted: false,
        };
        // The sender is only dropped after a successful grant or by the guard
        let _ = grant.await;
        guard.granted = true;
    }

    /// Return bytes, never below zero, and wake whoever now fits.
    /// Returns the number of bytes actually freed.
    pub fn release(&self, bytes: u64) -> u64 {
        let mut state = self.state.lock();
        let freed = self.discharge(&mut state, bytes);
        self.grant_waiters(&mut state);
        freed
    }
}

impl std::fmt::Debug for Budget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Budget")
            .field("limit", &self.limit)
            .field("used", &state.used)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

struct WaitGuard<'a> {
    budget: &'a Budget,
    id: u64,
    bytes: u64,
    granted: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        let mut state = self.budget.state.lock();
        match state.waiters.iter().position(|w| w.id == self.id) {
            Some(pos) => {
                state.waiters.remove(pos);
            }
            None => {
                // Granted, but the acquirer went away before noticing
                self.budget.discharge(&mut state, self.bytes);
            }
        }
        // A removed head may have been holding up smaller requests
        self.budget.grant_waiters(&mut state);
    }
}
