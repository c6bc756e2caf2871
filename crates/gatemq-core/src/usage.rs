//! Resource usage tracking
//!
//! Bytes resident per destination, checked against the destination's
//! memory quota, plus a process-wide total. A message is charged when it
//! passes the flow-control gate and discharged when it is acknowledged,
//! expires or is purged.
//!
//! The gate and the destination charge and discharge through the budget
//! handle returned by [`ResourceUsageTracker::register`]: a name can be
//! registered again after a delete, and bytes must go back to the budget
//! they were taken from. The keyed operations serve callers that only know
//! the name and always act on the current registration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use gatemq_types::DestinationKey;
use tracing::debug;

use crate::budget::Budget;

/// Per-destination quota ledger
#[derive(Debug, Default)]
pub struct ResourceUsageTracker {
    destinations: DashMap<DestinationKey, Arc<Budget>>,
    total: Arc<AtomicU64>,
}

impl ResourceUsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a destination. Returns the existing budget if the
    /// destination is already tracked.
    pub fn register(&self, key: &DestinationKey, quota: Option<u64>) -> Arc<Budget> {
        self.destinations
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(destination = %key, quota = ?quota, "Tracking destination usage");
                Arc::new(Budget::new(quota).with_total(self.total.clone()))
            })
            .clone()
    }

    /// Stop tracking a destination; its remaining usage is discharged.
    pub fn unregister(&self, key: &DestinationKey) {
        if let Some((_, budget)) = self.destinations.remove(key) {
            budget.release(u64::MAX);
        }
    }

    pub fn budget(&self, key: &DestinationKey) -> Option<Arc<Budget>> {
        self.destinations.get(key).map(|b| b.clone())
    }

    /// Charge `bytes` if usage stays within quota (an oversized message is
    /// let into an empty destination, see [`Budget`]). Untracked
    /// destinations have no quota.
    pub fn reserve(&self, key: &DestinationKey, bytes: u64) -> bool {
        match self.destinations.get(key) {
            Some(budget) => budget.try_acquire(bytes),
            None => true,
        }
    }

    /// Charge `bytes`, waiting behind earlier producers until a release
    /// makes room. Dropping the future gives up the place in line.
    pub async fn reserve_wait(&self, key: &DestinationKey, bytes: u64) {
        if let Some(budget) = self.budget(key) {
            budget.acquire(bytes).await;
        }
    }

    /// Discharge `bytes`, never below zero, and wake blocked producers.
    pub fn release(&self, key: &DestinationKey, bytes: u64) -> u64 {
        self.destinations
            .get(key)
            .map(|budget| budget.release(bytes))
            .unwrap_or(0)
    }

    pub fn is_over_quota(&self, key: &DestinationKey) -> bool {
        self.destinations
            .get(key)
            .map(|budget| budget.is_full())
            .unwrap_or(false)
    }

    pub fn usage(&self, key: &DestinationKey) -> u64 {
        self.destinations
            .get(key)
            .map(|budget| budget.used())
            .unwrap_or(0)
    }

    /// Producers parked on this destination's quota
    pub fn waiting(&self, key: &DestinationKey) -> usize {
        self.destinations
            .get(key)
            .map(|budget| budget.waiting())
            .unwrap_or(0)
    }

    /// Bytes resident across all destinations
    pub fn total_usage(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
