//! Dispatch policies
//!
//! A policy only decides *which* attached consumer gets the next message.
//! Buffering, acknowledgment and redelivery belong to the destination.

use gatemq_types::ConsumerId;

/// What a policy needs to know about an attached consumer.
///
/// Slices handed to a policy are always in attachment order.
pub trait DispatchTarget {
    fn consumer_id(&self) -> ConsumerId;

    /// Has prefetch capacity for one more delivery
    fn is_demand_ready(&self) -> bool;

    /// Subscribed through an exclusive-tagged reference
    fn is_exclusive(&self) -> bool;
}

/// Consumer selection for a queue.
///
/// Starts as `RoundRobin` unless the destination is created exclusive. The
/// only transition is `RoundRobin` to `Exclusive`, and it happens at most once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchPolicy {
    /// Rotate over demand-ready consumers in attachment order
    RoundRobin { next: usize },
    /// Everything goes to the active consumer
    Exclusive { active: Option<ConsumerId> },
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy::RoundRobin { next: 0 }
    }
}

impl DispatchPolicy {
    pub fn exclusive() -> Self {
        DispatchPolicy::Exclusive { active: None }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, DispatchPolicy::Exclusive { .. })
    }

    pub fn active(&self) -> Option<ConsumerId> {
        match self {
            DispatchPolicy::Exclusive { active } => *active,
            DispatchPolicy::RoundRobin { .. } => None,
        }
    }

    /// Switch to exclusive dispatch. Returns false if already exclusive.
    pub fn make_exclusive<T: DispatchTarget>(&mut self, consumers: &[T]) -> bool {
        if self.is_exclusive() {
            return false;
        }
        *self = DispatchPolicy::Exclusive {
            active: elect(consumers),
        };
        true
    }

    /// Pick the consumer for the next message, advancing rotation state.
    ///
    /// Returns an index into `consumers`, or `None` if nobody may take a
    /// message right now. An exclusive destination whose active consumer is
    /// saturated returns `None` even when others are idle.
    pub fn select<T: DispatchTarget>(&mut self, consumers: &[T]) -> Option<usize> {
        match self {
            DispatchPolicy::RoundRobin { next } => {
                let len = consumers.len();
                if len == 0 {
                    return None;
                }
                let start = *next % len;
                for offset in 0..len {
                    let idx = (start + offset) % len;
                    if consumers[idx].is_demand_ready() {
                        *next = (idx + 1) % len;
                        return Some(idx);
                    }
                }
                None
            }
            DispatchPolicy::Exclusive { active } => {
                let active = (*active)?;
                consumers
                    .iter()
                    .position(|c| c.consumer_id() == active)
                    .filter(|&idx| consumers[idx].is_demand_ready())
            }
        }
    }

    /// Recompute the active consumer after the consumer set changed.
    ///
    /// Returns the new active consumer if it differs from the previous one.
    pub fn reelect<T: DispatchTarget>(&mut self, consumers: &[T]) -> Option<Option<ConsumerId>> {
        match self {
            DispatchPolicy::Exclusive { active } => {
                let elected = elect(consumers);
                if elected != *active {
                    *active = elected;
                    Some(elected)
                } else {
                    None
                }
            }
            DispatchPolicy::RoundRobin { .. } => None,
        }
    }

    /// Elect an active consumer only if there is none. A newcomer never
    /// takes over from an active consumer; that needs a detach.
    pub fn fill_vacancy<T: DispatchTarget>(&mut self, consumers: &[T]) -> Option<ConsumerId> {
        match self {
            DispatchPolicy::Exclusive { active } if active.is_none() => {
                *active = elect(consumers);
                *active
            }
            _ => None,
        }
    }

    /// Keep the rotation index pointing at the same successor after the
    /// consumer at `removed` left. `remaining` is the new consumer count.
    pub fn on_removed(&mut self, removed: usize, remaining: usize) {
        if let DispatchPolicy::RoundRobin { next } = self {
            if removed < *next {
                *next -= 1;
            }
            if *next >= remaining {
                *next = 0;
            }
        }
    }
}

/// Earliest-attached exclusive-tagged consumer, else earliest-attached.
fn elect<T: DispatchTarget>(consumers: &[T]) -> Option<ConsumerId> {
    consumers
        .iter()
        .find(|c| c.is_exclusive())
        .or_else(|| consumers.first())
        .map(|c| c.consumer_id())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slot {
        id: u64,
        ready: bool,
        exclusive: bool,
    }

    impl DispatchTarget for Slot {
        fn consumer_id(&self) -> ConsumerId {
            ConsumerId(self.id)
        }
        fn is_demand_ready(&self) -> bool {
            self.ready
        }
        fn is_exclusive(&self) -> bool {
            self.exclusive
        }
    }

    fn slots(n: u64) -> Vec<Slot> {
        (1..=n)
            .map(|id| Slot {
                id,
                ready: true,
                exclusive: false,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_rotates_in_attachment_order() {
        let consumers = slots(3);
        let mut policy = DispatchPolicy::default();

        let picks: Vec<usize> = (0..7)
            .map(|_| policy.select(&consumers).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_round_robin_skips_saturated_consumers() {
        let mut consumers = slots(3);
        consumers[1].ready = false;
        let mut policy = DispatchPolicy::default();

        assert_eq!(policy.select(&consumers), Some(0));
        assert_eq!(policy.select(&consumers), Some(2));
        assert_eq!(policy.select(&consumers), Some(0));

        for c in consumers.iter_mut() {
            c.ready = false;
        }
        assert_eq!(policy.select(&consumers), None);
    }

    #[test]
    fn test_round_robin_index_survives_removal() {
        let mut consumers = slots(3);
        let mut policy = DispatchPolicy::default();

        assert_eq!(policy.select(&consumers), Some(0));
        assert_eq!(policy.select(&consumers), Some(1));

        // Consumer 1 (index 0) leaves; consumer 3 is still next in line
        consumers.remove(0);
        policy.on_removed(0, consumers.len());
        assert_eq!(consumers[policy.select(&consumers).unwrap()].id, 3);
        assert_eq!(consumers[policy.select(&consumers).unwrap()].id, 2);
    }

    #[test]
    fn test_exclusive_first_attached_wins() {
        let consumers = slots(2);
        let mut policy = DispatchPolicy::exclusive();
        policy.reelect(&consumers);

        for _ in 0..3 {
            assert_eq!(policy.select(&consumers), Some(0));
        }
    }

    #[test]
    fn test_exclusive_has_no_idle_fallback() {
        let mut consumers = slots(2);
        let mut policy = DispatchPolicy::exclusive();
        policy.reelect(&consumers);

        consumers[0].ready = false;
        assert_eq!(policy.select(&consumers), None);
    }

    #[test]
    fn test_exclusive_reelects_next_attached() {
        let mut consumers = slots(3);
        let mut policy = DispatchPolicy::exclusive();
        assert_eq!(policy.reelect(&consumers), Some(Some(ConsumerId(1))));

        consumers.remove(0);
        assert_eq!(policy.reelect(&consumers), Some(Some(ConsumerId(2))));

        // Unchanged set, no new election
        assert_eq!(policy.reelect(&consumers), None);

        consumers.clear();
        assert_eq!(policy.reelect(&consumers), Some(None));
        assert_eq!(policy.select(&consumers), None);
    }

    #[test]
    fn test_tagged_newcomer_waits_for_vacancy() {
        let mut consumers = slots(1);
        let mut policy = DispatchPolicy::exclusive();
        assert_eq!(policy.fill_vacancy(&consumers), Some(ConsumerId(1)));

        consumers.push(Slot {
            id: 2,
            ready: true,
            exclusive: true,
        });
        assert_eq!(policy.fill_vacancy(&consumers), None);
        assert_eq!(policy.active(), Some(ConsumerId(1)));

        consumers.remove(0);
        assert_eq!(policy.reelect(&consumers), Some(Some(ConsumerId(2))));
        assert_eq!(DispatchPolicy::default().fill_vacancy(&consumers), None);
    }

    #[test]
    fn test_exclusive_tag_takes_precedence() {
        let mut consumers = slots(2);
        consumers[1].exclusive = true;
        let mut policy = DispatchPolicy::default();

        assert!(policy.make_exclusive(&consumers));
        assert!(!policy.make_exclusive(&consumers));
        assert_eq!(policy.active(), Some(ConsumerId(2)));
        assert_eq!(policy.select(&consumers), Some(1));
    }
}
