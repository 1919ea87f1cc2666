//! The pending-unit queue.
//!
//! Order is decided at dequeue, not insertion: the interpreter keeps
//! bumping call counters while units wait, so the hottest iseq is only
//! known at the moment the worker asks for work.

use crate::unit::Unit;
use std::sync::Arc;

/// Queue of units waiting for compilation. All access happens under the
/// engine mutex.
#[derive(Debug, Default)]
pub(crate) struct UnitQueue {
    units: Vec<Arc<Unit>>,
}

impl UnitQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append a unit at the tail.
    pub(crate) fn enqueue(&mut self, unit: Arc<Unit>) {
        self.units.push(unit);
    }

    /// Remove and return the unit whose iseq has the greatest call
    /// count, first-seen winning ties. Tombstoned entries encountered
    /// during the scan are dropped. `None` when nothing live remains.
    pub(crate) fn dequeue_best(&mut self) -> Option<Arc<Unit>> {
        self.units.retain(|unit| !unit.is_tombstoned());

        let mut best: Option<(usize, u64)> = None;
        for (idx, unit) in self.units.iter().enumerate() {
            let calls = match unit.iseq() {
                Some(iseq) => iseq.total_calls(),
                None => continue,
            };
            match best {
                Some((_, best_calls)) if best_calls >= calls => {}
                _ => best = Some((idx, calls)),
            }
        }

        best.map(|(idx, _)| self.units.remove(idx))
    }

    /// Drop a specific unit from the queue, if present.
    pub(crate) fn remove(&mut self, unit: &Arc<Unit>) {
        self.units.retain(|queued| !Arc::ptr_eq(queued, unit));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iseq::{Iseq, IseqBuilder};
    use proptest::prelude::*;

    fn unit_with_calls(id: u64, calls: u64) -> (Arc<Iseq>, Arc<Unit>) {
        let iseq = IseqBuilder::new().build();
        for _ in 0..calls {
            iseq.record_call();
        }
        let unit = Unit::new(id, &iseq);
        (iseq, unit)
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let mut queue = UnitQueue::new();
        assert!(queue.is_empty());
        assert!(queue.dequeue_best().is_none());
    }

    #[test]
    fn hottest_unit_wins() {
        let mut queue = UnitQueue::new();
        let (_a, ua) = unit_with_calls(0, 3);
        let (_b, ub) = unit_with_calls(1, 10);
        let (_c, uc) = unit_with_calls(2, 5);
        queue.enqueue(ua);
        queue.enqueue(ub.clone());
        queue.enqueue(uc);

        let best = queue.dequeue_best().unwrap();
        assert!(Arc::ptr_eq(&best, &ub));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn ties_go_to_first_seen() {
        let mut queue = UnitQueue::new();
        let (_a, ua) = unit_with_calls(0, 4);
        let (_b, ub) = unit_with_calls(1, 4);
        queue.enqueue(ua.clone());
        queue.enqueue(ub);

        let best = queue.dequeue_best().unwrap();
        assert!(Arc::ptr_eq(&best, &ua));
    }

    #[test]
    fn tombstoned_units_are_skipped_and_dropped() {
        let mut queue = UnitQueue::new();
        let (_a, ua) = unit_with_calls(0, 100);
        let (_b, ub) = unit_with_calls(1, 1);
        ua.tombstone();
        queue.enqueue(ua);
        queue.enqueue(ub.clone());

        let best = queue.dequeue_best().unwrap();
        assert!(Arc::ptr_eq(&best, &ub));
        // The tombstoned entry was dropped during the scan.
        assert!(queue.is_empty());
    }

    #[test]
    fn all_tombstoned_yields_nothing() {
        let mut queue = UnitQueue::new();
        let (_a, ua) = unit_with_calls(0, 1);
        ua.tombstone();
        queue.enqueue(ua);
        assert!(queue.dequeue_best().is_none());
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn dequeue_returns_global_maximum(counts in proptest::collection::vec(0u64..1000, 1..20)) {
            let mut queue = UnitQueue::new();
            let mut keep = Vec::new();
            for (id, &calls) in counts.iter().enumerate() {
                let (iseq, unit) = unit_with_calls(id as u64, calls);
                keep.push(iseq);
                queue.enqueue(unit);
            }
            let best = queue.dequeue_best().unwrap();
            let max = counts.iter().copied().max().unwrap();
            prop_assert_eq!(best.iseq().unwrap().total_calls(), max);
            // First-seen tie break: no earlier entry may carry the same count.
            let idx = best.id() as usize;
            prop_assert!(counts[..idx].iter().all(|&c| c < max));
        }
    }
}
