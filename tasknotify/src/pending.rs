//! Per-segment pending set.
//!
//! Holds the waiting ranges that were not satisfiable at hand-off time.
//! The polling agent rescans the set every cycle; completed ranges are
//! removed in place and reported, the rest stay for the next cycle.
//! Iteration order is insertion order, which keeps rescans fair in the
//! weak sense of "every range is examined every cycle".
//!
//! The set stores pool handles, not objects: the pool owns the memory, the
//! set owns only membership.

use fixedpool::{FixedPool, Handle};

use crate::substrate::Substrate;
use crate::waiting_range::WaitingRange;

pub(crate) struct PendingSet {
    entries: Vec<Handle>,
    /// Swap space reused across rescans so steady state never allocates.
    scratch: Vec<Handle>,
}

impl PendingSet {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub(crate) fn insert(&mut self, handle: Handle) {
        self.entries.push(handle);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Re-test every held range in insertion order. Ranges that resolve are
    /// appended to `completed`; the remainder keeps its order.
    pub(crate) fn rescan<S: Substrate + ?Sized>(
        &mut self,
        pool: &FixedPool<WaitingRange>,
        substrate: &S,
        completed: &mut Vec<Handle>,
    ) {
        if self.entries.is_empty() {
            return;
        }

        std::mem::swap(&mut self.entries, &mut self.scratch);
        for mut handle in self.scratch.drain(..) {
            if pool.get_mut(&mut handle).try_complete(substrate) {
                completed.push(handle);
            } else {
                self.entries.push(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::CounterHandle;
    use crate::test_utils::FakeSubstrate;

    fn make_range(segment: u16, first: u32, count: u32) -> WaitingRange {
        WaitingRange::new(
            segment,
            first,
            count,
            std::ptr::null_mut(),
            CounterHandle::from_raw(1),
        )
    }

    #[test]
    fn test_rescan_removes_completed_keeps_order() {
        let substrate = FakeSubstrate::new(1, 1, 64);
        let pool: FixedPool<WaitingRange> = FixedPool::new(8);
        let mut set = PendingSet::new();

        set.insert(pool.allocate(make_range(0, 0, 1)));
        set.insert(pool.allocate(make_range(0, 1, 1)));
        set.insert(pool.allocate(make_range(0, 2, 1)));
        assert_eq!(set.len(), 3);

        // Only the middle range's notification arrives.
        substrate.post_notification(0, 1, 9);

        let mut completed = Vec::new();
        set.rescan(&pool, &substrate, &mut completed);
        assert_eq!(completed.len(), 1);
        assert_eq!(set.len(), 2);

        for h in completed.drain(..) {
            pool.free(h);
        }

        // The rest completes, still scanned in insertion order.
        substrate.post_notification(0, 0, 9);
        substrate.post_notification(0, 2, 9);
        set.rescan(&pool, &substrate, &mut completed);
        assert_eq!(completed.len(), 2);
        assert!(set.is_empty());

        for h in completed {
            pool.free(h);
        }
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn test_rescan_empty_is_noop() {
        let substrate = FakeSubstrate::new(1, 1, 64);
        let pool: FixedPool<WaitingRange> = FixedPool::new(2);
        let mut set = PendingSet::new();
        let mut completed = Vec::new();
        set.rescan(&pool, &substrate, &mut completed);
        assert!(completed.is_empty());
    }
}
