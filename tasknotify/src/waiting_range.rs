//! Waiting ranges: the unit of deferred notification tracking.
//!
//! A [`WaitingRange`] records one outstanding "wait until ids
//! `[first, first + count)` on segment S are all notified" obligation,
//! together with where to store the notified values and which task event
//! counter to release on completion. Ranges are plain data; all progress is
//! made by the polling agent calling [`WaitingRange::try_complete`], and a
//! range is mutated by exactly one thread at a time (the registering thread
//! before hand-off, the polling agent after).

use crate::substrate::{
    NotificationId, NotificationValue, Operation, QueueId, SegmentId, Substrate, SubstrateError,
};
use crate::tasking::CounterHandle;
use crate::error::fatal;

/// What happens when a range fully resolves.
///
/// A closed set: either the owning task's event counter is decremented
/// directly, or a stored continuation submits a deferred operation whose own
/// completion carries the token onward.
#[derive(Debug)]
pub(crate) enum Completion {
    /// Decrement the task counter by one.
    Plain,
    /// Submit the deferred operation tagged with the originating counter;
    /// its completion-queue entry performs the decrement, so retiring the
    /// range itself does not.
    Ack(AckAction),
}

/// Deferred operation fired once an acknowledgement range resolves.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AckAction {
    pub(crate) op: Operation,
    pub(crate) queue: QueueId,
}

/// One outstanding wait for a contiguous notification-id range.
pub(crate) struct WaitingRange {
    segment: SegmentId,
    first_id: NotificationId,
    num_ids: u32,
    /// Destination for notified values, indexed by `id - first_id`; null
    /// means the caller discards the values.
    values: *mut NotificationValue,
    /// Ids in the range still unnotified. Monotonically non-increasing.
    remaining: u32,
    counter: CounterHandle,
    completion: Completion,
}

// Safety: `values` points into caller-owned memory that the caller keeps
// alive and untouched until the wait resolves (the task cannot proceed
// before its counter drains). After hand-off exactly one thread at a time
// accesses the range.
unsafe impl Send for WaitingRange {}

impl WaitingRange {
    /// Create a plain waiting range. `values` may be null to discard.
    pub(crate) fn new(
        segment: SegmentId,
        first_id: NotificationId,
        num_ids: u32,
        values: *mut NotificationValue,
        counter: CounterHandle,
    ) -> Self {
        Self {
            segment,
            first_id,
            num_ids,
            values,
            remaining: num_ids,
            counter,
            completion: Completion::Plain,
        }
    }

    /// Create an acknowledgement range carrying a deferred operation.
    pub(crate) fn new_ack(
        segment: SegmentId,
        first_id: NotificationId,
        num_ids: u32,
        values: *mut NotificationValue,
        counter: CounterHandle,
        action: AckAction,
    ) -> Self {
        Self {
            segment,
            first_id,
            num_ids,
            values,
            remaining: num_ids,
            counter,
            completion: Completion::Ack(action),
        }
    }

    #[inline]
    pub(crate) fn counter(&self) -> CounterHandle {
        self.counter
    }

    #[inline]
    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }

    #[inline]
    pub(crate) fn is_satisfied(&self) -> bool {
        self.remaining == 0
    }

    /// Consume every id in the range that is ready right now.
    ///
    /// Each round probes for one ready id, resets it (a consuming read) and
    /// records the value at its slot offset. A reset that reports zero means
    /// the id was not actually notified; the scan ends for this cycle rather
    /// than retrying, which bounds per-tick work. Returns `true` exactly
    /// when `remaining` reaches zero.
    pub(crate) fn try_complete<S: Substrate + ?Sized>(&mut self, substrate: &S) -> bool {
        while self.remaining > 0 {
            let id = match substrate.probe_any(self.segment, self.first_id, self.num_ids) {
                Ok(Some(id)) => id,
                Ok(None) | Err(SubstrateError::Gone) => return false,
                Err(SubstrateError::Failed(e)) => fatal("notification probe", &e),
            };
            debug_assert!(id >= self.first_id && id < self.first_id + self.num_ids);

            let value = match substrate.reset_notification(self.segment, id) {
                Ok(value) => value,
                Err(SubstrateError::Gone) => return false,
                Err(SubstrateError::Failed(e)) => fatal("notification reset", &e),
            };
            if value == 0 {
                // Raced with a concurrent reset; nothing was consumed.
                return false;
            }

            if !self.values.is_null() {
                unsafe {
                    *self.values.add((id - self.first_id) as usize) = value;
                }
            }
            self.remaining -= 1;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemoryLocation;
    use crate::test_utils::FakeSubstrate;

    #[test]
    fn test_single_slot_completes_on_notify() {
        let substrate = FakeSubstrate::new(4, 4, 64);
        let mut value: NotificationValue = 0;
        let mut range = WaitingRange::new(1, 3, 1, &mut value, CounterHandle::from_raw(7));

        assert!(!range.try_complete(&substrate));
        substrate.post_notification(1, 3, 99);
        assert!(range.try_complete(&substrate));
        assert!(range.is_satisfied());
        assert_eq!(value, 99);
    }

    #[test]
    fn test_multi_slot_partial_then_complete() {
        let substrate = FakeSubstrate::new(4, 4, 64);
        let mut values = [0u32; 3];
        let mut range =
            WaitingRange::new(0, 10, 3, values.as_mut_ptr(), CounterHandle::from_raw(1));

        substrate.post_notification(0, 11, 7);
        assert!(!range.try_complete(&substrate));

        substrate.post_notification(0, 10, 5);
        substrate.post_notification(0, 12, 5);
        assert!(range.try_complete(&substrate));
        assert_eq!(values, [5, 7, 5]);
    }

    #[test]
    fn test_values_map_to_slot_offsets_any_order() {
        let substrate = FakeSubstrate::new(2, 2, 64);
        let mut values = [0u32; 4];
        let mut range =
            WaitingRange::new(1, 20, 4, values.as_mut_ptr(), CounterHandle::from_raw(1));

        for id in [23u32, 20, 22, 21] {
            substrate.post_notification(1, id, 100 + id);
        }
        assert!(range.try_complete(&substrate));
        assert_eq!(values, [120, 121, 122, 123]);
    }

    #[test]
    fn test_discard_values() {
        let substrate = FakeSubstrate::new(2, 2, 64);
        let mut range =
            WaitingRange::new(0, 0, 2, std::ptr::null_mut(), CounterHandle::from_raw(1));

        substrate.post_notification(0, 0, 1);
        substrate.post_notification(0, 1, 1);
        assert!(range.try_complete(&substrate));
    }

    #[test]
    fn test_reset_is_consuming() {
        let substrate = FakeSubstrate::new(2, 2, 64);
        substrate.post_notification(0, 5, 42);

        let mut first: NotificationValue = 0;
        let mut range = WaitingRange::new(0, 5, 1, &mut first, CounterHandle::from_raw(1));
        assert!(range.try_complete(&substrate));
        assert_eq!(first, 42);

        // The same slot with no new notification reads as not ready.
        let mut second: NotificationValue = 0;
        let mut again = WaitingRange::new(0, 5, 1, &mut second, CounterHandle::from_raw(1));
        assert!(!again.try_complete(&substrate));
        assert_eq!(second, 0);
    }

    #[test]
    fn test_missing_segment_is_not_fatal() {
        let substrate = FakeSubstrate::new(1, 1, 64);
        let mut range =
            WaitingRange::new(9, 0, 1, std::ptr::null_mut(), CounterHandle::from_raw(1));
        assert!(!range.try_complete(&substrate));
    }

    #[test]
    fn test_ack_action_stored() {
        let action = AckAction {
            op: Operation::Write {
                local: MemoryLocation::new(0, 0),
                rank: 1,
                remote: MemoryLocation::new(1, 64),
                size: 128,
            },
            queue: 2,
        };
        let range = WaitingRange::new_ack(
            0,
            0,
            2,
            std::ptr::null_mut(),
            CounterHandle::from_raw(3),
            action,
        );
        match range.completion() {
            Completion::Ack(stored) => assert_eq!(stored.queue, 2),
            Completion::Plain => panic!("expected ack completion"),
        }
    }
}
