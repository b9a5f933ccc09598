//! Task-aware operation layer.
//!
//! Every method here couples a substrate call with the event-counter
//! bookkeeping that keeps the calling task alive until the operation's
//! asynchronous effects resolve:
//!
//! - plain transfers increase the current task's counter by the number of
//!   completion-queue entries the submission will produce, tag the
//!   submission with the counter, and roll the increase back if the submit
//!   itself fails synchronously;
//! - waits consume already-ready notifications on the caller's thread and
//!   only allocate and hand off a waiting range for the remainder;
//! - acknowledged transfers chain a deferred submission onto a wait.

use crate::env::Environment;
use crate::error::{Error, Result};
use crate::queue_group::{GroupPolicy, QueueGroupId};
use crate::substrate::{
    MemoryLocation, NotificationId, NotificationUpdate, NotificationValue, OpKind, Operation,
    QueueId, Rank, SegmentId, Substrate, SubstrateError, TransferEntry,
};
use crate::tasking::TaskingRuntime;
use crate::waiting_range::{AckAction, WaitingRange};

/// Outcome of registering a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every id in the range was already notified; values (if requested)
    /// are filled in and no asynchronous state exists.
    Satisfied,
    /// The wait was handed off; the task's event counter was increased by
    /// one and will be decreased when the range resolves.
    Deferred,
}

impl<S: Substrate, R: TaskingRuntime> Environment<S, R> {
    // ------------------------------------------------------------------
    // Plain one-sided transfers
    // ------------------------------------------------------------------

    /// Asynchronous write of local memory to a remote segment.
    pub fn write(
        &self,
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        queue: QueueId,
    ) -> Result<()> {
        self.submit_tracked(
            Operation::Write {
                local,
                rank,
                remote,
                size,
            },
            queue,
        )
    }

    /// Asynchronous read of a remote segment into local memory.
    pub fn read(
        &self,
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        queue: QueueId,
    ) -> Result<()> {
        self.submit_tracked(
            Operation::Read {
                local,
                rank,
                remote,
                size,
            },
            queue,
        )
    }

    /// Post a notification on a remote segment.
    pub fn notify(
        &self,
        rank: Rank,
        segment: SegmentId,
        notification: NotificationUpdate,
        queue: QueueId,
    ) -> Result<()> {
        self.submit_tracked(
            Operation::Notify {
                rank,
                segment,
                notification,
            },
            queue,
        )
    }

    /// Write followed by a notification ordered after the data.
    pub fn write_notify(
        &self,
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        notification: NotificationUpdate,
        queue: QueueId,
    ) -> Result<()> {
        self.submit_tracked(
            Operation::WriteNotify {
                local,
                rank,
                remote,
                size,
                notification,
            },
            queue,
        )
    }

    /// List-form write with a trailing notification.
    pub fn write_list_notify(
        &self,
        entries: &[TransferEntry],
        rank: Rank,
        notify_segment: SegmentId,
        notification: NotificationUpdate,
        queue: QueueId,
    ) -> Result<()> {
        self.submit_list_tracked(
            OpKind::WriteListNotify,
            entries,
            rank,
            Some((notify_segment, notification)),
            queue,
        )
    }

    /// List-form read.
    pub fn read_list(&self, entries: &[TransferEntry], rank: Rank, queue: QueueId) -> Result<()> {
        self.submit_list_tracked(OpKind::ReadList, entries, rank, None, queue)
    }

    // ------------------------------------------------------------------
    // Waits
    // ------------------------------------------------------------------

    /// Register a wait for ids `[first_id, first_id + count)` on `segment`,
    /// storing each notified value at `values[id - first_id]`.
    ///
    /// Already-notified ids are consumed on the calling thread. If that
    /// resolves the whole range the call returns [`WaitOutcome::Satisfied`]
    /// and no asynchronous state is created; otherwise the current task's
    /// event counter is increased by one and the remainder of the range is
    /// tracked by the polling agent.
    ///
    /// # Safety
    /// `values` must either be null (discard the values) or point to at
    /// least `count` writable `NotificationValue` cells that stay valid and
    /// otherwise untouched until the wait resolves — i.e. until the task's
    /// event counter releases, which the tasking runtime guarantees happens
    /// before the task finishes.
    pub unsafe fn wait_notifications(
        &self,
        segment: SegmentId,
        first_id: NotificationId,
        count: u32,
        values: *mut NotificationValue,
    ) -> Result<WaitOutcome> {
        let state = self.inner.segment(segment)?;
        if count == 0 {
            return Ok(WaitOutcome::Satisfied);
        }

        let counter = self.inner.runtime.current_task_counter();
        let mut range = WaitingRange::new(segment, first_id, count, values, counter);
        if range.try_complete(&self.inner.substrate) {
            return Ok(WaitOutcome::Satisfied);
        }

        self.inner.runtime.increase_counter(counter, 1);
        state.handoff.enqueue(self.inner.pool.allocate(range));
        Ok(WaitOutcome::Deferred)
    }

    /// Single-id form of [`Environment::wait_notifications`].
    ///
    /// # Safety
    /// Same contract as [`Environment::wait_notifications`] with
    /// `count == 1`.
    pub unsafe fn wait_notification(
        &self,
        segment: SegmentId,
        id: NotificationId,
        value: *mut NotificationValue,
    ) -> Result<WaitOutcome> {
        unsafe { self.wait_notifications(segment, id, 1, value) }
    }

    // ------------------------------------------------------------------
    // Acknowledged transfers
    // ------------------------------------------------------------------

    /// Write that waits for acknowledgement notifications first.
    ///
    /// The task's counter is increased for the write immediately. Once all
    /// ids in `[ack_first, ack_first + ack_count)` on `ack_segment` are
    /// notified — possibly right now — the write is submitted, tagged with
    /// this task's counter so its completion releases the task.
    ///
    /// # Safety
    /// Same buffer contract as [`Environment::wait_notifications`] for
    /// `ack_values`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn ack_write(
        &self,
        ack_segment: SegmentId,
        ack_first: NotificationId,
        ack_count: u32,
        ack_values: *mut NotificationValue,
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        queue: QueueId,
    ) -> Result<()> {
        let op = Operation::Write {
            local,
            rank,
            remote,
            size,
        };
        unsafe {
            self.ack_submit(ack_segment, ack_first, ack_count, ack_values, op, queue)
        }
    }

    /// Write-with-notification that waits for acknowledgement
    /// notifications first.
    ///
    /// # Safety
    /// Same buffer contract as [`Environment::wait_notifications`] for
    /// `ack_values`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn ack_write_notify(
        &self,
        ack_segment: SegmentId,
        ack_first: NotificationId,
        ack_count: u32,
        ack_values: *mut NotificationValue,
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        notification: NotificationUpdate,
        queue: QueueId,
    ) -> Result<()> {
        let op = Operation::WriteNotify {
            local,
            rank,
            remote,
            size,
            notification,
        };
        unsafe {
            self.ack_submit(ack_segment, ack_first, ack_count, ack_values, op, queue)
        }
    }

    unsafe fn ack_submit(
        &self,
        ack_segment: SegmentId,
        ack_first: NotificationId,
        ack_count: u32,
        ack_values: *mut NotificationValue,
        op: Operation,
        queue: QueueId,
    ) -> Result<()> {
        let state = self.inner.segment(ack_segment)?;
        self.check_queue(queue)?;

        let requests = self.inner.substrate.request_count(op.kind(), 1);
        let counter = self.inner.runtime.current_task_counter();
        self.inner.runtime.increase_counter(counter, requests);

        let action = AckAction { op, queue };
        let mut range =
            WaitingRange::new_ack(ack_segment, ack_first, ack_count, ack_values, counter, action);

        if range.try_complete(&self.inner.substrate) {
            // Acknowledgements already arrived; fire the transfer now. A
            // synchronous failure here is still the caller's to handle.
            if let Err(e) = self.inner.substrate.submit(&op, counter.as_tag(), queue) {
                self.inner.runtime.decrease_counter(counter, requests);
                return Err(substrate_to_error(e));
            }
            return Ok(());
        }

        state.handoff.enqueue(self.inner.pool.allocate(range));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue groups
    // ------------------------------------------------------------------

    /// Create queue group `id` over `[first, first + count)` with `policy`.
    pub fn create_queue_group(
        &self,
        id: QueueGroupId,
        first: QueueId,
        count: u32,
        policy: GroupPolicy,
    ) -> Result<()> {
        self.inner
            .groups
            .create(id, first, count, policy, &self.inner.runtime)
    }

    /// Delete queue group `id`, releasing its policy data. The id becomes
    /// reusable.
    pub fn delete_queue_group(&self, id: QueueGroupId) -> Result<()> {
        self.inner.groups.delete(id)
    }

    /// Pick a queue from group `id` for the calling thread.
    pub fn queue_group_queue(&self, id: QueueGroupId) -> Result<QueueId> {
        let group = self.inner.groups.get(id)?;
        Ok(group.queue_for_caller(&self.inner.runtime))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_queue(&self, queue: QueueId) -> Result<()> {
        if u32::from(queue) >= self.inner.max_queues {
            return Err(Error::InvalidQueueRange {
                first: queue,
                count: 1,
            });
        }
        Ok(())
    }

    fn submit_tracked(&self, op: Operation, queue: QueueId) -> Result<()> {
        self.check_queue(queue)?;

        let requests = self.inner.substrate.request_count(op.kind(), 1);
        let counter = self.inner.runtime.current_task_counter();
        self.inner.runtime.increase_counter(counter, requests);

        match self.inner.substrate.submit(&op, counter.as_tag(), queue) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The operation never entered a queue, so no completion will
                // arrive; undo the increase before surfacing the failure.
                self.inner.runtime.decrease_counter(counter, requests);
                Err(substrate_to_error(e))
            }
        }
    }

    fn submit_list_tracked(
        &self,
        kind: OpKind,
        entries: &[TransferEntry],
        rank: Rank,
        notification: Option<(SegmentId, NotificationUpdate)>,
        queue: QueueId,
    ) -> Result<()> {
        self.check_queue(queue)?;
        if entries.is_empty() {
            return Ok(());
        }

        let requests = self
            .inner
            .substrate
            .request_count(kind, entries.len() as u32);
        let counter = self.inner.runtime.current_task_counter();
        self.inner.runtime.increase_counter(counter, requests);

        match self.inner.substrate.submit_list(
            kind,
            entries,
            rank,
            notification,
            counter.as_tag(),
            queue,
        ) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.runtime.decrease_counter(counter, requests);
                Err(substrate_to_error(e))
            }
        }
    }
}

fn substrate_to_error(e: SubstrateError) -> Error {
    match e {
        SubstrateError::Gone => Error::Submit(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "queue or segment no longer exists",
        )),
        SubstrateError::Failed(e) => Error::Submit(e),
    }
}
