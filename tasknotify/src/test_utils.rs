//! In-memory substrate and runtime fakes for tests.
//!
//! [`FakeSubstrate`] models segments as arrays of atomic notification cells
//! and hardware queues as scripted completion lists; submissions are
//! recorded and, by default, auto-completed into their target queue so the
//! queue duty can drain them. [`FakeRuntime`] models event counters as
//! atomics and lets tests drive registered polling callbacks tick by tick.
//!
//! Enable the `test-utils` feature to use these fakes from integration
//! tests and benchmarks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::substrate::{
    CompletedRequest, NotificationId, NotificationValue, OpKind, Operation, QueueId, Rank,
    SegmentId, Substrate, SubstrateError, SubstrateResult, Tag, TransferEntry,
};
use crate::tasking::{CounterHandle, PollingHandler, PollingRegistration, TaskingRuntime};

// ============================================================================
// FakeSubstrate
// ============================================================================

struct FakeSegment {
    slots: Box<[AtomicU32]>,
}

/// One recorded submission.
#[derive(Debug, Clone)]
pub struct SubmitRecord {
    pub kind: OpKind,
    pub tag: Tag,
    pub queue: QueueId,
    pub rank: Rank,
}

pub struct FakeSubstrate {
    segments: Box<[FakeSegment]>,
    queues: Box<[Mutex<VecDeque<CompletedRequest>>]>,
    submitted: Mutex<Vec<SubmitRecord>>,
    /// When set, a submission immediately enqueues its completion.
    auto_complete: AtomicBool,
    /// When set, the next single-op submit fails synchronously.
    fail_next_submit: AtomicBool,
}

impl FakeSubstrate {
    /// `slots_per_segment` notification cells per segment, all unset.
    pub fn new(num_segments: u32, num_queues: u32, slots_per_segment: usize) -> Self {
        let segments = (0..num_segments)
            .map(|_| FakeSegment {
                slots: (0..slots_per_segment)
                    .map(|_| AtomicU32::new(0))
                    .collect::<Vec<_>>()
                    .into_boxed_slice(),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let queues = (0..num_queues)
            .map(|_| Mutex::new(VecDeque::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            segments,
            queues,
            submitted: Mutex::new(Vec::new()),
            auto_complete: AtomicBool::new(true),
            fail_next_submit: AtomicBool::new(false),
        }
    }

    /// Remote-peer side: set a notification cell.
    pub fn post_notification(&self, segment: SegmentId, id: NotificationId, value: u32) {
        assert_ne!(value, 0, "zero means not-notified");
        self.segments[segment as usize].slots[id as usize].store(value, Ordering::Release);
    }

    /// Script a completed request into a queue directly.
    pub fn push_completion(&self, queue: QueueId, tag: Tag, ok: bool) {
        self.queues[queue as usize]
            .lock()
            .unwrap()
            .push_back(CompletedRequest { tag, ok });
    }

    /// Disable automatic completion of submissions.
    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::Release);
    }

    /// Make the next single-op submission fail synchronously.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::Release);
    }

    /// Submissions recorded so far.
    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.submitted.lock().unwrap().clone()
    }

    /// Number of recorded submissions of the given kind.
    pub fn submitted_count(&self, kind: OpKind) -> usize {
        self.submitted
            .lock()
            .unwrap()
            .iter()
            .filter(|record| record.kind == kind)
            .count()
    }

    fn record(&self, kind: OpKind, tag: Tag, queue: QueueId, rank: Rank) {
        self.submitted.lock().unwrap().push(SubmitRecord {
            kind,
            tag,
            queue,
            rank,
        });
        if self.auto_complete.load(Ordering::Acquire) {
            self.push_completion(queue, tag, true);
        }
    }

    fn segment(&self, segment: SegmentId) -> SubstrateResult<&FakeSegment> {
        self.segments
            .get(segment as usize)
            .ok_or(SubstrateError::Gone)
    }
}

impl Substrate for FakeSubstrate {
    fn max_queues(&self) -> u32 {
        self.queues.len() as u32
    }

    fn max_segments(&self) -> u32 {
        self.segments.len() as u32
    }

    fn request_count(&self, kind: OpKind, num_entries: u32) -> u32 {
        match kind {
            OpKind::WriteListNotify | OpKind::ReadList => num_entries.max(1),
            _ => 1,
        }
    }

    fn submit(&self, op: &Operation, tag: Tag, queue: QueueId) -> SubstrateResult<()> {
        if queue as usize >= self.queues.len() {
            return Err(SubstrateError::Gone);
        }
        if self.fail_next_submit.swap(false, Ordering::AcqRel) {
            return Err(SubstrateError::Failed(std::io::Error::other(
                "scripted submit failure",
            )));
        }
        let rank = match op {
            Operation::Write { rank, .. }
            | Operation::Read { rank, .. }
            | Operation::Notify { rank, .. }
            | Operation::WriteNotify { rank, .. } => *rank,
        };
        self.record(op.kind(), tag, queue, rank);
        Ok(())
    }

    fn submit_list(
        &self,
        kind: OpKind,
        entries: &[TransferEntry],
        rank: Rank,
        _notification: Option<(SegmentId, crate::substrate::NotificationUpdate)>,
        tag: Tag,
        queue: QueueId,
    ) -> SubstrateResult<()> {
        if queue as usize >= self.queues.len() {
            return Err(SubstrateError::Gone);
        }
        // One completion per list entry, like the single-op path records one.
        for _ in 0..entries.len().max(1) {
            self.record(kind, tag, queue, rank);
        }
        Ok(())
    }

    fn probe_any(
        &self,
        segment: SegmentId,
        first: NotificationId,
        count: u32,
    ) -> SubstrateResult<Option<NotificationId>> {
        let seg = self.segment(segment)?;
        for id in first..first + count {
            match seg.slots.get(id as usize) {
                Some(slot) if slot.load(Ordering::Acquire) != 0 => return Ok(Some(id)),
                _ => {}
            }
        }
        Ok(None)
    }

    fn reset_notification(
        &self,
        segment: SegmentId,
        id: NotificationId,
    ) -> SubstrateResult<NotificationValue> {
        let seg = self.segment(segment)?;
        let slot = seg.slots.get(id as usize).ok_or(SubstrateError::Gone)?;
        Ok(slot.swap(0, Ordering::AcqRel))
    }

    fn drain_queue(&self, queue: QueueId, out: &mut [CompletedRequest]) -> SubstrateResult<usize> {
        let mut pending = self
            .queues
            .get(queue as usize)
            .ok_or(SubstrateError::Gone)?
            .lock()
            .unwrap();
        let n = pending.len().min(out.len());
        for slot in out.iter_mut().take(n) {
            *slot = pending.pop_front().unwrap();
        }
        Ok(n)
    }
}

// ============================================================================
// FakeRuntime
// ============================================================================

struct Registered {
    name: String,
    handler: PollingHandler,
}

/// Tickable in-memory tasking runtime.
///
/// Counters live in a table indexed by the handle's raw value. Tests pick
/// the current task per thread with [`FakeRuntime::set_current_task`].
pub struct FakeRuntime {
    counters: Mutex<Vec<Arc<AtomicI64>>>,
    callbacks: Mutex<Vec<(u64, Arc<Registered>)>>,
    next_registration: AtomicU64,
    cpu_numa_map: Mutex<Option<Vec<usize>>>,
}

thread_local! {
    static CURRENT_TASK: std::cell::Cell<u64> = const { std::cell::Cell::new(0) };
    static CURRENT_CPU: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

impl FakeRuntime {
    pub fn new() -> Self {
        let runtime = Self {
            counters: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
            next_registration: AtomicU64::new(1),
            cpu_numa_map: Mutex::new(Some(vec![0])),
        };
        // Task 0 exists from the start so single-task tests need no setup.
        runtime.new_task();
        runtime
    }

    /// Create a task and return its counter handle.
    pub fn new_task(&self) -> CounterHandle {
        let mut counters = self.counters.lock().unwrap();
        counters.push(Arc::new(AtomicI64::new(0)));
        CounterHandle::from_raw((counters.len() - 1) as u64)
    }

    /// Bind the calling thread to a task.
    pub fn set_current_task(&self, counter: CounterHandle) {
        CURRENT_TASK.with(|cell| cell.set(counter.as_raw()));
    }

    /// Current value of a task's counter.
    pub fn counter_value(&self, counter: CounterHandle) -> i64 {
        self.counters.lock().unwrap()[counter.as_raw() as usize].load(Ordering::SeqCst)
    }

    /// Set the CPU the calling thread reports.
    pub fn set_current_cpu(&self, cpu: usize) {
        CURRENT_CPU.with(|cell| cell.set(cpu));
    }

    /// Replace the CPU→NUMA topology.
    pub fn set_cpu_numa_map(&self, map: Vec<usize>) {
        *self.cpu_numa_map.lock().unwrap() = Some(map);
    }

    /// Report no topology, like a runtime without CPU information.
    pub fn clear_cpu_numa_map(&self) {
        *self.cpu_numa_map.lock().unwrap() = None;
    }

    /// Invoke every registered polling callback once, in registration
    /// order, as one runtime scheduling period would.
    pub fn tick_all(&self) {
        let callbacks: Vec<Arc<Registered>> = self
            .callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            (callback.handler)();
        }
    }

    /// Names of currently registered callbacks.
    pub fn registered_names(&self) -> Vec<String> {
        self.callbacks
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| cb.name.clone())
            .collect()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskingRuntime for FakeRuntime {
    fn current_task_counter(&self) -> CounterHandle {
        CounterHandle::from_raw(CURRENT_TASK.with(|cell| cell.get()))
    }

    fn increase_counter(&self, counter: CounterHandle, amount: u32) {
        self.counters.lock().unwrap()[counter.as_raw() as usize]
            .fetch_add(i64::from(amount), Ordering::SeqCst);
    }

    fn decrease_counter(&self, counter: CounterHandle, amount: u32) {
        let value = self.counters.lock().unwrap()[counter.as_raw() as usize]
            .fetch_sub(i64::from(amount), Ordering::SeqCst);
        assert!(
            value >= i64::from(amount),
            "counter under-released: task {} went below zero",
            counter.as_raw()
        );
    }

    fn register_polling(
        &self,
        name: &str,
        _period: Duration,
        handler: PollingHandler,
    ) -> PollingRegistration {
        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().unwrap().push((
            id,
            Arc::new(Registered {
                name: name.to_string(),
                handler,
            }),
        ));
        PollingRegistration(id)
    }

    fn unregister_polling(&self, registration: PollingRegistration) {
        self.callbacks
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != registration.0);
    }

    fn current_cpu(&self) -> Option<usize> {
        Some(CURRENT_CPU.with(|cell| cell.get()))
    }

    fn cpu_numa_map(&self) -> Option<Vec<usize>> {
        self.cpu_numa_map.lock().unwrap().clone()
    }
}
