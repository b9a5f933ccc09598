//! Interface to the host tasking runtime.
//!
//! The tasking runtime owns task scheduling, the per-task event counters
//! that keep a task alive while asynchronous effects are outstanding, and
//! the periodic invocation of registered polling callbacks from its worker
//! threads. This module defines the slice of that API the core consumes;
//! [`crate::host::HostRuntime`] binds it to a real runtime via symbol
//! resolution, and tests substitute an in-memory runtime.

use std::time::Duration;

use crate::substrate::Tag;

/// Opaque handle to a task's event counter.
///
/// The raw value doubles as the completion token attached to submitted
/// operations, so a drained completion-queue entry maps straight back to
/// the counter it must decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterHandle(u64);

impl CounterHandle {
    /// Wrap a runtime-provided raw counter value.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw counter value.
    #[inline]
    pub fn as_raw(self) -> u64 {
        self.0
    }

    /// Use the counter as a submission tag.
    #[inline]
    pub fn as_tag(self) -> Tag {
        self.0
    }

    /// Recover the counter from a drained completion token.
    #[inline]
    pub fn from_tag(tag: Tag) -> Self {
        Self(tag)
    }
}

/// Identifier of one registered polling callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingRegistration(pub u64);

/// A periodic, non-blocking callback.
///
/// `Fn`, not `FnMut`: depending on the runtime, a callback may be invoked
/// from different worker threads and, in degenerate schedules, concurrently
/// with itself. Callbacks guard their own state with non-blocking try-locks
/// and simply skip a tick that overlaps another.
pub type PollingHandler = Box<dyn Fn() + Send + Sync>;

/// The fixed host-runtime API consumed by the core.
pub trait TaskingRuntime: Send + Sync + 'static {
    /// Event counter of the task running on the calling thread.
    fn current_task_counter(&self) -> CounterHandle;

    /// Keep the task alive for `amount` more asynchronous effects.
    fn increase_counter(&self, counter: CounterHandle, amount: u32);

    /// Resolve `amount` outstanding effects; the runtime releases the task
    /// once its counter reaches zero.
    fn decrease_counter(&self, counter: CounterHandle, amount: u32);

    /// Register a periodic non-blocking callback. `period` is a hint; some
    /// runtime generations choose their own invocation cadence.
    fn register_polling(
        &self,
        name: &str,
        period: Duration,
        handler: PollingHandler,
    ) -> PollingRegistration;

    /// Unregister a callback previously returned by
    /// [`TaskingRuntime::register_polling`].
    fn unregister_polling(&self, registration: PollingRegistration);

    /// CPU the calling worker thread currently runs on, if the runtime
    /// exposes it.
    fn current_cpu(&self) -> Option<usize>;

    /// NUMA node of each usable CPU, indexed by CPU id, if the runtime
    /// exposes topology. Required by the CPU-affinity queue-group policy.
    fn cpu_numa_map(&self) -> Option<Vec<usize>>;
}
