//! Process-wide environment: owned state and lifecycle.
//!
//! One [`Environment`] is constructed when the process attaches to the
//! communication substrate and dropped (or explicitly shut down) at detach.
//! It owns every piece of mutable state the completion core needs — the
//! waiting-range pool, per-segment hand-off queues and pending sets,
//! per-queue drain gates, the queue-group table — and registers the two
//! polling duties with the host tasking runtime as its last construction
//! step, so a duty never observes half-built state.

use std::sync::Arc;

use fixedpool::FixedPool;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handoff::HandoffQueue;
use crate::pending::PendingSet;
use crate::polling::{self, NotificationDuty, QueueDuty};
use crate::queue_group::GroupTable;
use crate::substrate::{SegmentId, Substrate};
use crate::tasking::{PollingRegistration, TaskingRuntime};
use crate::trylock::{RawTryLock, TryLock};
use crate::waiting_range::WaitingRange;

/// Per-segment completion-tracking state.
///
/// The hand-off queue is written by arbitrary producer threads; the pending
/// set is only ever touched by the one duty instance that currently holds
/// its try-lock, which also serializes hand-off draining.
pub(crate) struct SegmentState {
    pub(crate) handoff: HandoffQueue,
    pub(crate) pending: TryLock<PendingSet>,
}

pub(crate) struct EnvInner<S: Substrate, R: TaskingRuntime> {
    pub(crate) substrate: S,
    pub(crate) runtime: R,
    pub(crate) config: Config,
    pub(crate) max_queues: u32,
    pub(crate) max_segments: u32,
    pub(crate) segments: Box<[SegmentState]>,
    /// One drain gate per hardware queue; a duty that loses a gate skips
    /// that queue for the tick.
    pub(crate) queue_gates: Box<[RawTryLock]>,
    pub(crate) groups: GroupTable,
    pub(crate) pool: FixedPool<WaitingRange>,
}

impl<S: Substrate, R: TaskingRuntime> EnvInner<S, R> {
    pub(crate) fn segment(&self, segment: SegmentId) -> Result<&SegmentState> {
        self.segments
            .get(segment as usize)
            .ok_or(Error::InvalidSegment(segment))
    }
}

/// Handle to an initialized completion-tracking environment.
///
/// Dropping the environment unregisters the polling duties. All waits must
/// have resolved by then; a wait whose notification never arrives is a
/// caller contract violation and stalls its task forever.
pub struct Environment<S: Substrate, R: TaskingRuntime> {
    pub(crate) inner: Arc<EnvInner<S, R>>,
    registrations: Vec<PollingRegistration>,
}

impl<S: Substrate, R: TaskingRuntime> Environment<S, R> {
    /// Build the environment and register the polling duties.
    ///
    /// Sizing comes from the substrate's advertised maxima; tuning comes
    /// from `config`.
    pub fn initialize(substrate: S, runtime: R, config: Config) -> Result<Self> {
        let max_queues = substrate.max_queues();
        let max_segments = substrate.max_segments();
        assert!(max_queues > 0, "substrate advertises no queues");
        assert!(max_segments > 0, "substrate advertises no segments");

        let segments = (0..max_segments)
            .map(|_| SegmentState {
                handoff: HandoffQueue::new(config.handoff_capacity),
                pending: TryLock::new(PendingSet::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let queue_gates = (0..max_queues)
            .map(|_| RawTryLock::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let inner = Arc::new(EnvInner {
            groups: GroupTable::new(config.max_queue_groups, max_queues),
            pool: FixedPool::new(config.pool_capacity),
            substrate,
            runtime,
            config: config.clone(),
            max_queues,
            max_segments,
            segments,
            queue_gates,
        });

        let mut registrations = Vec::new();

        // One queue duty per shard, each owning a disjoint contiguous block
        // of hardware queues.
        let shards = config.queue_pollers.min(max_queues as usize).max(1) as u32;
        let per_shard = max_queues.div_ceil(shards);
        let mut first = 0u32;
        let mut shard_index = 0u32;
        while first < max_queues {
            let count = per_shard.min(max_queues - first);
            let duty = QueueDuty::new(inner.clone(), first, count);
            let name = format!("tasknotify-queues-{}", shard_index);
            let registration = inner.runtime.register_polling(
                &name,
                config.polling_period,
                Box::new(move || duty.tick()),
            );
            registrations.push(registration);
            first += count;
            shard_index += 1;
        }

        let duty = NotificationDuty::new(inner.clone());
        let registration = inner.runtime.register_polling(
            "tasknotify-notifications",
            config.polling_period,
            Box::new(move || duty.tick()),
        );
        registrations.push(registration);

        log::debug!(
            "environment initialized: {} queues in {} shard(s), {} segments, pool capacity {}",
            max_queues,
            shards,
            max_segments,
            config.pool_capacity
        );

        Ok(Self {
            inner,
            registrations,
        })
    }

    /// Convenience constructor using [`Config::from_env`].
    pub fn initialize_from_env(substrate: S, runtime: R) -> Result<Self> {
        Self::initialize(substrate, runtime, Config::from_env())
    }

    /// The substrate's advertised queue count.
    pub fn max_queues(&self) -> u32 {
        self.inner.max_queues
    }

    /// The substrate's advertised segment count.
    pub fn max_segments(&self) -> u32 {
        self.inner.max_segments
    }

    /// The configured queue-group table capacity.
    pub fn max_queue_groups(&self) -> usize {
        self.inner.groups.capacity()
    }

    /// The configuration this environment was built with.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of waiting ranges currently allocated, i.e. registered waits
    /// that have not resolved yet. A snapshot under concurrent traffic.
    pub fn outstanding_waits(&self) -> usize {
        self.inner.pool.capacity() - self.inner.pool.free_count()
    }

    /// Access to the substrate, e.g. for connection establishment living
    /// outside this core.
    pub fn substrate(&self) -> &S {
        &self.inner.substrate
    }

    /// Access to the tasking runtime.
    pub fn runtime(&self) -> &R {
        &self.inner.runtime
    }

    /// Run one notification-duty cycle on the calling thread, as the
    /// registered periodic callback would. Intended for embedders that
    /// drive progress manually (and for tests).
    pub fn poll_notifications_now(&self) {
        polling::notification_tick(&self.inner);
    }

    /// Run one queue-duty cycle over every hardware queue on the calling
    /// thread.
    pub fn poll_queues_now(&self) {
        polling::queue_tick(&self.inner, 0, self.inner.max_queues);
    }

    /// Unregister the polling duties. Called automatically on drop; calling
    /// it earlier makes teardown ordering explicit.
    pub fn shutdown(mut self) {
        self.unregister();
    }

    fn unregister(&mut self) {
        for registration in self.registrations.drain(..) {
            self.inner.runtime.unregister_polling(registration);
        }
    }
}

impl<S: Substrate, R: TaskingRuntime> Drop for Environment<S, R> {
    fn drop(&mut self) {
        self.unregister();
    }
}
