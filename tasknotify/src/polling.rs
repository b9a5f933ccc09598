//! Periodic polling duties.
//!
//! Two independent duties drive all asynchronous progress. Both run as
//! short non-blocking callbacks on the tasking runtime's worker threads:
//!
//! 1. **Queue duty** — drains hardware completion queues in batches and
//!    decrements the task counter named by each completed request's token.
//!    Queues are split into contiguous shards, one duty instance per shard,
//!    with a per-queue try-lock so overlapping ticks skip instead of
//!    contending.
//! 2. **Notification duty** — per segment: moves freshly handed-off waiting
//!    ranges into the pending set, rescans the set, and retires resolved
//!    ranges (counter decrement or deferred-operation submit, then slot
//!    release).
//!
//! Neither duty blocks; correctness relies on eventual, non-overlapping
//! execution, not on exactly-once-per-period ticks.

use std::sync::Arc;

use fixedpool::Handle;

use crate::config::{HANDOFF_DRAIN_BATCH, QUEUE_DRAIN_BATCH};
use crate::env::EnvInner;
use crate::error::fatal;
use crate::substrate::{CompletedRequest, Substrate, SubstrateError};
use crate::tasking::{CounterHandle, TaskingRuntime};
use crate::waiting_range::Completion;

/// Queue-completion duty for one shard of hardware queues.
pub(crate) struct QueueDuty<S: Substrate, R: TaskingRuntime> {
    env: Arc<EnvInner<S, R>>,
    first_queue: u32,
    num_queues: u32,
}

impl<S: Substrate, R: TaskingRuntime> QueueDuty<S, R> {
    pub(crate) fn new(env: Arc<EnvInner<S, R>>, first_queue: u32, num_queues: u32) -> Self {
        Self {
            env,
            first_queue,
            num_queues,
        }
    }

    pub(crate) fn tick(&self) {
        queue_tick(&self.env, self.first_queue, self.num_queues);
    }
}

/// Drain the queues in `[first, first + count)` once.
pub(crate) fn queue_tick<S: Substrate, R: TaskingRuntime>(
    env: &EnvInner<S, R>,
    first: u32,
    count: u32,
) {
    let mut batch = [CompletedRequest::default(); QUEUE_DRAIN_BATCH];

    for queue in first..first + count {
        let gate = &env.queue_gates[queue as usize];
        if !gate.try_lock() {
            continue;
        }

        loop {
            let drained = match env.substrate.drain_queue(queue as u16, &mut batch) {
                Ok(n) => n,
                Err(SubstrateError::Gone) => break,
                Err(SubstrateError::Failed(e)) => fatal("completion queue drain", &e),
            };
            debug_assert!(drained <= QUEUE_DRAIN_BATCH);

            for request in &batch[..drained] {
                if !request.ok {
                    fatal(
                        "asynchronous operation failed",
                        &format_args!("completion token {:#x}", request.tag),
                    );
                }
                env.runtime
                    .decrease_counter(CounterHandle::from_tag(request.tag), 1);
            }

            // A short batch means the queue is drained for now; a full one
            // may hide more completions behind it.
            if drained < QUEUE_DRAIN_BATCH {
                break;
            }
        }

        gate.unlock();
    }
}

/// Notification duty covering every segment.
pub(crate) struct NotificationDuty<S: Substrate, R: TaskingRuntime> {
    env: Arc<EnvInner<S, R>>,
}

impl<S: Substrate, R: TaskingRuntime> NotificationDuty<S, R> {
    pub(crate) fn new(env: Arc<EnvInner<S, R>>) -> Self {
        Self { env }
    }

    pub(crate) fn tick(&self) {
        notification_tick(&self.env);
    }
}

/// One notification cycle over all segments.
pub(crate) fn notification_tick<S: Substrate, R: TaskingRuntime>(env: &EnvInner<S, R>) {
    let mut completed: Vec<Handle> = Vec::new();

    for segment in env.segments.iter() {
        // Exclusive claim on this segment's pending set; holding it also
        // makes this thread the hand-off queue's single consumer. A losing
        // tick skips the segment.
        let Some(mut pending) = segment.pending.try_lock() else {
            continue;
        };

        loop {
            // Freshly handed-off ranges get an immediate check: many are
            // satisfied by the time the duty sees them.
            let more = unsafe {
                segment.handoff.drain(HANDOFF_DRAIN_BATCH, |mut handle| {
                    if env.pool.get_mut(&mut handle).try_complete(&env.substrate) {
                        completed.push(handle);
                    } else {
                        pending.insert(handle);
                    }
                })
            };

            pending.rescan(&env.pool, &env.substrate, &mut completed);

            for mut handle in completed.drain(..) {
                retire(env, &mut handle);
                env.pool.free(handle);
            }

            if !more {
                break;
            }
        }
    }
}

/// Run a resolved range's completion action.
fn retire<S: Substrate, R: TaskingRuntime>(env: &EnvInner<S, R>, handle: &mut Handle) {
    let range = env.pool.get_mut(handle);
    debug_assert!(range.is_satisfied());

    match range.completion() {
        Completion::Plain => {
            env.runtime.decrease_counter(range.counter(), 1);
        }
        Completion::Ack(action) => {
            // The deferred operation inherits the originating counter as its
            // token; its own completion performs the decrement, so none
            // happens here.
            let tag = range.counter().as_tag();
            if let Err(e) = env.substrate.submit(&action.op, tag, action.queue) {
                fatal("deferred operation submit", &e);
            }
        }
    }
}
