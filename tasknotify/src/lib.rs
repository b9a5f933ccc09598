//! tasknotify - Task-aware completion tracking for one-sided RDMA notifications.
//!
//! Bridges two asynchronous worlds: a communication substrate whose one-sided
//! operations complete out-of-band (completion queues, remote notification
//! cells) and a cooperative tasking runtime that keeps a task alive until a
//! counted number of asynchronous effects resolve. No thread ever blocks on
//! communication: a wait is data, not a parked thread.
//!
//! # Architecture
//!
//! ```text
//!  application threads                      runtime worker threads
//!  ───────────────────                      ──────────────────────
//!  write()/read()/notify()  ──tag=counter──▶ hardware queues ──┐
//!  wait_notifications()                                        │
//!     │  ready now? ──▶ done (no state)                        ▼
//!     │  otherwise:                                    ┌──────────────┐
//!     │  counter += 1                                  │  QueueDuty   │
//!     ▼                                                │  drain batch │
//!  ┌─────────────┐    ┌──────────────┐                 │  counter -= 1│
//!  │  FixedPool  │──▶ │ HandoffQueue │ (per segment)   └──────────────┘
//!  │ (wait range)│    └──────┬───────┘
//!  └─────────────┘           │ drained by
//!                            ▼
//!                     ┌──────────────┐   resolved: counter -= 1
//!                     │  PendingSet  │──▶ or deferred-op submit,
//!                     │  (rescanned) │    then slot freed
//!                     └──────────────┘
//! ```
//!
//! - **[`Environment`]** owns all state; construct at attach, drop at detach.
//! - **Waiting ranges** live in a fixed lock-free pool; registration never
//!   heap-allocates.
//! - **Polling duties** are short non-blocking callbacks registered with the
//!   tasking runtime; overlapping ticks skip via try-locks.
//! - **Queue groups** spread submissions over hardware queues, round-robin
//!   or NUMA-affine.

pub mod config;
pub mod env;
pub mod error;
pub mod host;
pub mod ops;
pub mod queue_group;
pub mod substrate;
pub mod tasking;

mod handoff;
mod pending;
mod polling;
mod trylock;
mod waiting_range;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use env::Environment;
pub use error::{Error, Result};
pub use host::HostRuntime;
pub use ops::WaitOutcome;
pub use queue_group::{GroupPolicy, QueueGroupId};
pub use substrate::{
    CompletedRequest, MemoryLocation, NotificationId, NotificationUpdate, NotificationValue,
    OpKind, Operation, QueueId, Rank, SegmentId, Substrate, SubstrateError, SubstrateResult, Tag,
    TransferEntry,
};
pub use tasking::{CounterHandle, PollingHandler, PollingRegistration, TaskingRuntime};
