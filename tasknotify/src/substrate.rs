//! Interface to the one-sided communication substrate.
//!
//! The substrate (queue/segment addressing, wire semantics, completion
//! queues, notification cells) is an external collaborator. This module
//! pins down the exact slice of its API the completion-tracking core
//! consumes; it is never reimplemented here.
//!
//! Two call families matter:
//!
//! - **Submission**: fire an asynchronous one-sided operation tagged with an
//!   opaque 64-bit completion token onto a hardware queue. The token comes
//!   back out of the completion queue when the request finishes.
//! - **Progress probes**: non-blocking checks for notification arrival
//!   (`probe_any` / `reset_notification`) and batched completion-queue
//!   drains (`drain_queue`). All of them return immediately.

use std::io;

/// Identifier of a registered memory segment.
pub type SegmentId = u16;

/// Identifier of a hardware queue.
pub type QueueId = u16;

/// Identifier of a notification slot within a segment.
pub type NotificationId = u32;

/// Value carried by a notification. Zero means "not notified": remote peers
/// must post non-zero values, and a reset that observes zero is a no-op.
pub type NotificationValue = u32;

/// Remote process rank.
pub type Rank = u32;

/// Opaque completion token attached to submitted operations and read back
/// from drained completion-queue entries.
pub type Tag = u64;

/// A (segment, offset) pair addressing substrate-registered memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLocation {
    pub segment: SegmentId,
    pub offset: u64,
}

impl MemoryLocation {
    pub fn new(segment: SegmentId, offset: u64) -> Self {
        Self { segment, offset }
    }
}

/// Notification posted remotely as part of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationUpdate {
    pub id: NotificationId,
    pub value: NotificationValue,
}

/// One entry of a list-form transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEntry {
    pub local: MemoryLocation,
    pub remote: MemoryLocation,
    pub size: u64,
}

/// A single one-sided operation descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Write local memory to a remote segment.
    Write {
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
    },
    /// Read a remote segment into local memory.
    Read {
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
    },
    /// Post a notification on a remote segment.
    Notify {
        rank: Rank,
        segment: SegmentId,
        notification: NotificationUpdate,
    },
    /// Write plus a trailing notification, ordered after the data.
    WriteNotify {
        local: MemoryLocation,
        rank: Rank,
        remote: MemoryLocation,
        size: u64,
        notification: NotificationUpdate,
    },
}

impl Operation {
    /// Operation kind, for request-count queries.
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Write { .. } => OpKind::Write,
            Operation::Read { .. } => OpKind::Read,
            Operation::Notify { .. } => OpKind::Notify,
            Operation::WriteNotify { .. } => OpKind::WriteNotify,
        }
    }
}

/// Kinds of submittable operations, including the list forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Write,
    Read,
    Notify,
    WriteNotify,
    WriteListNotify,
    ReadList,
}

/// One drained completion-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedRequest {
    /// Token supplied at submission time.
    pub tag: Tag,
    /// Whether the request completed successfully. A failed in-flight
    /// request is unrecoverable for the core.
    pub ok: bool,
}

impl Default for CompletedRequest {
    fn default() -> Self {
        Self { tag: 0, ok: true }
    }
}

/// Failure modes of substrate probe/submit calls.
#[derive(Debug)]
pub enum SubstrateError {
    /// The addressed queue or segment no longer exists, e.g. a probe racing
    /// with shutdown. Callers treat this as "nothing to do".
    Gone,
    /// Any other substrate failure. Unrecoverable when detected inside a
    /// polling callback.
    Failed(io::Error),
}

impl std::fmt::Display for SubstrateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubstrateError::Gone => write!(f, "queue or segment no longer exists"),
            SubstrateError::Failed(e) => write!(f, "substrate failure: {}", e),
        }
    }
}

impl std::error::Error for SubstrateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SubstrateError::Failed(e) => Some(e),
            SubstrateError::Gone => None,
        }
    }
}

/// Result type for substrate calls.
pub type SubstrateResult<T> = std::result::Result<T, SubstrateError>;

/// The fixed substrate API consumed by the core.
///
/// All methods are non-blocking. Implementations must be safe to call from
/// any thread; the core guarantees that per-segment notification probes and
/// per-queue drains are serialized by its own try-lock discipline, but
/// distinct segments and queues are accessed concurrently.
pub trait Substrate: Send + Sync + 'static {
    /// Number of hardware queues the substrate exposes.
    fn max_queues(&self) -> u32;

    /// Number of segments the substrate exposes.
    fn max_segments(&self) -> u32;

    /// Number of completion-queue entries one submission of `kind` with
    /// `num_entries` list entries will eventually produce. Single-form
    /// operations pass `num_entries == 1`.
    fn request_count(&self, kind: OpKind, num_entries: u32) -> u32;

    /// Submit a single asynchronous operation tagged with `tag` onto
    /// `queue`. Returns synchronously; completion arrives via
    /// [`Substrate::drain_queue`].
    fn submit(&self, op: &Operation, tag: Tag, queue: QueueId) -> SubstrateResult<()>;

    /// Submit a list-form transfer. `notification` is posted after the data
    /// for `OpKind::WriteListNotify` and must be `None` for
    /// `OpKind::ReadList`.
    fn submit_list(
        &self,
        kind: OpKind,
        entries: &[TransferEntry],
        rank: Rank,
        notification: Option<(SegmentId, NotificationUpdate)>,
        tag: Tag,
        queue: QueueId,
    ) -> SubstrateResult<()>;

    /// Non-blocking probe: is any id in `[first, first + count)` on
    /// `segment` notified? Returns at most one ready id per call; returns
    /// `None` when nothing is ready this instant.
    fn probe_any(
        &self,
        segment: SegmentId,
        first: NotificationId,
        count: u32,
    ) -> SubstrateResult<Option<NotificationId>>;

    /// Read and clear a notification slot. Returns the value; zero means
    /// the slot was not notified (and nothing was consumed).
    fn reset_notification(
        &self,
        segment: SegmentId,
        id: NotificationId,
    ) -> SubstrateResult<NotificationValue>;

    /// Drain up to `out.len()` completed requests from `queue`. Returns the
    /// number written into `out`.
    fn drain_queue(&self, queue: QueueId, out: &mut [CompletedRequest]) -> SubstrateResult<usize>;
}
