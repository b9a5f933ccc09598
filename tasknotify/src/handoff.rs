//! Per-segment hand-off queue.
//!
//! Arbitrary application threads registering waits push pool handles into
//! this bounded multi-producer ring; the segment's polling agent is the
//! single consumer that drains them into the pending set. Producers never
//! touch a range again after a successful push.
//!
//! The ring stores raw `u32` pool indices with `u32::MAX` as the empty
//! sentinel. Admission is gated by a shared count so a push either acquires
//! a slot it can always complete or backs off without side effects; the
//! producer-side claim is a fetch-add, so per-producer FIFO order holds but
//! no order is defined across producers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use fixedpool::Handle;

const EMPTY: u32 = u32::MAX;

#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

pub(crate) struct HandoffQueue {
    /// Number of occupied (or claimed) slots; the admission gate.
    count: CachePadded<AtomicUsize>,
    /// Producer claim cursor.
    head: CachePadded<AtomicUsize>,
    /// Consumer cursor. Plain cell: only the single drainer touches it.
    tail: UnsafeCell<usize>,
    buffer: Box<[AtomicU32]>,
    mask: usize,
    capacity: usize,
}

// Safety: `tail` is only accessed from `drain`, whose caller guarantees a
// single consumer at a time (the per-segment try-lock in the polling duty).
unsafe impl Send for HandoffQueue {}
unsafe impl Sync for HandoffQueue {}

impl HandoffQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        let size = capacity.next_power_of_two();
        let buffer = (0..size)
            .map(|_| AtomicU32::new(EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            count: CachePadded {
                value: AtomicUsize::new(0),
            },
            head: CachePadded {
                value: AtomicUsize::new(0),
            },
            tail: UnsafeCell::new(0),
            buffer,
            mask: size - 1,
            capacity,
        }
    }

    /// Push a handle, spinning while the ring is transiently full. Capacity
    /// is sized so that a full ring only happens when producers outrun the
    /// polling period, which resolves within a tick.
    pub(crate) fn enqueue(&self, handle: Handle) {
        let mut handle = handle;
        loop {
            match self.try_enqueue(handle) {
                Ok(()) => return,
                Err(returned) => {
                    handle = returned;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Push a handle, or hand it back if the ring is full right now.
    pub(crate) fn try_enqueue(&self, handle: Handle) -> Result<(), Handle> {
        let count = self.count.fetch_add(1, Ordering::AcqRel);
        if count >= self.capacity {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(handle);
        }

        // The admitted producer owns exactly one slot at the claimed
        // position; the consumer freed it before decrementing count.
        let pos = self.head.fetch_add(1, Ordering::AcqRel);
        let raw = handle.into_raw();
        debug_assert_ne!(raw, EMPTY);
        let prev = self.buffer[pos & self.mask].swap(raw, Ordering::AcqRel);
        debug_assert_eq!(prev, EMPTY);
        Ok(())
    }

    /// Pop up to `max` handles into `each`. Returns `true` when the batch
    /// filled and entries are still queued, i.e. the caller should drain
    /// again within this cycle.
    ///
    /// A slot whose producer has claimed it but not yet stored reads as
    /// empty; the drain stops there and the entry is picked up next cycle.
    ///
    /// # Safety
    /// At most one thread may drain at a time. The polling duty guarantees
    /// this by holding the segment's pending-set lock across the call.
    pub(crate) unsafe fn drain(&self, max: usize, mut each: impl FnMut(Handle)) -> bool {
        let tail = unsafe { &mut *self.tail.get() };
        let mut drained = 0;

        while drained < max {
            let raw = self.buffer[*tail & self.mask].swap(EMPTY, Ordering::AcqRel);
            if raw == EMPTY {
                return false;
            }
            *tail = tail.wrapping_add(1);
            let outstanding = self.count.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(outstanding > 0);

            // Safety: the producer that stored `raw` moved ownership of the
            // handle into the ring; it is reconstructed exactly once here.
            each(unsafe { Handle::from_raw(raw) });
            drained += 1;
        }

        self.count.load(Ordering::Acquire) > 0
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}
