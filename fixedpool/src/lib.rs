//! Fixed-capacity lock-free object pool.
//!
//! A `FixedPool<T>` preallocates `capacity` slots up front and recycles them
//! through a lock-free ring of free slot indices. Allocation and release never
//! touch the global allocator, which keeps them usable from latency-sensitive
//! completion paths.
//!
//! Handles are slot indices, not pointers. A [`Handle`] is not `Copy` and not
//! `Clone`: as long as every handle in circulation originated from
//! [`FixedPool::allocate`], each live handle refers to a distinct slot, which
//! is what makes [`FixedPool::get_mut`] sound.
//!
//! Exhaustion policy: [`FixedPool::allocate`] busy-waits with a spin-loop
//! hint until a slot is released. Pools are expected to be sized to the
//! maximum number of objects in flight, so the wait is a transient condition,
//! not steady state. [`FixedPool::try_allocate`] is the non-waiting variant
//! for callers that want to observe backpressure instead.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Cache-line padding
// ============================================================================

#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

// ============================================================================
// Free-index ring (bounded MPMC)
// ============================================================================

/// One ring slot: a sequence number plus the stored free index.
///
/// The sequence protocol is the classic bounded-queue one: `seq == pos` means
/// the slot is open for the producer claiming position `pos`, `seq == pos + 1`
/// means it holds data for the consumer at `pos`, and after consumption the
/// slot is re-armed for the next lap with `seq = pos + ring_size`.
#[repr(C, align(64))]
struct IndexSlot {
    seq: AtomicUsize,
    index: UnsafeCell<u32>,
}

struct IndexRing {
    buffer: Box<[IndexSlot]>,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
}

unsafe impl Send for IndexRing {}
unsafe impl Sync for IndexRing {}

impl IndexRing {
    fn new(capacity: usize) -> Self {
        let size = capacity.next_power_of_two();
        let buffer = (0..size)
            .map(|i| IndexSlot {
                seq: AtomicUsize::new(i),
                index: UnsafeCell::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            buffer,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            mask: size - 1,
        }
    }

    /// Push a free index. Fails only when the ring is full, which cannot
    /// happen for a pool ring sized to hold every slot index at once.
    fn push(&self, value: u32) -> bool {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { *slot.index.get() = value };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return false;
            } else {
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop a free index, or `None` when the ring is momentarily empty.
    fn pop(&self) -> Option<u32> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let value = unsafe { *slot.index.get() };
                        slot.seq
                            .store(pos.wrapping_add(self.mask + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.wrapping_sub(tail)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Owned reference to one allocated slot.
///
/// Returning the handle to [`FixedPool::free`] releases the slot. Dropping a
/// handle without freeing it leaks the slot for the pool's lifetime (the
/// object's destructor still runs when the pool is dropped).
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
}

impl Handle {
    /// Raw slot index, for transporting the handle through index-typed
    /// channels.
    #[inline]
    pub fn into_raw(self) -> u32 {
        self.index
    }

    /// Rebuild a handle from [`Handle::into_raw`].
    ///
    /// # Safety
    /// `raw` must come from `into_raw` on a handle of the same pool, and the
    /// original handle must not be reconstructed twice. Duplicating a handle
    /// breaks the exclusive-owner guarantee behind [`FixedPool::get_mut`] and
    /// [`FixedPool::free`].
    #[inline]
    pub unsafe fn from_raw(raw: u32) -> Self {
        Self { index: raw }
    }
}

struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity lock-free pool. See the crate docs for the handle
/// discipline.
pub struct FixedPool<T> {
    slots: Box<[Slot<T>]>,
    free: IndexRing,
    capacity: usize,
}

unsafe impl<T: Send> Send for FixedPool<T> {}
unsafe impl<T: Send> Sync for FixedPool<T> {}

impl<T> FixedPool<T> {
    /// Preallocate `capacity` slots and mark all of them free.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "pool capacity must be non-zero");
        assert!(
            capacity < u32::MAX as usize,
            "pool capacity must fit in a u32 handle"
        );

        let slots = (0..capacity)
            .map(|_| Slot {
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = IndexRing::new(capacity);
        for i in 0..capacity {
            let pushed = free.push(i as u32);
            debug_assert!(pushed);
        }

        Self {
            slots,
            free,
            capacity,
        }
    }

    /// Total number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of currently free slots. Exact only while the pool is
    /// quiescent; under concurrent traffic it is a snapshot.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocate a slot, spinning until one is free.
    pub fn allocate(&self, value: T) -> Handle {
        let mut value = value;
        loop {
            match self.try_allocate(value) {
                Ok(handle) => return handle,
                Err(returned) => {
                    value = returned;
                    std::hint::spin_loop();
                }
            }
        }
    }

    /// Allocate a slot, returning the value back if the pool is exhausted.
    pub fn try_allocate(&self, value: T) -> Result<Handle, T> {
        match self.free.pop() {
            Some(index) => {
                let slot = &self.slots[index as usize];
                unsafe { (*slot.value.get()).write(value) };
                Ok(Handle { index })
            }
            None => Err(value),
        }
    }

    /// Shared access to the object behind `handle`.
    #[inline]
    pub fn get<'a>(&'a self, handle: &'a Handle) -> &'a T {
        let slot = &self.slots[handle.index as usize];
        unsafe { (*slot.value.get()).assume_init_ref() }
    }

    /// Exclusive access to the object behind `handle`.
    ///
    /// Sound because live handles are unique: `&mut Handle` proves no other
    /// borrow of this slot exists, and the unsafe [`Handle::from_raw`]
    /// contract forbids duplication.
    #[inline]
    pub fn get_mut<'a>(&'a self, handle: &'a mut Handle) -> &'a mut T {
        let slot = &self.slots[handle.index as usize];
        unsafe { (*slot.value.get()).assume_init_mut() }
    }

    /// Drop the object and release its slot back to the pool.
    pub fn free(&self, handle: Handle) {
        let index = handle.index;
        let slot = &self.slots[index as usize];
        unsafe { (*slot.value.get()).assume_init_drop() };

        let pushed = self.free.push(index);
        debug_assert!(pushed, "free ring can always take back a slot index");
    }
}

impl<T> Drop for FixedPool<T> {
    fn drop(&mut self) {
        if !std::mem::needs_drop::<T>() {
            return;
        }
        // Slots still free in the ring hold no live object; everything else
        // was allocated and never returned, so its destructor runs here.
        let mut live = vec![true; self.capacity];
        while let Some(index) = self.free.pop() {
            live[index as usize] = false;
        }
        for (index, live) in live.iter().enumerate() {
            if *live {
                let slot = &self.slots[index];
                unsafe { (*slot.value.get()).assume_init_drop() };
            }
        }
    }
}
