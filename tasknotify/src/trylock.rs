//! Non-blocking mutual-exclusion gates for polling duties.
//!
//! Polling callbacks must never block, so exclusive sections are guarded by
//! try-locks: a callback that loses the race skips its tick and the state
//! is revisited on the next period. Correctness never depends on a tick
//! running, only on ticks not overlapping.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// A try-only lock protecting a value.
pub(crate) struct TryLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for TryLock<T> {}
unsafe impl<T: Send> Sync for TryLock<T> {}

impl<T> TryLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Attempt to acquire. Returns `None` if another holder is active.
    pub(crate) fn try_lock(&self) -> Option<TryLockGuard<'_, T>> {
        // Test first to avoid bouncing the cache line on contended ticks.
        if self.locked.load(Ordering::Relaxed) {
            return None;
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(TryLockGuard { lock: self })
        } else {
            None
        }
    }
}

pub(crate) struct TryLockGuard<'a, T> {
    lock: &'a TryLock<T>,
}

impl<T> Deref for TryLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TryLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TryLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A bare try-lock with no protected value, for gating access to state
/// whose exclusivity is established elsewhere (per-queue drain gates).
pub(crate) struct RawTryLock {
    locked: AtomicBool,
}

impl RawTryLock {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn try_lock(&self) -> bool {
        if self.locked.load(Ordering::Relaxed) {
            return false;
        }
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}
