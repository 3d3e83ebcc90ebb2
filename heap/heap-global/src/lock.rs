//! The mutual-exclusion guard around the heap engine.
//!
//! The engine itself is strictly single-threaded: every public operation is a
//! straight-line walk over the region that neither blocks, yields, nor calls
//! back into the allocator. That makes a busy-wait flag a sufficient guard
//! (the longest a waiter can spin is one bounded region walk) and avoids any
//! dependency on an OS lock, which the freestanding targets this allocator is
//! for do not have.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// A busy-wait lock sized for exactly one heap operation at a time.
///
/// [`LockedHeap`](crate::LockedHeap) takes this lock at the entry of every
/// public call and releases it on return, never across calls; the closure
/// shape of [`with_lock`](Self::with_lock) is what enforces that. Holding the
/// lock for the full call is required for correctness, not just convenience:
/// the engine mutates section headers and free-list links in several steps,
/// and another thread observing the region between those steps would see a
/// chain that does not tile.
///
/// # Caveats
/// - Re-entering the allocator from inside the critical section (for example
///   from a logger that itself allocates from this heap) deadlocks. Engine
///   failures are reported as values, never via callbacks, so the engine
///   itself cannot re-enter.
/// - Interrupts are not disabled; taking heap locks from interrupt handlers
///   is not supported.
pub struct SpinLock<T> {
    /// `true` while a heap operation is in flight.
    held: AtomicBool,
    /// The engine state.
    value: UnsafeCell<T>,
}

// Safety: the flag serializes all access to `value`, so sharing the lock is
// sound whenever the engine state itself may move between threads.
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Wrap `value` in an unlocked lock. `const`, so a `LockedHeap` can live
    /// in a `static`.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Run one heap operation `f` with exclusive access to the engine.
    ///
    /// Waiters spin on a plain load and only retry the atomic swap once the
    /// flag reads free, so contending cores hammer a shared cache line as
    /// little as a busy-wait allows. The wait is bounded by the region walk
    /// of whatever operation currently holds the lock.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }

        // Safety: the swap above won the flag, so no other thread holds a
        // reference into `value` until the store below releases it.
        let result = f(unsafe { &mut *self.value.get() });
        self.held.store(false, Ordering::Release);
        result
    }
}
