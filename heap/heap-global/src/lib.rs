//! # Global Fixed-Region Heap
//!
//! A statically-reserved region plus the spin-lock guard that makes the
//! single-threaded engine in `heap-core` usable as a process-wide allocator.
//! The lock covers every public call from entry to return; the region is
//! bound lazily on the first call.
//!
//! The [`GlobalAlloc`] implementation is the stdlib-names face of the
//! allocator: hook a [`LockedHeap`] in as the global allocator and `Box`,
//! `Vec` and friends draw from the fixed region.
//!
//! ```no_run
//! #[global_allocator]
//! static HEAP: heap_global::LockedHeap<16_384> = heap_global::LockedHeap::new();
//!
//! extern crate alloc;
//! ```
//!
//! The engine's own API stays available on the wrapper, including the
//! diagnostics, so a deployed system can ask the live allocator
//! [`largest_free`](LockedHeap::largest_free), [`is_intact`](LockedHeap::is_intact)
//! or [`find_leak`](LockedHeap::find_leak).

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod lock;

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::fmt;
#[cfg(feature = "caller-id")]
use core::panic::Location;
use core::ptr::{self, NonNull, null_mut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "caller-id")]
use heap_core::{Allocation, LeakReport};
use heap_core::{Heap, HeapError, HeapStats};

pub use crate::lock::SpinLock;

/// Alignment of the backing region. Also the largest layout alignment the
/// [`GlobalAlloc`] implementation serves; larger requests are refused with a
/// null pointer.
pub const REGION_ALIGN: usize = 16;

/// Backing storage with the minimum alignment the content areas need.
#[repr(align(16))]
struct RegionMem<const N: usize>([u8; N]);

/// A spin-locked [`Heap`] over `N` statically-reserved bytes.
///
/// Declare one as a `static` (optionally as the `#[global_allocator]`) and
/// use it from any thread; the first operation binds the region. The lock is
/// held for the full duration of each call, never across calls.
///
/// # Panics
/// The first operation panics if `N` cannot hold a single free-section
/// header; anything below a few hundred bytes is not a useful heap.
pub struct LockedHeap<const N: usize> {
    /// The region itself. All section metadata lives in here.
    region: UnsafeCell<RegionMem<N>>,
    /// The engine; every access goes through the lock.
    heap: SpinLock<Heap>,
    /// Whether the region has been bound to the engine yet.
    did_init: AtomicBool,
}

// Safety: the region is only ever touched through the engine, and the engine
// only runs under the spin lock.
unsafe impl<const N: usize> Sync for LockedHeap<N> {}

impl<const N: usize> Default for LockedHeap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> LockedHeap<N> {
    /// Create an unbound locked heap. `const`, so it can initialize a
    /// `static`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            region: UnsafeCell::new(RegionMem([0; N])),
            heap: SpinLock::new(Heap::new()),
            did_init: AtomicBool::new(false),
        }
    }

    /// Run `f` on the engine under the lock, binding the region first if this
    /// is the first call.
    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap) -> R) -> R {
        self.heap.with_lock(|heap| {
            if !self.did_init.load(Ordering::Acquire) {
                let base = self.region.get().cast::<u8>();
                // Safety: the region lives as long as self, is exclusive to
                // this engine, and RegionMem guarantees the alignment.
                unsafe { heap.init_with_align(base, N, REGION_ALIGN) };
                self.did_init.store(true, Ordering::Release);
            }
            f(heap)
        })
    }

    /// Allocate `size` content bytes. See [`Heap::allocate`].
    ///
    /// # Errors
    /// See [`Heap::allocate`].
    #[cfg(feature = "caller-id")]
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let owner = Location::caller();
        self.with_heap(|heap| heap.allocate_tagged(size, owner))
    }

    /// Allocate `size` content bytes. See [`Heap::allocate`].
    ///
    /// # Errors
    /// See [`Heap::allocate`].
    #[cfg(not(feature = "caller-id"))]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.with_heap(|heap| heap.allocate(size))
    }

    /// Resize an allocation. See [`Heap::reallocate`].
    ///
    /// # Safety
    /// See [`Heap::reallocate`].
    ///
    /// # Errors
    /// See [`Heap::reallocate`].
    #[cfg(feature = "caller-id")]
    #[track_caller]
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, HeapError> {
        let owner = Location::caller();
        self.with_heap(|heap| unsafe { heap.reallocate_tagged(ptr, new_size, owner) })
    }

    /// Resize an allocation. See [`Heap::reallocate`].
    ///
    /// # Safety
    /// See [`Heap::reallocate`].
    ///
    /// # Errors
    /// See [`Heap::reallocate`].
    #[cfg(not(feature = "caller-id"))]
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize) -> Result<*mut u8, HeapError> {
        self.with_heap(|heap| unsafe { heap.reallocate(ptr, new_size) })
    }

    /// Release an allocation. See [`Heap::free`].
    ///
    /// # Safety
    /// See [`Heap::free`].
    ///
    /// # Errors
    /// See [`Heap::free`].
    #[cfg(feature = "caller-id")]
    #[track_caller]
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        let owner = Location::caller();
        self.with_heap(|heap| unsafe { heap.free_tagged(ptr, owner) })
    }

    /// Release an allocation. See [`Heap::free`].
    ///
    /// # Safety
    /// See [`Heap::free`].
    ///
    /// # Errors
    /// See [`Heap::free`].
    #[cfg(not(feature = "caller-id"))]
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapError> {
        self.with_heap(|heap| unsafe { heap.free(ptr) })
    }

    /// Whether `ptr` points strictly inside the region.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.with_heap(|heap| heap.contains(ptr))
    }

    /// Largest content size a single allocation could currently obtain.
    #[must_use]
    pub fn largest_free(&self) -> usize {
        self.with_heap(|heap| heap.largest_free())
    }

    /// Run the integrity walker over the whole region.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        self.with_heap(|heap| heap.is_intact())
    }

    /// Current counters. See [`HeapStats`].
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.with_heap(|heap| heap.stats())
    }

    /// Restore the freshly-initialized state. See [`Heap::reset`].
    ///
    /// # Errors
    /// See [`Heap::reset`].
    #[track_caller]
    pub fn reset(&self) -> Result<(), HeapError> {
        self.with_heap(Heap::reset)
    }

    /// The call site holding the most live allocations. See
    /// [`Heap::find_leak`].
    #[cfg(feature = "caller-id")]
    #[must_use]
    pub fn find_leak(&self) -> Option<LeakReport> {
        self.with_heap(|heap| heap.find_leak())
    }

    /// The `index`-th live allocation in address order. See [`Heap::list`].
    #[cfg(feature = "caller-id")]
    #[must_use]
    pub fn list(&self, index: usize) -> Option<Allocation> {
        self.with_heap(|heap| heap.list(index))
    }

    /// Render `args` into a fresh allocation. See [`Heap::format`].
    ///
    /// # Errors
    /// See [`Heap::format`].
    #[track_caller]
    pub fn format(&self, args: fmt::Arguments<'_>) -> Result<NonNull<str>, HeapError> {
        self.with_heap(|heap| heap.format(args))
    }
}

// Safety: every trait method serializes on the spin lock, and failures are
// reported by the null-return contract of the trait.
unsafe impl<const N: usize> GlobalAlloc for LockedHeap<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > REGION_ALIGN {
            return null_mut();
        }
        self.with_heap(|heap| heap.allocate(layout.size()))
            .map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        if let Err(err) = self.with_heap(|heap| unsafe { heap.free(ptr) }) {
            // The trait offers no error channel.
            log::error!("dealloc of {ptr:p} failed: {err}");
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > REGION_ALIGN {
            return null_mut();
        }
        self.with_heap(|heap| unsafe { heap.reallocate(ptr, new_size) })
            .unwrap_or(null_mut())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}
