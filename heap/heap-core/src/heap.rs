//! The heap value: region bookkeeping, initialization, allocation and free.

#[cfg(feature = "caller-id")]
use core::panic::Location;
use core::ptr::{NonNull, null_mut};

use crate::HeapError;
use crate::section::FreeHeader;
use crate::stats::HeapStats;

/// A first-fit allocator over one fixed, caller-provided byte region.
///
/// A `Heap` starts unbound; [`init`](Self::init) ties it to a region and
/// tiles it with a single free section. All further state (section headers
/// and the free-list links) lives in-band inside the region itself; the
/// `Heap` value only keeps the region bounds, the list head and counters.
///
/// Operations that take pointers ([`free`](Self::free),
/// [`reallocate`](Self::reallocate)) are `unsafe`: with the
/// `integrity-checks` feature the engine verifies the pointer against the
/// section chain first, but without it a stale or foreign pointer corrupts
/// the region just like in `malloc`.
pub struct Heap {
    /// Region base; null while unbound.
    pub(crate) base: *mut u8,
    /// Region size in bytes, fixed at [`init`](Self::init).
    pub(crate) size: usize,
    /// Content alignment, a power of two at least the pointer width.
    pub(crate) align: usize,
    /// Head of the free list.
    pub(crate) first_free: *mut FreeHeader,
    /// Set once [`init`](Self::init) has run.
    pub(crate) initialized: bool,
    /// Counters refreshed after each mutating operation.
    pub(crate) stats: HeapStats,
    /// Caller of the public operation in flight; stamped onto every header
    /// this operation touches.
    #[cfg(feature = "caller-id")]
    pub(crate) caller: &'static Location<'static>,
}

// Safety: the raw section pointers all target the caller-provided region,
// which init requires to be exclusive to this value.
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// Create an unbound heap. Every operation except
    /// [`contains`](Self::contains), [`largest_free`](Self::largest_free) and
    /// [`is_intact`](Self::is_intact) fails with
    /// [`HeapError::Uninitialized`] until [`init`](Self::init) is called.
    #[must_use]
    #[track_caller]
    pub const fn new() -> Self {
        Self {
            base: null_mut(),
            size: 0,
            align: size_of::<usize>(),
            first_free: null_mut(),
            initialized: false,
            stats: HeapStats::new(),
            #[cfg(feature = "caller-id")]
            caller: Location::caller(),
        }
    }

    /// Bind the heap to `[base, base + size)` with pointer-width content
    /// alignment and tile it with one free section.
    ///
    /// # Safety
    /// The region must be valid, writable and exclusive to this heap for its
    /// entire lifetime, and `base` must be aligned to the pointer width.
    ///
    /// # Panics
    /// Panics if `base` is misaligned or `size` cannot hold a free header.
    #[track_caller]
    pub unsafe fn init(&mut self, base: *mut u8, size: usize) {
        unsafe { self.init_with_align(base, size, size_of::<usize>()) };
    }

    /// Bind the heap to `[base, base + size)` with the given content
    /// alignment and tile it with one free section.
    ///
    /// # Safety
    /// The region must be valid, writable and exclusive to this heap for its
    /// entire lifetime, and `base` must be aligned to `align`.
    ///
    /// # Panics
    /// Panics if `align` is not a power of two at least the pointer width, if
    /// `base` is misaligned, or if `size` cannot hold a free header.
    #[track_caller]
    pub unsafe fn init_with_align(&mut self, base: *mut u8, size: usize, align: usize) {
        assert!(
            align.is_power_of_two() && align >= size_of::<usize>(),
            "alignment must be a power of two at least the pointer width"
        );
        assert!(
            (base as usize) % align == 0,
            "region base must respect the content alignment"
        );
        self.base = base;
        self.size = size;
        self.align = align;
        assert!(
            size > self.free_header_size(),
            "region too small for a free section header"
        );
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        unsafe { self.write_initial_free() };
        self.initialized = true;
        log::debug!("heap bound: {size} bytes at {base:p}, alignment {align}");
    }

    /// Restore the freshly-initialized state: one free section spanning the
    /// whole region, zeroed counters, re-armed head-room tracking.
    ///
    /// Every prior allocation is forgotten; outstanding pointers become
    /// dangling.
    ///
    /// # Errors
    /// [`HeapError::Uninitialized`] if the heap was never bound to a region.
    #[track_caller]
    pub fn reset(&mut self) -> Result<(), HeapError> {
        if !self.initialized {
            return Err(HeapError::Uninitialized);
        }
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        unsafe { self.write_initial_free() };
        log::debug!("heap reset: {} bytes at {:p}", self.size, self.base);
        Ok(())
    }

    /// Write the single all-spanning free section and reset the counters.
    ///
    /// # Safety
    /// The region fields must be set and the region writable.
    unsafe fn write_initial_free(&mut self) {
        let free = self.base.cast::<FreeHeader>();
        unsafe {
            (*free).size = self.size - self.free_header_size();
            (*free).next = null_mut();
            self.rekey_free(free);
            #[cfg(feature = "caller-id")]
            {
                (*free).owner = self.caller;
            }
        }
        self.first_free = free;
        self.stats = HeapStats::new();
        #[cfg(feature = "track-stats")]
        {
            let largest = unsafe { self.scan_largest_free() };
            self.stats.largest_free = largest;
            self.stats.head_room = largest;
        }
    }

    /// Allocate `size` content bytes and return the content address.
    ///
    /// The request is rounded up to the content alignment and to the minimum
    /// size every used section must have so it can be returned to the free
    /// list later. Placement is first-fit in address order.
    ///
    /// # Errors
    /// - [`HeapError::AllocationFailed`] if no free section can host the
    ///   request.
    /// - [`HeapError::Broken`] if the pre-operation integrity walk fails
    ///   (`integrity-checks` feature).
    /// - [`HeapError::Uninitialized`] if the heap is unbound.
    #[track_caller]
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        self.allocate_inner(size)
    }

    /// Like [`allocate`](Self::allocate), but stamps `owner` as the caller
    /// identity instead of the immediate call site. For wrappers that forward
    /// their own caller.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate).
    #[cfg(feature = "caller-id")]
    pub fn allocate_tagged(
        &mut self,
        size: usize,
        owner: &'static Location<'static>,
    ) -> Result<NonNull<u8>, HeapError> {
        self.caller = owner;
        self.allocate_inner(size)
    }

    pub(crate) fn allocate_inner(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if !self.initialized {
            return Err(HeapError::Uninitialized);
        }
        let size = self.normalize_size(size);
        #[cfg(feature = "integrity-checks")]
        unsafe {
            self.check_region(None)?;
        }
        #[cfg(feature = "track-stats")]
        if size > self.stats.largest_free {
            return Err(HeapError::AllocationFailed(size));
        }
        unsafe {
            let free = self.free_walk(size);
            if free.is_null() {
                return Err(HeapError::AllocationFailed(size));
            }
            self.free_remove(free);
            let used = self.free_to_used(free);
            self.used_shrink(used, size);
            self.stats.note_allocated();
            #[cfg(feature = "track-stats")]
            self.refresh_largest();
            Ok(NonNull::new_unchecked(self.used_content(used)))
        }
    }

    /// Release an allocation. `ptr` may be null, in which case only the
    /// optional integrity walk runs; that is the traditional way to verify
    /// the heap without mutating it.
    ///
    /// # Safety
    /// A non-null `ptr` must be a content pointer obtained from this heap
    /// that has not been freed or relocated since. With `integrity-checks`
    /// enabled, violations are caught and reported instead.
    ///
    /// # Errors
    /// - [`HeapError::FreeOutsideRegion`] if `ptr` is outside the region.
    /// - [`HeapError::FalseFree`] if `ptr` is not a live allocation
    ///   (`integrity-checks` feature).
    /// - [`HeapError::Broken`] if the integrity walk fails.
    /// - [`HeapError::Uninitialized`] if the heap is unbound.
    #[track_caller]
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        self.free_inner(ptr)
    }

    /// Like [`free`](Self::free), but stamps `owner` as the freeing identity.
    ///
    /// # Safety
    /// See [`free`](Self::free).
    ///
    /// # Errors
    /// See [`free`](Self::free).
    #[cfg(feature = "caller-id")]
    pub unsafe fn free_tagged(
        &mut self,
        ptr: *mut u8,
        owner: &'static Location<'static>,
    ) -> Result<(), HeapError> {
        self.caller = owner;
        self.free_inner(ptr)
    }

    pub(crate) fn free_inner(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if !self.initialized {
            return Err(HeapError::Uninitialized);
        }
        if ptr.is_null() {
            #[cfg(feature = "integrity-checks")]
            unsafe {
                self.check_region(None)?;
            }
            return Ok(());
        }
        if !self.contains(ptr) {
            return Err(HeapError::FreeOutsideRegion);
        }
        let used = self.used_from_content(ptr);
        #[cfg(feature = "integrity-checks")]
        unsafe {
            self.check_region(Some(used as usize))?;
        }
        unsafe {
            let free = self.used_to_free(used);
            self.free_insert(free);
            self.free_merge(free);
        }
        self.stats.note_freed();
        #[cfg(feature = "track-stats")]
        self.refresh_largest();
        Ok(())
    }

    /// Whether `ptr` points strictly inside the region.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.initialized && (self.base as usize) < addr && addr < self.end()
    }

    /// Largest content size a single allocation could currently obtain, in
    /// bytes. Zero when the heap is unbound or has no free section.
    #[must_use]
    pub fn largest_free(&self) -> usize {
        unsafe { self.scan_largest_free() }
    }

    /// Run the integrity walker over the whole region. An unbound heap is
    /// vacuously intact.
    #[must_use]
    pub fn is_intact(&self) -> bool {
        unsafe { self.check_region(None).is_ok() }
    }

    /// Current counters. See [`HeapStats`].
    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Round a request up to the alignment and to the used-section size floor.
    ///
    /// The floor guarantees that every used section can later host a free
    /// header when it is returned to the free list.
    pub(crate) fn normalize_size(&self, size: usize) -> usize {
        let aligned = size.saturating_add(self.align - 1) & !(self.align - 1);
        let floor = core::cmp::max(
            self.align,
            self.free_header_size() - self.used_header_size(),
        );
        core::cmp::max(aligned, floor)
    }
}
