//! Reallocation (extend down, extend up, or relocate, always preferring the
//! lowest resulting address) plus the shrink path that returns slack to the
//! free list.

#[cfg(feature = "caller-id")]
use core::panic::Location;
use core::ptr::{self, null_mut};

use crate::HeapError;
use crate::heap::Heap;
use crate::section::{FreeHeader, UsedHeader};

impl Heap {
    /// Resize an allocation, preferring results at lower addresses.
    ///
    /// - A null `ptr` is equivalent to [`allocate`](Self::allocate).
    /// - A zero `new_size` is equivalent to [`free`](Self::free) and returns
    ///   null.
    /// - Otherwise the engine picks the first of these that fits: relocate
    ///   into a free section **below** the allocation, extend **down** into
    ///   an adjacent free predecessor, extend **up** into an adjacent free
    ///   successor, relocate into a free section **above**. The first
    ///   `min(old_size, new_size)` content bytes are preserved in every case.
    ///
    /// On success the result is shrunk back to `new_size`, so growing and
    /// shrinking are both single calls. On failure the original allocation is
    /// untouched.
    ///
    /// # Safety
    /// A non-null `ptr` must be a content pointer obtained from this heap
    /// that has not been freed or relocated since. With `integrity-checks`
    /// enabled, violations are caught and reported instead.
    ///
    /// # Errors
    /// - [`HeapError::ReallocOutsideRegion`] if `ptr` is outside the region.
    /// - [`HeapError::FalseRealloc`] if `ptr` is not a live allocation
    ///   (`integrity-checks` feature).
    /// - [`HeapError::ReallocFailed`] if the request can neither extend nor
    ///   relocate.
    /// - [`HeapError::AllocationFailed`] for the null-pointer allocate case.
    /// - [`HeapError::Broken`] if the integrity walk fails.
    /// - [`HeapError::Uninitialized`] if the heap is unbound.
    #[track_caller]
    pub unsafe fn reallocate(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<*mut u8, HeapError> {
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        self.reallocate_inner(ptr, new_size)
    }

    /// Like [`reallocate`](Self::reallocate), but stamps `owner` as the
    /// caller identity.
    ///
    /// # Safety
    /// See [`reallocate`](Self::reallocate).
    ///
    /// # Errors
    /// See [`reallocate`](Self::reallocate).
    #[cfg(feature = "caller-id")]
    pub unsafe fn reallocate_tagged(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        owner: &'static Location<'static>,
    ) -> Result<*mut u8, HeapError> {
        self.caller = owner;
        self.reallocate_inner(ptr, new_size)
    }

    pub(crate) fn reallocate_inner(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
    ) -> Result<*mut u8, HeapError> {
        if !self.initialized {
            return Err(HeapError::Uninitialized);
        }
        // Null first: a null pointer is an allocation request even when the
        // region check would reject the null address.
        if ptr.is_null() {
            return self.allocate_inner(new_size).map(|p| p.as_ptr());
        }
        if new_size == 0 {
            self.free_inner(ptr)?;
            return Ok(null_mut());
        }
        if !self.contains(ptr) {
            return Err(HeapError::ReallocOutsideRegion);
        }
        let new_size = self.normalize_size(new_size);
        let used = self.used_from_content(ptr);
        #[cfg(feature = "integrity-checks")]
        unsafe {
            self.check_region(Some(used as usize)).map_err(|e| {
                if e == HeapError::FalseFree {
                    HeapError::FalseRealloc
                } else {
                    e
                }
            })?;
        }
        let result = unsafe { self.relocate_or_extend(used, new_size) };
        #[cfg(feature = "track-stats")]
        if result.is_ok() {
            self.refresh_largest();
        }
        result
    }

    /// The placement decision. `new_size` is already normalized.
    ///
    /// # Safety
    /// `used` must be a verified used header inside the region.
    unsafe fn relocate_or_extend(
        &mut self,
        used: *mut UsedHeader,
        new_size: usize,
    ) -> Result<*mut u8, HeapError> {
        let mut new_used: *mut UsedHeader = null_mut();

        unsafe {
            // Any free section that could host the request.
            let candidate = self.free_walk(new_size);
            let mut dest = candidate;

            if candidate.is_null() || (candidate as usize) >= used as usize {
                // No destination below the allocation; try to extend in
                // place before settling for a higher address.
                let pred = self.find_free_below(used as usize);
                if !pred.is_null()
                    && self.after_free(pred) == used as usize
                    && (*used).size + self.free_footprint(pred) >= new_size
                {
                    self.free_remove(pred);
                    new_used = self.used_extend_down(pred, used, new_size);
                    dest = null_mut();
                }

                if new_used.is_null() {
                    let succ = self.after_used(used);
                    if self.in_free_list(succ) {
                        let succ = succ as *mut FreeHeader;
                        if (*used).size + self.free_footprint(succ) >= new_size {
                            self.free_remove(succ);
                            new_used = self.used_extend_up(used);
                            dest = null_mut();
                        }
                    }
                }
            }

            // Full relocation (below or above) if extending did not commit.
            if !dest.is_null() {
                self.free_remove(dest);
                let moved = self.free_to_used(dest);
                let keep = core::cmp::min(new_size, (*used).size);
                ptr::copy_nonoverlapping(
                    self.used_content(used).cast_const(),
                    self.used_content(moved),
                    keep,
                );
                let old = self.used_to_free(used);
                self.free_insert(old);
                self.free_merge(old);
                new_used = moved;
            }

            if new_used.is_null() {
                return Err(HeapError::ReallocFailed(new_size));
            }
            self.used_shrink(new_used, new_size);
            Ok(self.used_content(new_used))
        }
    }

    /// Grow a used section downward into the free section directly below it,
    /// moving the header and up to `preserve` content bytes.
    ///
    /// # Safety
    /// `free` must be the section immediately below `used` and already
    /// removed from the free list.
    unsafe fn used_extend_down(
        &mut self,
        free: *mut FreeHeader,
        used: *mut UsedHeader,
        preserve: usize,
    ) -> *mut UsedHeader {
        unsafe {
            let extra = self.free_footprint(free);
            let used_footprint = self.used_footprint(used);
            let move_len =
                core::cmp::min(preserve + self.used_header_size(), used_footprint);

            // Source and destination overlap; copy front-to-back.
            ptr::copy(used.cast::<u8>().cast_const(), free.cast::<u8>(), move_len);
            let used = free.cast::<UsedHeader>();
            (*used).size += extra;
            self.rekey_used(used);
            used
        }
    }

    /// Grow a used section into the free section directly above it.
    ///
    /// # Safety
    /// The section following `used` must be a free header already removed
    /// from the free list.
    unsafe fn used_extend_up(&mut self, used: *mut UsedHeader) -> *mut UsedHeader {
        unsafe {
            let free = self.after_used(used) as *mut FreeHeader;
            (*used).size += self.free_footprint(free);
            self.rekey_used(used);
            used
        }
    }

    /// Shrink a used section's content to `new_size`, materializing the slack
    /// as a new free section, but only when the slack can host a free header
    /// plus at least one content byte. Otherwise the section keeps its
    /// footprint and the slack stays as internal fragmentation.
    ///
    /// `new_size` must already be normalized.
    ///
    /// # Safety
    /// `used` must be a valid used header inside the region.
    pub(crate) unsafe fn used_shrink(&mut self, used: *mut UsedHeader, new_size: usize) {
        unsafe {
            if new_size >= (*used).size {
                return;
            }
            let free_header = self.free_header_size();
            if self.used_footprint(used) > self.used_header_size() + new_size + free_header {
                let free = (self.used_content(used) as usize + new_size) as *mut FreeHeader;
                (*free).size = (*used).size - new_size - free_header;
                self.rekey_free(free);
                #[cfg(feature = "caller-id")]
                {
                    (*free).owner = self.caller;
                }
                (*used).size = new_size;
                self.rekey_used(used);
                self.free_insert(free);
                self.free_merge_up(free);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{XorShift, crc32, with_heap};

    /// Fill `len` bytes behind `ptr` with noise and return their CRC.
    fn clutter(ptr: *mut u8, len: usize, rng: &mut XorShift) -> u32 {
        let content = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
        rng.fill(content);
        crc32(content)
    }

    fn crc_of(ptr: *const u8, len: usize) -> u32 {
        crc32(unsafe { core::slice::from_raw_parts(ptr, len) })
    }

    #[test]
    fn realloc_prefers_relocating_to_a_lower_hole() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(1);
            let a = heap.allocate(100).unwrap();
            let _b = heap.allocate(20).unwrap();
            let c = heap.allocate(20).unwrap();
            let d = heap.allocate(100).unwrap();
            let crc = clutter(d.as_ptr(), 100, &mut rng);
            unsafe {
                heap.free(a.as_ptr()).unwrap();
                heap.free(c.as_ptr()).unwrap();
                // The hole at a fits; it is below d, so d must move there,
                // not into the (too small) hole at c and not in place.
                let moved = heap.reallocate(d.as_ptr(), 100).unwrap();
                assert_eq!(moved, a.as_ptr());
                assert_eq!(crc_of(moved.cast_const(), 100), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_shrinks_in_place_when_no_lower_hole_fits() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(2);
            let a = heap.allocate(50).unwrap();
            let _b = heap.allocate(20).unwrap();
            let c = heap.allocate(100).unwrap();
            let crc = clutter(c.as_ptr(), 80, &mut rng);
            unsafe {
                heap.free(a.as_ptr()).unwrap();
                // The hole at a is too small for 80 bytes; c stays put.
                let kept = heap.reallocate(c.as_ptr(), 80).unwrap();
                assert_eq!(kept, c.as_ptr());
                assert_eq!(crc_of(kept.cast_const(), 80), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_extends_down_into_an_adjacent_hole() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(3);
            let _a = heap.allocate(100).unwrap();
            let b = heap.allocate(20).unwrap();
            let c = heap.allocate(100).unwrap();
            let crc = clutter(c.as_ptr(), 100, &mut rng);
            unsafe {
                heap.free(b.as_ptr()).unwrap();
                // The merged hole at b is too small to host 100 bytes on its
                // own, but extending c down into it succeeds and lowers c's
                // address to b's old spot.
                let moved = heap.reallocate(c.as_ptr(), 100).unwrap();
                assert_eq!(moved, b.as_ptr());
                assert_eq!(crc_of(moved.cast_const(), 100), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_extends_up_in_place() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(4);
            let a = heap.allocate(100).unwrap();
            let crc = clutter(a.as_ptr(), 100, &mut rng);
            unsafe {
                // Only the trailing free section is adjacent; a grows upward
                // without moving.
                let grown = heap.reallocate(a.as_ptr(), 200).unwrap();
                assert_eq!(grown, a.as_ptr());
                assert_eq!(crc_of(grown.cast_const(), 100), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_relocates_to_a_higher_hole_as_a_last_resort() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(5);
            let _a = heap.allocate(100).unwrap();
            let b = heap.allocate(20).unwrap();
            let _c = heap.allocate(100).unwrap();
            let d = heap.allocate(100).unwrap();
            unsafe {
                heap.free(d.as_ptr()).unwrap();
                let crc = clutter(b.as_ptr(), 20, &mut rng);
                // b cannot extend in either direction and no hole exists
                // below it; it moves up into d's old section.
                let moved = heap.reallocate(b.as_ptr(), 50).unwrap();
                assert_eq!(moved, d.as_ptr());
                assert_eq!(crc_of(moved.cast_const(), 20), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_null_behaves_like_allocate() {
        with_heap(10_000, |heap| {
            let p = unsafe { heap.reallocate(core::ptr::null_mut(), 64).unwrap() };
            assert!(!p.is_null());
            assert!(heap.contains(p));
            assert_eq!(heap.stats().allocations, 1);
            unsafe { heap.free(p).unwrap() };
        });
    }

    #[test]
    fn realloc_to_zero_behaves_like_free() {
        with_heap(10_000, |heap| {
            let before = heap.largest_free();
            let p = heap.allocate(64).unwrap();
            let out = unsafe { heap.reallocate(p.as_ptr(), 0).unwrap() };
            assert!(out.is_null());
            assert_eq!(heap.stats().allocations, 0);
            assert_eq!(heap.largest_free(), before);
        });
    }

    #[test]
    fn realloc_of_an_outside_pointer_is_rejected() {
        with_heap(10_000, |heap| {
            let mut outside = 0_u8;
            assert_eq!(
                unsafe { heap.reallocate(&raw mut outside, 64) },
                Err(HeapError::ReallocOutsideRegion)
            );
        });
    }

    #[cfg(feature = "integrity-checks")]
    #[test]
    fn realloc_of_a_freed_pointer_is_detected() {
        with_heap(10_000, |heap| {
            let keep = heap.allocate(64).unwrap();
            let p = heap.allocate(64).unwrap();
            unsafe {
                heap.free(p.as_ptr()).unwrap();
                assert_eq!(
                    heap.reallocate(p.as_ptr(), 32),
                    Err(HeapError::FalseRealloc)
                );
                heap.free(keep.as_ptr()).unwrap();
            }
        });
    }

    #[test]
    fn realloc_to_the_current_size_is_a_no_op() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(6);
            let _a = heap.allocate(50).unwrap();
            let _b = heap.allocate(20).unwrap();
            // c borders the trailing free section, so a same-size request
            // extends up and shrinks straight back without moving.
            let c = heap.allocate(96).unwrap();
            let crc = clutter(c.as_ptr(), 96, &mut rng);
            unsafe {
                let q = heap.reallocate(c.as_ptr(), 96).unwrap();
                assert_eq!(q, c.as_ptr());
                assert_eq!(crc_of(q.cast_const(), 96), crc);
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn realloc_failure_leaves_the_allocation_untouched() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(7);
            let p = heap.allocate(100).unwrap();
            let crc = clutter(p.as_ptr(), 100, &mut rng);
            unsafe {
                assert!(matches!(
                    heap.reallocate(p.as_ptr(), 50_000),
                    Err(HeapError::ReallocFailed(_) | HeapError::AllocationFailed(_))
                ));
                assert_eq!(crc_of(p.as_ptr().cast_const(), 100), crc);
                heap.free(p.as_ptr()).unwrap();
            }
        });
    }

    #[test]
    fn growth_preserves_the_old_content_exactly() {
        with_heap(10_000, |heap| {
            let mut rng = XorShift::new(8);
            for target in [128, 300, 1_000, 4_000] {
                let p = heap.allocate(100).unwrap();
                let crc = clutter(p.as_ptr(), 100, &mut rng);
                unsafe {
                    let q = heap.reallocate(p.as_ptr(), target).unwrap();
                    assert_eq!(crc_of(q.cast_const(), 100), crc, "target {target}");
                    heap.free(q).unwrap();
                }
            }
        });
    }
}
