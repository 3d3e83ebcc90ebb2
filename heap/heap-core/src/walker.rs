//! The integrity walker: a linear traversal of the section chain,
//! cross-checked against the free list.
//!
//! With the `keys` feature each section is classified by its stored key; a
//! free-classified section must then also be the next entry of a parallel
//! free-list walk. Without keys, free-list membership itself is the
//! classifier. Either way a region is only intact if the walk lands exactly
//! on the region end.

use crate::HeapError;
use crate::heap::Heap;
use crate::section::FreeHeader;

impl Heap {
    /// Walk the whole region and verify the section chain.
    ///
    /// When `target` is the address of a used header, additionally verify the
    /// walk encountered it; [`HeapError::FalseFree`] otherwise (callers remap
    /// this to [`HeapError::FalseRealloc`] where appropriate). An unbound
    /// heap passes vacuously.
    ///
    /// # Safety
    /// The region fields must be consistent; the region itself may be in any
    /// state (that is the point).
    pub(crate) unsafe fn check_region(&self, target: Option<usize>) -> Result<(), HeapError> {
        if !self.initialized {
            return Ok(());
        }
        let end = self.end();
        let mut at = self.base as usize;
        let mut next_free = self.first_free;
        let mut target_found = false;

        while at != end {
            let footprint;

            #[cfg(feature = "keys")]
            {
                // The key and size prefix is shared by both header variants.
                let header = at as *const FreeHeader;
                let size = unsafe { (*header).size };
                let key = unsafe { (*header).key };
                if key == (size ^ crate::section::KEY_FREE) {
                    if at != next_free as usize {
                        log::error!(
                            "free section at {at:#x} is not the expected free-list entry {next_free:p}"
                        );
                        return Err(HeapError::Broken);
                    }
                    next_free = unsafe { (*header).next };
                    footprint = self.free_header_size() + size;
                } else if key == (size ^ crate::section::KEY_USED) {
                    if target == Some(at) {
                        target_found = true;
                    }
                    footprint = self.used_header_size() + size;
                } else {
                    log::error!("section at {at:#x} carries a corrupted key");
                    return Err(HeapError::Broken);
                }
            }

            #[cfg(not(feature = "keys"))]
            {
                if at == next_free as usize {
                    let header = at as *const FreeHeader;
                    next_free = unsafe { (*header).next };
                    footprint = self.free_header_size() + unsafe { (*header).size };
                } else {
                    let header = at as *const crate::section::UsedHeader;
                    if target == Some(at) {
                        target_found = true;
                    }
                    footprint = self.used_header_size() + unsafe { (*header).size };
                }
            }

            at = match at.checked_add(footprint) {
                Some(next) if next <= end => next,
                _ => {
                    log::error!("section at {at:#x} steps outside the region");
                    return Err(HeapError::Broken);
                }
            };
        }

        if target.is_some() && !target_found {
            return Err(HeapError::FalseFree);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::with_heap;

    #[test]
    fn a_fresh_heap_is_intact() {
        with_heap(10_000, |heap| {
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn a_busy_heap_is_intact() {
        with_heap(10_000, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(20).unwrap();
            let _c = heap.allocate(100).unwrap();
            unsafe {
                heap.free(b.as_ptr()).unwrap();
                let _ = heap.reallocate(a.as_ptr(), 300).unwrap();
            }
            assert!(heap.is_intact());
        });
    }

    #[test]
    fn clobbering_a_used_header_is_detected() {
        with_heap(10_000, |heap| {
            let _a = heap.allocate(100).unwrap();
            let b = heap.allocate(20).unwrap();
            let _c = heap.allocate(100).unwrap();
            assert!(heap.is_intact());
            // Overwrite the header bytes immediately preceding b's content.
            unsafe {
                let header = b.as_ptr().sub(16);
                core::ptr::write_bytes(header, 0xFF, 16);
            }
            assert!(!heap.is_intact());
        });
    }

    #[test]
    fn clobbering_a_free_link_is_detected() {
        with_heap(10_000, |heap| {
            let _a = heap.allocate(100).unwrap();
            let b = heap.allocate(20).unwrap();
            let _c = heap.allocate(100).unwrap();
            unsafe {
                heap.free(b.as_ptr()).unwrap();
            }
            assert!(heap.is_intact());
            // b's section is free now; trash the byte right before its old
            // content, which lands inside the free header.
            unsafe {
                *b.as_ptr().sub(1) = 0xFF;
            }
            assert!(!heap.is_intact());
        });
    }

    #[cfg(feature = "integrity-checks")]
    #[test]
    fn mutating_operations_refuse_a_broken_heap() {
        use crate::HeapError;

        with_heap(10_000, |heap| {
            let a = heap.allocate(100).unwrap();
            unsafe {
                core::ptr::write_bytes(a.as_ptr().sub(16), 0xFF, 16);
            }
            assert_eq!(heap.allocate(16), Err(HeapError::Broken));
            assert_eq!(unsafe { heap.free(a.as_ptr()) }, Err(HeapError::Broken));
            assert_eq!(
                unsafe { heap.reallocate(a.as_ptr(), 50) },
                Err(HeapError::Broken)
            );
        });
    }
}
