//! The free list: all free sections, singly linked, strictly ascending by
//! address, null-terminated.
//!
//! Every operation here is a linear walk. The section count is bounded by the
//! region size, and this allocator trades speed for verifiability, so O(F)
//! list work is accepted throughout.

use core::ptr::null_mut;

use crate::Heap;
use crate::section::FreeHeader;

impl Heap {
    /// Find the first free section able to host `size` content bytes as a
    /// used section, or null.
    ///
    /// # Safety
    /// The free list must be intact.
    pub(crate) unsafe fn free_walk(&self, size: usize) -> *mut FreeHeader {
        let Some(need) = self.used_header_size().checked_add(size) else {
            return null_mut();
        };
        let mut free = self.first_free;
        while !free.is_null() && unsafe { self.free_footprint(free) } < need {
            free = unsafe { (*free).next };
        }
        free
    }

    /// Splice `new_free` into the list at its address-ordered position.
    ///
    /// # Safety
    /// `new_free` must be a valid free header inside the region that is not
    /// currently linked.
    pub(crate) unsafe fn free_insert(&mut self, new_free: *mut FreeHeader) {
        // Walk the links until one points past the new section (or the end).
        let mut link = &raw mut self.first_free;
        unsafe {
            while !(*link).is_null() && ((*link) as usize) < new_free as usize {
                link = &raw mut (**link).next;
            }
            (*new_free).next = *link;
            *link = new_free;
        }
    }

    /// Unlink `free` from the list.
    ///
    /// # Safety
    /// `free` must currently be linked.
    pub(crate) unsafe fn free_remove(&mut self, free: *mut FreeHeader) {
        let mut link = &raw mut self.first_free;
        unsafe {
            while *link != free {
                link = &raw mut (**link).next;
            }
            *link = (*free).next;
        }
    }

    /// Highest-address free section strictly below `target`, or null.
    ///
    /// # Safety
    /// The free list must be intact.
    pub(crate) unsafe fn find_free_below(&self, target: usize) -> *mut FreeHeader {
        let mut found = null_mut();
        let mut free = self.first_free;
        while !free.is_null() && (free as usize) < target {
            found = free;
            free = unsafe { (*free).next };
        }
        found
    }

    /// Linear membership test.
    ///
    /// Only compares addresses; `addr` is never dereferenced, so it may point
    /// at a used section or one past the region end.
    ///
    /// # Safety
    /// The free list must be intact.
    pub(crate) unsafe fn in_free_list(&self, addr: usize) -> bool {
        let mut free = self.first_free;
        while !free.is_null() {
            if free as usize == addr {
                return true;
            }
            free = unsafe { (*free).next };
        }
        false
    }

    /// Merge `free` with its adjacent free neighbors on both sides.
    ///
    /// # Safety
    /// `free` and its neighbors must already be linked.
    pub(crate) unsafe fn free_merge(&mut self, free: *mut FreeHeader) {
        unsafe {
            self.free_merge_up(free);
            let below = self.find_free_below(free as usize);
            if !below.is_null() {
                self.free_merge_up(below);
            }
        }
    }

    /// Absorb the next free section into `free` if the two abut.
    ///
    /// The swallowed header's key is overwritten with `KEY_MERGED` so the dead
    /// header is recognizable in a memory dump.
    ///
    /// # Safety
    /// `free` must be a valid, linked free header.
    pub(crate) unsafe fn free_merge_up(&mut self, free: *mut FreeHeader) {
        unsafe {
            let next = (*free).next;
            if next.is_null() || next as usize != self.after_free(free) {
                return;
            }
            (*free).size += self.free_footprint(next);
            self.rekey_free(free);
            #[cfg(feature = "keys")]
            {
                (*next).key = crate::section::KEY_MERGED;
            }
            (*free).next = (*next).next;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::with_heap;

    /// Walk the free list and return the (address, footprint) of every entry.
    fn free_spans(heap: &crate::Heap) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut free = heap.first_free;
        while !free.is_null() {
            unsafe {
                spans.push((free as usize, heap.free_footprint(free)));
                free = (*free).next;
            }
        }
        spans
    }

    #[test]
    fn freeing_out_of_order_keeps_the_list_ascending() {
        with_heap(10_000, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let c = heap.allocate(100).unwrap();
            let d = heap.allocate(100).unwrap();

            // Free in a scrambled order; the list must stay address-sorted.
            unsafe {
                heap.free(c.as_ptr()).unwrap();
                heap.free(a.as_ptr()).unwrap();
                heap.free(d.as_ptr()).unwrap();
            }
            let spans = free_spans(heap);
            assert!(spans.windows(2).all(|w| w[0].0 < w[1].0));
            assert!(heap.is_intact());

            // b is still live, so a and c/d cannot have merged across it.
            assert_eq!(spans.len(), 2);
            unsafe { heap.free(b.as_ptr()).unwrap() };
        });
    }

    #[test]
    fn adjacent_free_sections_always_merge() {
        with_heap(10_000, |heap| {
            let a = heap.allocate(64).unwrap();
            let b = heap.allocate(64).unwrap();
            let c = heap.allocate(64).unwrap();

            unsafe {
                heap.free(a.as_ptr()).unwrap();
                heap.free(b.as_ptr()).unwrap();
            }
            // a and b merged into one leading free section; the tail free
            // section stays separate behind c.
            assert_eq!(free_spans(heap).len(), 2);

            unsafe { heap.free(c.as_ptr()).unwrap() };
            // Everything merged back into a single free section.
            let spans = free_spans(heap);
            assert_eq!(spans.len(), 1);
            assert_eq!(spans[0].1, 10_000);
        });
    }

    #[test]
    fn no_two_free_sections_are_ever_adjacent() {
        with_heap(10_000, |heap| {
            let mut slots = Vec::new();
            for i in 0..16 {
                slots.push(heap.allocate(16 + i * 8).unwrap());
            }
            // Free every second slot, then the rest.
            for p in slots.iter().step_by(2) {
                unsafe { heap.free(p.as_ptr()).unwrap() };
            }
            for p in slots.iter().skip(1).step_by(2) {
                unsafe { heap.free(p.as_ptr()).unwrap() };
            }
            let spans = free_spans(heap);
            assert!(spans.windows(2).all(|w| w[0].0 + w[0].1 < w[1].0));
            assert_eq!(spans.len(), 1);
        });
    }

    #[test]
    fn find_free_below_returns_the_closest_lower_section() {
        with_heap(10_000, |heap| {
            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(100).unwrap();
            let c = heap.allocate(100).unwrap();
            unsafe {
                heap.free(a.as_ptr()).unwrap();
                let below = heap.find_free_below(heap.used_from_content(c.as_ptr()) as usize);
                // a's section is the only free section below c.
                assert_eq!(below as usize, heap.used_from_content(a.as_ptr()) as usize);
                assert!(heap.find_free_below(below as usize).is_null());
                heap.free(b.as_ptr()).unwrap();
                heap.free(c.as_ptr()).unwrap();
            }
        });
    }
}
