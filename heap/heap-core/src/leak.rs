//! Leak attribution.
//!
//! With the `caller-id` feature every section carries the source location of
//! the call that last touched it. [`Heap::find_leak`] reports the call site
//! holding the most live allocations (on a device that slowly runs out of
//! heap, that is almost always the leak) and [`Heap::list`] enumerates the
//! live allocations for dump-style debugging.

use core::panic::Location;
use core::ptr::NonNull;

use crate::heap::Heap;
use crate::section::{FreeHeader, UsedHeader};

/// The call site currently holding the most live allocations.
#[derive(Debug, Copy, Clone)]
pub struct LeakReport {
    /// Source location stamped on the allocations.
    pub owner: &'static Location<'static>,
    /// Number of live allocations stamped with `owner`.
    pub count: u32,
}

/// One live allocation, as enumerated by [`Heap::list`].
#[derive(Debug, Copy, Clone)]
pub struct Allocation {
    /// Call site that allocated (or last reallocated) this section.
    pub owner: &'static Location<'static>,
    /// Content size in bytes, after normalization.
    pub size: usize,
    /// Content address.
    pub ptr: NonNull<u8>,
}

/// A walk position: a section address plus the next free section at or after
/// it. Tracking the free list alongside the address walk is what lets the
/// cursor classify sections without keys.
#[derive(Copy, Clone)]
struct UsedCursor {
    at: usize,
    next_free: *mut FreeHeader,
}

impl Heap {
    /// Cursor on the lowest-address used section (or the region end).
    fn used_cursor(&self) -> UsedCursor {
        let mut cursor = UsedCursor {
            at: self.base as usize,
            next_free: self.first_free,
        };
        unsafe { self.skip_free_run(&mut cursor) };
        cursor
    }

    /// Move the cursor past any free sections it currently rests on.
    ///
    /// # Safety
    /// The section chain must be intact.
    unsafe fn skip_free_run(&self, cursor: &mut UsedCursor) {
        while cursor.at != self.end() && cursor.at == cursor.next_free as usize {
            let free = cursor.at as *const FreeHeader;
            unsafe {
                cursor.next_free = (*free).next;
                cursor.at += self.free_footprint(free);
            }
        }
    }

    /// Advance from the used section under the cursor to the next used
    /// section (or the region end).
    ///
    /// # Safety
    /// The cursor must rest on a used section of an intact chain.
    unsafe fn advance_used(&self, cursor: &mut UsedCursor) {
        unsafe {
            cursor.at += self.used_footprint(cursor.at as *const UsedHeader);
            self.skip_free_run(cursor);
        }
    }

    /// Report the call site holding the most live allocations, or `None` when
    /// nothing is allocated.
    ///
    /// Runs in O(n²) over the section count and allocates nothing itself, so
    /// it is safe to call from a low-memory handler.
    #[must_use]
    pub fn find_leak(&self) -> Option<LeakReport> {
        let end = self.end();
        let mut best: Option<LeakReport> = None;

        let mut base = self.used_cursor();
        let mut have_base = self.initialized && base.at != end;
        while have_base {
            let owner = unsafe { (*(base.at as *const UsedHeader)).owner };
            let mut scan = base;
            let mut count = 0_u32;
            have_base = false;
            while scan.at != end {
                let other = unsafe { (*(scan.at as *const UsedHeader)).owner };
                if other == owner {
                    count += 1;
                } else if !have_base {
                    // Next round starts at the first differently-owned
                    // section; already-counted owners recount but can never
                    // win again.
                    base = scan;
                    have_base = true;
                }
                unsafe { self.advance_used(&mut scan) };
            }
            if best.is_none_or(|record| count > record.count) {
                best = Some(LeakReport { owner, count });
            }
        }
        best
    }

    /// The `index`-th live allocation in address order, or `None` when out of
    /// range.
    #[must_use]
    pub fn list(&self, index: usize) -> Option<Allocation> {
        if !self.initialized {
            return None;
        }
        let end = self.end();
        let mut cursor = self.used_cursor();
        let mut i = 0;
        while cursor.at != end {
            let used = cursor.at as *mut UsedHeader;
            if i == index {
                let (owner, size) = unsafe { ((*used).owner, (*used).size) };
                return Some(Allocation {
                    owner,
                    size,
                    ptr: NonNull::new(self.used_content(used))?,
                });
            }
            i += 1;
            unsafe { self.advance_used(&mut cursor) };
        }
        None
    }
}
