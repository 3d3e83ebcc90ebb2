//! Allocation counters and the largest-free/head-room tracking.

use crate::heap::Heap;

/// Counters describing the current and historical heap occupancy.
///
/// `largest_free` and `head_room` exist with the `track-stats` feature and
/// are refreshed after every successful mutating operation; `head_room` is
/// the smallest value `largest_free` has taken since the region was bound (or
/// last reset), i.e. the closest the heap has come to exhaustion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live allocations.
    pub allocations: u32,
    /// Highest number of simultaneously live allocations observed.
    pub allocations_max: u32,
    /// Cached largest currently-allocatable content size, in bytes.
    #[cfg(feature = "track-stats")]
    pub largest_free: usize,
    /// Minimum `largest_free` has taken since initialization.
    #[cfg(feature = "track-stats")]
    pub head_room: usize,
}

impl HeapStats {
    pub(crate) const fn new() -> Self {
        Self {
            allocations: 0,
            allocations_max: 0,
            #[cfg(feature = "track-stats")]
            largest_free: 0,
            #[cfg(feature = "track-stats")]
            head_room: 0,
        }
    }

    pub(crate) const fn note_allocated(&mut self) {
        self.allocations += 1;
        if self.allocations > self.allocations_max {
            self.allocations_max = self.allocations;
        }
    }

    pub(crate) const fn note_freed(&mut self) {
        self.allocations = self.allocations.saturating_sub(1);
    }
}

impl Heap {
    /// Scan the free list for the largest section and convert it to the
    /// content size it would offer as a used section (free and used headers
    /// differ in size, so the difference is allocatable).
    pub(crate) unsafe fn scan_largest_free(&self) -> usize {
        if self.first_free.is_null() {
            return 0;
        }
        let mut largest = 0;
        let mut free = self.first_free;
        while !free.is_null() {
            unsafe {
                if (*free).size > largest {
                    largest = (*free).size;
                }
                free = (*free).next;
            }
        }
        let total = largest + self.free_header_size();
        if total >= self.used_header_size() {
            total - self.used_header_size()
        } else {
            0
        }
    }

    /// Refresh the cached largest-free value and fold it into the head-room
    /// minimum. Called after every successful mutating operation.
    #[cfg(feature = "track-stats")]
    pub(crate) fn refresh_largest(&mut self) {
        let largest = unsafe { self.scan_largest_free() };
        self.stats.largest_free = largest;
        if largest < self.stats.head_room {
            self.stats.head_room = largest;
        }
    }
}
