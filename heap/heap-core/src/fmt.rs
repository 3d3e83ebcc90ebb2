//! Formatted printing straight into a heap allocation.
//!
//! A measuring pass with a counting sink determines the rendered length, an
//! allocation of exactly that size is made, and a second pass renders into
//! it. `core::fmt::Arguments` renders identically on both passes unless a
//! `Display` implementation misbehaves, which is reported instead of trusted.

use core::fmt::{self, Write};
#[cfg(feature = "caller-id")]
use core::panic::Location;
use core::ptr::NonNull;

use crate::heap::Heap;
use crate::HeapError;

/// Discards its input and counts the bytes that passed through.
#[derive(Default)]
struct CountingSink {
    len: usize,
}

impl Write for CountingSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.len += s.len();
        Ok(())
    }
}

/// Writes into a fixed raw-byte window, refusing to overrun it.
struct SliceSink {
    ptr: *mut u8,
    cap: usize,
    len: usize,
}

impl Write for SliceSink {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.len + s.len() > self.cap {
            return Err(fmt::Error);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), self.ptr.add(self.len), s.len());
        }
        self.len += s.len();
        Ok(())
    }
}

impl Heap {
    /// Render `args` into a fresh allocation and return it as a string.
    ///
    /// The result lives in the heap region; release it with
    /// [`free`](Self::free) on the byte pointer (`result.cast()`).
    ///
    /// ```
    /// use heap_core::Heap;
    ///
    /// #[repr(align(8))]
    /// struct Backing([u8; 1024]);
    ///
    /// let mut backing = Backing([0; 1024]);
    /// let mut heap = Heap::new();
    /// unsafe { heap.init(backing.0.as_mut_ptr(), 1024) };
    ///
    /// let s = heap.format(format_args!("sensor {} = {}", 3, 91)).unwrap();
    /// assert_eq!(unsafe { s.as_ref() }, "sensor 3 = 91");
    /// unsafe { heap.free(s.cast().as_ptr()).unwrap() };
    /// ```
    ///
    /// # Errors
    /// - [`HeapError::AllocationFailed`] if the rendered text does not fit.
    /// - [`HeapError::FormatFailed`] if a `Display` implementation rendered a
    ///   different length on the second pass (the allocation is released).
    /// - [`HeapError::Broken`] / [`HeapError::Uninitialized`] as for
    ///   [`allocate`](Self::allocate).
    #[track_caller]
    pub fn format(&mut self, args: fmt::Arguments<'_>) -> Result<NonNull<str>, HeapError> {
        #[cfg(feature = "caller-id")]
        {
            self.caller = Location::caller();
        }
        let mut counter = CountingSink::default();
        if counter.write_fmt(args).is_err() {
            return Err(HeapError::FormatFailed);
        }
        let len = counter.len;

        let ptr = self.allocate_inner(len)?;
        let mut sink = SliceSink {
            ptr: ptr.as_ptr(),
            cap: len,
            len: 0,
        };
        if sink.write_fmt(args).is_err() || sink.len != len {
            let _ = self.free_inner(ptr.as_ptr());
            return Err(HeapError::FormatFailed);
        }

        let slice = core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len);
        // Safety: the sink wrote exactly `len` bytes of UTF-8 string data.
        Ok(unsafe { NonNull::new_unchecked(slice as *mut str) })
    }
}
