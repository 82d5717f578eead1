//! Large-allocation delegate
//!
//! Anything above the largest size class bypasses the slabs and goes
//! straight to the system allocator. The delegate keeps no state and no
//! lock; the pool's allocation header carries the size back at free time,
//! which is all `std::alloc::dealloc` needs.

use crate::error::{Error, Result};
use crate::pool::size_class::{MAX_ALLOC_SIZE, MAX_SMALL_SIZE};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use tracing::debug;

/// Allocations from the delegate share the slabs' 16-byte alignment.
const LARGE_ALIGN: usize = 16;

/// Pass-through to the system allocator for oversized requests.
#[derive(Debug, Default)]
pub struct LargeDelegate;

impl LargeDelegate {
    /// Obtain a 16-byte-aligned block of exactly `size` bytes.
    pub fn allocate_item(&self, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            size > MAX_SMALL_SIZE,
            "{}-byte request belongs in a small-class slab",
            size
        );
        if size > MAX_ALLOC_SIZE {
            return Err(Error::TooLarge(size));
        }

        let layout = Self::layout(size);
        let ptr =
            NonNull::new(unsafe { alloc(layout) }).unwrap_or_else(|| handle_alloc_error(layout));

        debug!(size, "large allocation from the system allocator");
        Ok(ptr)
    }

    /// Release a block obtained from `allocate_item` with the same `size`.
    pub fn deallocate_item(&self, ptr: NonNull<u8>, size: usize) {
        unsafe { dealloc(ptr.as_ptr(), Self::layout(size)) };
        debug!(size, "returned large allocation to the system allocator");
    }

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, LARGE_ALIGN).expect("large allocation layout")
    }
}
