//! Thread-safe pool façade
//!
//! Dispatches allocations to the twelve small-class slabs or the large
//! delegate and maintains the in-band header that lets `deallocate` recover
//! the routing size from the pointer alone. The pool lock covers only the
//! slab-selection step; the actual allocation runs under the chosen slab's
//! own lock, so callers in different classes never serialize on each other.

use crate::error::{Error, Result};
use crate::pool::large::LargeDelegate;
use crate::pool::size_class::{select_slab, SlabSelector, MAX_ALLOC_SIZE, SIZE_CLASSES};
use crate::pool::slab::{SizeClassStats, SmallSlab};
use crate::sync::SpinLock;
use serde::{Deserialize, Serialize};
use std::ptr::{self, NonNull};
use tracing::info;

/// Alignment applied when `allocate` is called without one.
pub const DEFAULT_ALIGNMENT: usize = 8;

/// The header is at least this big so the size field always fits in front
/// of the user data.
const HEADER_MIN: usize = 8;

/// A self-contained allocation arena.
///
/// Owns one slab per size class plus the large delegate. Thread-safe; every
/// pointer handed out stays valid until it is deallocated or the pool is
/// dropped.
pub struct Pool {
    small_slabs: Vec<SmallSlab>,
    large: LargeDelegate,
    routing: SpinLock<()>,
}

impl Pool {
    /// Create a pool with one (still empty) slab per size class.
    pub fn new() -> Self {
        let small_slabs = SIZE_CLASSES.iter().map(|&size| SmallSlab::new(size)).collect();
        info!(
            classes = SIZE_CLASSES.len(),
            "initializing slab pool"
        );

        Self {
            small_slabs,
            large: LargeDelegate,
            routing: SpinLock::new(()),
        }
    }

    /// Allocate `size` bytes at the default 8-byte alignment.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    /// Allocate `size` bytes aligned to `align` (4, 8, or 16).
    ///
    /// The returned pointer sits directly past a header of
    /// `max(8, align)` bytes recording the header length and the full
    /// allocation size; `deallocate` reads both back from the pointer.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>> {
        if size > MAX_ALLOC_SIZE {
            return Err(Error::TooLarge(size));
        }
        if !matches!(align, 4 | 8 | 16) {
            return Err(Error::BadAlignment(align));
        }

        let header_size = align.max(HEADER_MIN);
        let alloc_size = size + header_size;

        // Route under the pool lock, then release it before delegating so
        // concurrent callers in different classes only contend on their own
        // slab's lock.
        let selector = {
            let _routing = self.routing.lock();
            select_slab(alloc_size)
        };

        let raw = match selector {
            SlabSelector::Small(index) => self.small_slabs[index].allocate_item(alloc_size)?,
            SlabSelector::Large => self.large.allocate_item(alloc_size)?,
        };

        unsafe {
            let raw = raw.as_ptr();
            *raw.add(header_size - 5) = header_size as u8;
            let encoded = (alloc_size as u32).to_ne_bytes();
            ptr::copy_nonoverlapping(encoded.as_ptr(), raw.add(header_size - 4), 4);

            let user = raw.add(header_size);
            debug_assert_eq!(user as usize % align, 0);
            Ok(NonNull::new_unchecked(user))
        }
    }

    /// Release an allocation. A null pointer is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by `allocate` /
    /// `allocate_aligned` on this pool whose header bytes are intact. For
    /// large allocations it must not have been freed already; small-slab
    /// double frees are caught and reported as errors.
    pub unsafe fn deallocate(&self, ptr: *mut u8) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }

        let mut encoded = [0u8; 4];
        ptr::copy_nonoverlapping(ptr.sub(4), encoded.as_mut_ptr(), 4);
        let alloc_size = u32::from_ne_bytes(encoded) as usize;
        let header_size = *ptr.sub(5) as usize;

        assert!(
            header_size == 8 || header_size == 16,
            "corrupt allocation header: header size {}",
            header_size
        );
        assert!(
            alloc_size >= header_size,
            "corrupt allocation header: allocation size {} under header size {}",
            alloc_size,
            header_size
        );

        let raw = NonNull::new_unchecked(ptr.sub(header_size));

        let selector = {
            let _routing = self.routing.lock();
            select_slab(alloc_size)
        };

        match selector {
            SlabSelector::Small(index) => self.small_slabs[index].deallocate_item(raw),
            SlabSelector::Large => {
                self.large.deallocate_item(raw, alloc_size);
                Ok(())
            }
        }
    }

    /// Per-class occupancy plus the total chunk footprint.
    pub fn stats(&self) -> PoolStats {
        let size_classes: Vec<_> = self.small_slabs.iter().map(SmallSlab::stats).collect();
        let total_allocated = size_classes.iter().map(|stats| stats.allocated_bytes).sum();

        PoolStats {
            size_classes,
            total_allocated,
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for the whole pool.
#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub size_classes: Vec<SizeClassStats>,
    /// Chunk bytes held across all classes; large allocations are not
    /// tracked (the delegate keeps no bookkeeping).
    pub total_allocated: usize,
}
