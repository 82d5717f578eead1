//! Small-class slab: fixed-size slots carved out of growable chunks
//!
//! Each slab owns a list of 16-byte-aligned raw chunks. Slot occupancy is a
//! packed bitmap per chunk (find-first-zero is a trailing-zero count on the
//! complemented word), an any-free bitmap picks the lowest chunk with room,
//! and an ordered base-address index answers "which chunk owns pointer p"
//! for deallocation. Chunks are never returned to the OS before the slab is
//! dropped, so a slab's footprint only grows.

use crate::error::{Error, Result};
use crate::sync::SpinLock;
use serde::{Deserialize, Serialize};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use tracing::debug;

/// Chunk buffers are aligned to this, and every class size is a multiple of
/// it, so each slot inherits 16-byte alignment.
pub const CHUNK_ALIGN: usize = 16;

/// Smallest chunk; classes under 1 KiB all use exactly this.
const MIN_CHUNK_BYTES: usize = 4096;

/// Chunks stop growing once a class holds 4 GiB worth of buffers.
const MAX_CLASS_BYTES: usize = 4 << 30;

/// One raw buffer of `chunk_bytes`, carved into equal slots.
struct Chunk {
    base: NonNull<u8>,
    /// One bit per slot; 1 = allocated.
    occupancy: Vec<u64>,
    used: usize,
}

// The buffer behind `base` is owned exclusively by the slab that allocated
// it and only touched under that slab's lock.
unsafe impl Send for Chunk {}

struct SlabState {
    chunks: Vec<Chunk>,
    /// One bit per chunk; 1 = chunk has at least one free slot.
    any_free: Vec<u64>,
    /// Chunk base address → chunk index, ordered for greatest-base-≤-p lookup.
    base_index: BTreeMap<usize, usize>,
}

/// A pool of fixed-size slots for one size class.
pub struct SmallSlab {
    elem_size: usize,
    chunk_bytes: usize,
    slots_per_chunk: usize,
    max_chunks: usize,
    state: SpinLock<SlabState>,
}

impl SmallSlab {
    /// Create an empty slab serving items of up to `elem_size` bytes.
    ///
    /// `elem_size` must be a multiple of 16 so slots stay aligned with their
    /// chunk. No memory is reserved until the first allocation.
    pub fn new(elem_size: usize) -> Self {
        assert!(
            elem_size >= CHUNK_ALIGN && elem_size % CHUNK_ALIGN == 0,
            "element size must be a positive multiple of {}",
            CHUNK_ALIGN
        );

        let chunk_bytes = if elem_size < 1024 {
            MIN_CHUNK_BYTES
        } else {
            4 * elem_size
        };

        debug!(elem_size, chunk_bytes, "created slab");

        Self {
            elem_size,
            chunk_bytes,
            slots_per_chunk: chunk_bytes / elem_size,
            max_chunks: MAX_CLASS_BYTES / chunk_bytes,
            state: SpinLock::new(SlabState {
                chunks: Vec::new(),
                any_free: Vec::new(),
                base_index: BTreeMap::new(),
            }),
        }
    }

    /// Allocate one slot. Requires `size <= elem_size`.
    ///
    /// Always returns the lowest free slot of the lowest chunk with room,
    /// growing by one chunk when every existing slot is taken.
    pub fn allocate_item(&self, size: usize) -> Result<NonNull<u8>> {
        debug_assert!(
            size <= self.elem_size,
            "requested {} bytes from a {}-byte class",
            size,
            self.elem_size
        );

        let mut state = self.state.lock();

        let chunk_index = match find_first_set(&state.any_free, state.chunks.len()) {
            Some(index) => index,
            None => self.grow(&mut state)?,
        };

        let (ptr, now_full) = {
            let chunk = &mut state.chunks[chunk_index];
            let slot = find_first_zero(&chunk.occupancy, self.slots_per_chunk)
                .expect("any-free bitmap out of sync with chunk occupancy");
            set_bit(&mut chunk.occupancy, slot);
            chunk.used += 1;
            let ptr = unsafe { chunk.base.as_ptr().add(slot * self.elem_size) };
            (ptr, chunk.used == self.slots_per_chunk)
        };

        if now_full {
            clear_bit(&mut state.any_free, chunk_index);
        }

        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    /// Return one slot.
    ///
    /// Fails with `ForeignPointer` when `ptr` lies in none of this slab's
    /// chunks and with `DoubleFree` when the slot is already free; the slab
    /// is left untouched in both cases.
    pub fn deallocate_item(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let mut state = self.state.lock();

        let (base, chunk_index) = match state.base_index.range(..=addr).next_back() {
            Some((&base, &index)) if addr - base < self.chunk_bytes => (base, index),
            _ => return Err(Error::ForeignPointer(addr)),
        };

        let slot = (addr - base) / self.elem_size;
        let chunk = &mut state.chunks[chunk_index];
        if !test_bit(&chunk.occupancy, slot) {
            return Err(Error::DoubleFree(addr));
        }

        clear_bit(&mut chunk.occupancy, slot);
        chunk.used -= 1;
        set_bit(&mut state.any_free, chunk_index);
        Ok(())
    }

    /// Total bytes of chunk memory this slab holds. Never decreases.
    pub fn allocated_memory(&self) -> usize {
        self.state.lock().chunks.len() * self.chunk_bytes
    }

    /// Slot size of this class.
    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    /// Buffer size of each chunk.
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Occupancy snapshot for this class.
    pub fn stats(&self) -> SizeClassStats {
        let state = self.state.lock();
        let used_slots = state.chunks.iter().map(|chunk| chunk.used).sum();
        SizeClassStats {
            elem_size: self.elem_size,
            chunk_count: state.chunks.len(),
            allocated_bytes: state.chunks.len() * self.chunk_bytes,
            used_slots,
            total_slots: state.chunks.len() * self.slots_per_chunk,
        }
    }

    /// Append one chunk and index it. Fails when the class is at its cap.
    fn grow(&self, state: &mut SlabState) -> Result<usize> {
        if state.chunks.len() == self.max_chunks {
            return Err(Error::CapacityExhausted(self.elem_size));
        }

        let layout = self.chunk_layout();
        let base = NonNull::new(unsafe { alloc(layout) })
            .unwrap_or_else(|| handle_alloc_error(layout));

        let index = state.chunks.len();
        let occupancy_words = (self.slots_per_chunk + 63) / 64;
        state.chunks.push(Chunk {
            base,
            occupancy: vec![0; occupancy_words],
            used: 0,
        });
        if index >> 6 >= state.any_free.len() {
            state.any_free.push(0);
        }
        set_bit(&mut state.any_free, index);
        state.base_index.insert(base.as_ptr() as usize, index);

        debug!(
            elem_size = self.elem_size,
            chunks = index + 1,
            "grew slab by one chunk"
        );
        Ok(index)
    }

    fn chunk_layout(&self) -> Layout {
        Layout::from_size_align(self.chunk_bytes, CHUNK_ALIGN).expect("chunk layout")
    }
}

impl Drop for SmallSlab {
    fn drop(&mut self) {
        let layout = self.chunk_layout();
        for chunk in self.state.get_mut().chunks.drain(..) {
            unsafe { dealloc(chunk.base.as_ptr(), layout) };
        }
    }
}

/// Occupancy snapshot of one size class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SizeClassStats {
    pub elem_size: usize,
    pub chunk_count: usize,
    pub allocated_bytes: usize,
    pub used_slots: usize,
    pub total_slots: usize,
}

fn set_bit(words: &mut [u64], index: usize) {
    words[index >> 6] |= 1 << (index & 63);
}

fn clear_bit(words: &mut [u64], index: usize) {
    words[index >> 6] &= !(1 << (index & 63));
}

fn test_bit(words: &[u64], index: usize) -> bool {
    words[index >> 6] >> (index & 63) & 1 == 1
}

/// Lowest set bit below `limit`, scanning from bit 0.
fn find_first_set(words: &[u64], limit: usize) -> Option<usize> {
    for (word_index, &word) in words.iter().enumerate() {
        if word != 0 {
            let index = (word_index << 6) | word.trailing_zeros() as usize;
            return (index < limit).then_some(index);
        }
    }
    None
}

/// Lowest clear bit below `limit`, scanning from bit 0.
fn find_first_zero(words: &[u64], limit: usize) -> Option<usize> {
    for (word_index, &word) in words.iter().enumerate() {
        if word != u64::MAX {
            let index = (word_index << 6) | (!word).trailing_zeros() as usize;
            return (index < limit).then_some(index);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_growth_and_no_shrink() {
        let slab = SmallSlab::new(128);
        assert_eq!(slab.allocated_memory(), 0);

        // 32 slots per 4 KiB chunk: the 33rd allocation forces chunk two,
        // the 65th forces chunk three.
        let mut pointers = Vec::new();
        for i in 0..65 {
            pointers.push(slab.allocate_item(128).unwrap());
            match i {
                0..=31 => assert_eq!(slab.allocated_memory(), 4096),
                32..=63 => assert_eq!(slab.allocated_memory(), 8192),
                _ => assert_eq!(slab.allocated_memory(), 12288),
            }
        }

        for ptr in pointers.drain(..) {
            slab.deallocate_item(ptr).unwrap();
        }
        assert_eq!(slab.allocated_memory(), 12288);

        // Reallocating fills the existing chunks; the footprint stays put
        for _ in 0..65 {
            pointers.push(slab.allocate_item(128).unwrap());
        }
        assert_eq!(slab.allocated_memory(), 12288);
    }

    #[test]
    fn test_lowest_slot_first() {
        let slab = SmallSlab::new(64);

        let first = slab.allocate_item(64).unwrap();
        let second = slab.allocate_item(64).unwrap();
        assert_eq!(
            second.as_ptr() as usize - first.as_ptr() as usize,
            64,
            "slots are handed out in address order"
        );

        // A freed low slot is reused before any fresh one
        slab.deallocate_item(first).unwrap();
        let third = slab.allocate_item(64).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn test_full_chunk_reuses_holes() {
        let slab = SmallSlab::new(64);
        let slots: Vec<_> = (0..64).map(|_| slab.allocate_item(64).unwrap()).collect();
        assert_eq!(slab.allocated_memory(), 4096);

        // Chunk is full; freeing one slot in the middle must serve the next
        // allocation from that hole rather than growing.
        slab.deallocate_item(slots[17]).unwrap();
        let reused = slab.allocate_item(64).unwrap();
        assert_eq!(reused, slots[17]);
        assert_eq!(slab.allocated_memory(), 4096);
    }

    #[test]
    fn test_double_free_detected() {
        let slab = SmallSlab::new(256);
        let ptr = slab.allocate_item(200).unwrap();

        slab.deallocate_item(ptr).unwrap();
        assert_eq!(
            slab.deallocate_item(ptr),
            Err(Error::DoubleFree(ptr.as_ptr() as usize))
        );
    }

    #[test]
    fn test_foreign_pointer_rejected() {
        let slab = SmallSlab::new(256);
        let _inside = slab.allocate_item(256).unwrap();

        // A system-allocator pointer belongs to no chunk of this slab
        let foreign = Box::into_raw(Box::new([0u8; 256])) as *mut u8;
        let result = slab.deallocate_item(NonNull::new(foreign).unwrap());
        assert_eq!(result, Err(Error::ForeignPointer(foreign as usize)));
        unsafe { drop(Box::from_raw(foreign as *mut [u8; 256])) };

        // The failed call must not have disturbed the slab
        assert_eq!(slab.stats().used_slots, 1);
    }

    #[test]
    fn test_stats_track_occupancy() {
        let slab = SmallSlab::new(96);
        let slots_per_chunk = slab.chunk_bytes() / 96;

        let pointers: Vec<_> = (0..10).map(|_| slab.allocate_item(96).unwrap()).collect();
        let stats = slab.stats();
        assert_eq!(stats.elem_size, 96);
        assert_eq!(stats.chunk_count, 1);
        assert_eq!(stats.used_slots, 10);
        assert_eq!(stats.total_slots, slots_per_chunk);

        for ptr in &pointers[..5] {
            slab.deallocate_item(*ptr).unwrap();
        }
        assert_eq!(slab.stats().used_slots, 5);
    }

    #[test]
    fn test_partial_tail_slots_stay_in_bounds() {
        // 4096 / 48 = 85 slots with 16 bytes of tail slack; every returned
        // pointer must stay inside the chunk and on a slot boundary.
        let slab = SmallSlab::new(48);
        let slots_per_chunk = slab.chunk_bytes() / 48;

        let pointers: Vec<_> = (0..slots_per_chunk + 1)
            .map(|_| slab.allocate_item(48).unwrap())
            .collect();
        assert_eq!(slab.allocated_memory(), 8192);

        let first_base = pointers[0].as_ptr() as usize;
        for ptr in &pointers[..slots_per_chunk] {
            let offset = ptr.as_ptr() as usize - first_base;
            assert!(offset + 48 <= slab.chunk_bytes());
            assert_eq!(offset % 48, 0);
        }
    }

    #[test]
    fn test_bitmap_helpers() {
        let mut words = vec![0u64; 2];
        assert_eq!(find_first_zero(&words, 100), Some(0));
        assert_eq!(find_first_set(&words, 100), None);

        set_bit(&mut words, 0);
        set_bit(&mut words, 70);
        assert!(test_bit(&words, 70));
        assert_eq!(find_first_set(&words, 100), Some(0));
        assert_eq!(find_first_zero(&words, 100), Some(1));

        // A zero past the limit counts as no zero at all
        let full = vec![u64::MAX, 0b111];
        assert_eq!(find_first_zero(&full, 67), None);
        assert_eq!(find_first_zero(&full, 68), Some(67));

        clear_bit(&mut words, 0);
        assert!(!test_bit(&words, 0));
    }
}
