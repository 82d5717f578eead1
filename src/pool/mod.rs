//! Slab Pool Allocator
//!
//! Serves variable-size byte allocations from twelve fixed-size class pools,
//! with a pass-through delegate for anything larger than the biggest class.
//!
//! # Architecture
//!
//! ```text
//! Pool
//!   ├─→ SmallSlab(16B)   → chunks: [####.…] [##……]
//!   ├─→ SmallSlab(32B)   → chunks: [#…………]
//!   ├─→ …                  (12 classes: 16B … 1KiB)
//!   ├─→ SmallSlab(1KiB)  → chunks: []
//!   └─→ LargeDelegate    → system allocator, > 1 KiB
//!
//! Header (written directly before every returned pointer)
//!   └─→ [padding][header_size: 1B][alloc_size: 4B][user data …]
//! ```
//!
//! Each chunk is a 16-byte-aligned raw buffer carved into equal slots and
//! tracked by a packed occupancy bitmap; an any-free bitmap picks the chunk,
//! a base-address index routes deallocations back to it. The header carries
//! everything `deallocate` needs, so freeing is O(1) plus one O(log C) chunk
//! lookup within the selected class.

pub mod allocator;
pub mod large;
pub mod size_class;
pub mod slab;

pub use allocator::{Pool, PoolStats, DEFAULT_ALIGNMENT};
pub use large::LargeDelegate;
pub use size_class::{
    select_slab, SlabSelector, MAX_ALLOC_SIZE, MAX_SMALL_SIZE, NUM_SIZE_CLASSES, SIZE_CLASSES,
};
pub use slab::{SizeClassStats, SmallSlab};
