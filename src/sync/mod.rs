//! Synchronization primitives
//!
//! The pool and each small-class slab guard their mutable state with a
//! test-and-test-and-set spin lock tuned for short critical sections.

pub mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
