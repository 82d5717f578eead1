//! Liveness tracking for objects with indeterminate lifetime
//!
//! `LifetimeObserver` lets asynchronous callbacks and event handlers detect
//! that an object they captured by raw pointer has been destroyed. A typical
//! use: a struct embeds an owner handle and registers a callback with some
//! external system (event loop, timer, network handler). The callback
//! captures `get_observer()` instead of the object itself and checks
//! `is_alive()` before touching the object; once the object (and with it the
//! owner handle) is dropped, the check turns false while the observer handle
//! remains safe to hold.
//!
//! The handle deliberately does not grant ownership of the watched object.
//! Cloning an *owner* handle therefore mints a fresh identity with its own
//! control block - the clone is a new observed object, not a second strong
//! reference - while cloning an *observer* shares the block it watches.
//! Implementations borrowing ordinary shared-count semantics get this wrong.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

/// The two roles a lifetime handle can hold.
///
/// Only owner handles keep the observed object "alive"; observers keep the
/// shared control block allocated but never extend liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Owner,
    Observer,
}

const OWNER_UNIT: u64 = 1 << 32;
const OBSERVER_UNIT: u64 = 1;
const COUNT_MASK: u64 = u32::MAX as u64;

/// Shared between one owner and its observers. Both counters live in a
/// single word (owner in the high half, observer in the low half) so the
/// transition to zero-zero is a single atomic event: exactly one releasing
/// handle observes it and frees the block, regardless of which threads the
/// owner and observers drop on.
struct ControlBlock {
    counts: AtomicU64,
}

impl ControlBlock {
    fn unit(role: Role) -> u64 {
        match role {
            Role::Owner => OWNER_UNIT,
            Role::Observer => OBSERVER_UNIT,
        }
    }

    fn count(word: u64, role: Role) -> u64 {
        match role {
            Role::Owner => word >> 32,
            Role::Observer => word & COUNT_MASK,
        }
    }
}

/// A liveness handle: either the owner half embedded in the observed object,
/// or a detached observer watching it.
pub struct LifetimeObserver {
    control_block: NonNull<ControlBlock>,
    role: Role,
}

// Counter traffic is atomic and the block is freed exactly once (see
// `release`), so handles may be sent to and shared with other threads.
unsafe impl Send for LifetimeObserver {}
unsafe impl Sync for LifetimeObserver {}

impl LifetimeObserver {
    /// Create an owner handle with its own fresh control block.
    ///
    /// Intended to be embedded in the object whose liveness is published.
    pub fn new() -> Self {
        Self {
            control_block: Self::fresh_block(),
            role: Role::Owner,
        }
    }

    /// Whether the observed object still exists.
    pub fn is_alive(&self) -> bool {
        ControlBlock::count(self.counts().load(Ordering::Acquire), Role::Owner) > 0
    }

    /// Obtain an observer handle sharing this handle's control block.
    ///
    /// The observer has a lifetime of its own: it can outlive the owner and
    /// keeps reporting `is_alive() == false` after the owner is gone.
    pub fn get_observer(&self) -> Self {
        self.counts().fetch_add(OBSERVER_UNIT, Ordering::Relaxed);
        Self {
            control_block: self.control_block,
            role: Role::Observer,
        }
    }

    /// Current counter value for the given role. Useful for diagnostics.
    pub fn get_count(&self, role: Role) -> u64 {
        ControlBlock::count(self.counts().load(Ordering::Acquire), role)
    }

    /// The role this handle holds on its control block.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Discard the current state and re-attach relative to `other`.
    ///
    /// With `Role::Owner` the handle becomes a new observed identity with a
    /// fresh control block; with `Role::Observer` it joins `other`'s block.
    /// When both handles already share a block this is a no-op.
    pub fn reset(&mut self, other: &LifetimeObserver, role: Role) {
        if self.control_block == other.control_block {
            return;
        }

        self.release();
        match role {
            Role::Owner => {
                self.control_block = Self::fresh_block();
            }
            Role::Observer => {
                other.counts().fetch_add(OBSERVER_UNIT, Ordering::Relaxed);
                self.control_block = other.control_block;
            }
        }
        self.role = role;
    }

    fn fresh_block() -> NonNull<ControlBlock> {
        let block = Box::new(ControlBlock {
            counts: AtomicU64::new(OWNER_UNIT),
        });
        unsafe { NonNull::new_unchecked(Box::into_raw(block)) }
    }

    fn counts(&self) -> &AtomicU64 {
        unsafe { &self.control_block.as_ref().counts }
    }

    /// Drop this handle's reference; frees the block when both counts reach
    /// zero. After this returns the handle must not touch the block again.
    fn release(&mut self) {
        let unit = ControlBlock::unit(self.role);
        let prev = self.counts().fetch_sub(unit, Ordering::Release);
        assert!(
            ControlBlock::count(prev, self.role) > 0,
            "lifetime reference count went negative"
        );

        if prev == unit {
            // We released the last reference of either role. The acquire
            // fence orders every preceding release-decrement before the free.
            fence(Ordering::Acquire);
            unsafe { drop(Box::from_raw(self.control_block.as_ptr())) };
        }
    }
}

impl Default for LifetimeObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for LifetimeObserver {
    fn clone(&self) -> Self {
        match self.role {
            // A copied owner is a separate observed object: fresh block,
            // invisible to observers of the original.
            Role::Owner => Self::new(),
            Role::Observer => self.get_observer(),
        }
    }
}

impl Drop for LifetimeObserver {
    fn drop(&mut self) {
        self.release();
    }
}
