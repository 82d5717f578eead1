//! TTAS spin lock with escalating backoff
//!
//! Acquisition runs in three phases: a bounded read-only spin (reads avoid
//! pinging the cache line between cores), a randomized sleep that doubles on
//! every failed attempt so contenders spread out instead of stampeding the
//! lock the moment it frees, and finally an OS-assisted parked wait for
//! sustained contention.

use parking_lot_core::{DEFAULT_PARK_TOKEN, DEFAULT_UNPARK_TOKEN};
use rand::Rng;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

/// Read-only spins before each acquisition attempt.
const SPIN_LIMIT: u32 = 100;
/// Sleep-backoff rounds before falling back to a parked wait.
const BACKOFF_ROUNDS: u32 = 10;

/// Mutual exclusion built on a single atomic flag.
///
/// Protects `T` the way `std::sync::Mutex` does, but spins before blocking;
/// intended for critical sections of a few dozen instructions.
pub struct SpinLock<T> {
    flag: AtomicBool,
    data: UnsafeCell<T>,
}

unsafe impl<T> Sync for SpinLock<T> where T: Send {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            flag: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, blocking until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        // The starting delay is randomized per acquisition so that threads
        // which collided once keep different retry schedules. Accuracy does
        // not matter; differentiation between threads does.
        let mut wait = Duration::from_nanos(rand::thread_rng().gen_range(1..=100));
        let mut backoff_count = 0;

        loop {
            // Spin while the lock appears to be held
            for _ in 0..SPIN_LIMIT {
                if !self.flag.load(Ordering::Relaxed) {
                    break;
                }
                thread::yield_now();
            }

            // Attempt to acquire the lock
            if !self.flag.swap(true, Ordering::Acquire) {
                return SpinLockGuard { lock: self };
            }

            if backoff_count < BACKOFF_ROUNDS {
                thread::sleep(wait);
                wait += wait;
                backoff_count += 1;
            } else {
                // Sustained contention: park until an unlock wakes us, then
                // retry the whole cycle.
                unsafe {
                    parking_lot_core::park(
                        self.park_key(),
                        || self.flag.load(Ordering::Relaxed),
                        || {},
                        |_, _| {},
                        DEFAULT_PARK_TOKEN,
                        None,
                    );
                }
            }
        }
    }

    /// Acquire the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.flag.load(Ordering::Relaxed) {
            return None; // Lock is already held elsewhere
        }

        if !self.flag.swap(true, Ordering::Acquire) {
            return Some(SpinLockGuard { lock: self });
        }
        None
    }

    /// Access the data without locking; requires exclusive ownership.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
        unsafe {
            parking_lot_core::unpark_one(self.park_key(), |_| DEFAULT_UNPARK_TOKEN);
        }
    }

    fn park_key(&self) -> usize {
        self as *const Self as usize
    }
}

/// RAII guard; releases the lock on drop.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lock_protects_data() {
        let lock = SpinLock::new(41);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 42);
    }

    #[test]
    fn test_try_lock_contended() {
        let lock = SpinLock::new(());

        let guard = lock.try_lock().expect("uncontended try_lock must succeed");
        assert!(lock.try_lock().is_none());
        drop(guard);

        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn test_get_mut_bypasses_lock() {
        let mut lock = SpinLock::new(7);
        *lock.get_mut() = 9;
        assert_eq!(*lock.lock(), 9);
    }

    #[test]
    fn test_many_threads_counter() {
        // 0.8 x hardware concurrency threads, 10k increments each; the final
        // count proves every acquisition was exclusive.
        let hw = thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let num_threads = (hw * 4 / 5).max(2);
        const INCREMENTS: u64 = 10_000;

        let counter = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();

        for _ in 0..num_threads {
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..INCREMENTS {
                    *counter.lock() += 1;
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), num_threads as u64 * INCREMENTS);
    }
}
