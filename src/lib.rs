// spalloc - size-segregated slab pool allocator
// Serves variable-size byte allocations from fixed-size class pools

#![warn(rust_2018_idioms)]

pub mod lifetime;
pub mod pool;
pub mod sync;

// Re-exports for convenience
pub use lifetime::{LifetimeObserver, Role};
pub use pool::{select_slab, Pool, SlabSelector, SmallSlab};
pub use sync::SpinLock;

/// spalloc error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug, PartialEq, Eq)]
    pub enum Error {
        #[error("allocation of {0} bytes exceeds the 1 GiB limit")]
        TooLarge(usize),

        #[error("unsupported alignment {0} (must be 4, 8, or 16)")]
        BadAlignment(usize),

        #[error("size class {0} has reached its chunk limit")]
        CapacityExhausted(usize),

        #[error("pointer {0:#x} was not allocated from this slab")]
        ForeignPointer(usize),

        #[error("double free of pointer {0:#x}")]
        DoubleFree(usize),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        // VERSION is a static string, always valid
        let _version: &str = VERSION;
        // Just ensure the constant is accessible
    }
}
