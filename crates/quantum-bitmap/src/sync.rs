// Atomic primitive shim.
//
// Under `cfg(loom)` the bitmap words are loom-tracked atomics so that the
// model checker sees every load and compare-and-swap. Every module in the
// crate must import atomics through here.

pub(crate) mod atomic {
    #[cfg(loom)]
    pub use loom::sync::atomic::{AtomicUsize, Ordering};

    #[cfg(not(loom))]
    pub use core::sync::atomic::{AtomicUsize, Ordering};
}
