use crate::{Bitmap, sync::atomic::AtomicUsize};

/// Word storage aligned the way bitmaps require.
#[repr(align(16))]
pub(crate) struct Storage<const N: usize>([AtomicUsize; N]);

impl<const N: usize> Storage<N> {
    pub(crate) fn new() -> Self {
        Self(core::array::from_fn(|_| AtomicUsize::new(0)))
    }

    pub(crate) fn words(&self) -> &[AtomicUsize] {
        &self.0
    }

    pub(crate) fn bitmap(&self) -> Bitmap<'_> {
        Bitmap::new(&self.0)
    }
}

/// Deterministic pseudo-random bit patterns.
pub(crate) struct XorShift(u64);

impl XorShift {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub(crate) fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}
