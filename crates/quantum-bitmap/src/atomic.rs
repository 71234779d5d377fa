//! Atomic single-bit operations.
//!
//! Every atomic update is a read / compute / compare-and-swap loop on the
//! word holding the bit. The candidate is computed only while the bit still
//! differs from its target state, so an update that would be a no-op never
//! touches the word's cache line with a write.

use crate::{
    Bitmap, index, shift,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Runs a compare-and-swap loop on `word` and returns the value it held
/// before the loop ended.
///
/// `update` maps the current value to the value to store, or to `None` when
/// no store is needed. On a failed swap the loop retries with the value that
/// was observed instead.
pub(crate) fn compare_and_swap_loop<F>(word: &AtomicUsize, mut update: F) -> usize
where
    F: FnMut(usize) -> Option<usize>,
{
    let mut old = word.load(Ordering::Acquire);
    while let Some(new) = update(old) {
        match word.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => break,
            Err(actual) => old = actual,
        }
    }
    old
}

/// Atomically ANDs `mask` into `word`, returning the original value.
pub(crate) fn and_return_orig(mask: usize, word: &AtomicUsize) -> usize {
    compare_and_swap_loop(word, |old| Some(old & mask))
}

impl Bitmap<'_> {
    /// Atomically sets the bit at `bp` to 1.
    ///
    /// Returns the state of the bit before the call.
    pub fn set_bit_atomic(&self, bp: usize) -> bool {
        self.test_set_bit_atomic(bp)
    }

    /// Atomically sets the bit at `bp` to 1 if it is not already set.
    ///
    /// Returns `false` exactly when this call is the one that set the bit, so
    /// among concurrent callers racing on a clear bit only one sees `false`.
    #[must_use]
    pub fn test_set_bit_atomic(&self, bp: usize) -> bool {
        let bit = 1 << shift(bp);
        let old = compare_and_swap_loop(self.word(index(bp)), |old| {
            (old & bit == 0).then_some(old | bit)
        });
        old & bit != 0
    }

    /// Atomically sets the bit at `bp` to 0.
    ///
    /// Returns the state of the bit before the call.
    pub fn clear_bit_atomic(&self, bp: usize) -> bool {
        self.test_clear_bit_atomic(bp)
    }

    /// Atomically sets the bit at `bp` to 0 if it is set.
    ///
    /// Returns `true` exactly when this call is the one that cleared the bit.
    #[must_use]
    pub fn test_clear_bit_atomic(&self, bp: usize) -> bool {
        let bit = 1 << shift(bp);
        let old = compare_and_swap_loop(self.word(index(bp)), |old| {
            (old & bit != 0).then_some(old & !bit)
        });
        old & bit != 0
    }
}
