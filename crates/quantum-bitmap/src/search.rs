//! Forward and backward set-bit search.

use crate::{Bitmap, index, mask, shift};

impl Bitmap<'_> {
    /// Returns the position of the first set bit at or after `bp`.
    ///
    /// Returns `None` if no bit in `bp..size_in_bits()` is set.
    #[must_use]
    pub fn next_set(&self, bp: usize) -> Option<usize> {
        let end = self.words.len();
        let mut cursor = index(bp);
        if cursor >= end {
            return None;
        }

        // eliminate the bits before `bp`
        let mut word = self.load(cursor) & !mask(shift(bp));
        if word == 0 {
            cursor = self.skip_all_zeros(cursor + 1, end);
            if cursor >= end {
                return None;
            }
            word = self.load(cursor);
        }

        Some(cursor * Self::BITS_PER_WORD + word.trailing_zeros() as usize)
    }

    /// Returns the position of the last set bit at or before `bp`.
    ///
    /// A `bp` past the end of the bitmap is clamped to the last bit. Returns
    /// `None` if no bit in `0..=bp` is set.
    #[must_use]
    pub fn previous_set(&self, bp: usize) -> Option<usize> {
        let bp = bp.min(self.size_in_bits().checked_sub(1)?);
        let mut cursor = index(bp);

        // eliminate the bits after `bp`
        let mut word = self.load(cursor) & mask(shift(bp) + 1);
        if word == 0 {
            cursor = self.skip_backward_all_zeros(cursor)?;
            word = self.load(cursor);
        }

        Some(cursor * Self::BITS_PER_WORD + word.ilog2() as usize)
    }

    /// Returns the index of the first nonzero word in `cursor..end`, or `end`
    /// if they are all zero.
    ///
    /// Four words are read per step on the assumption that they are all zero;
    /// the cursor backtracks to the first nonzero one otherwise.
    pub(crate) fn skip_all_zeros(&self, mut cursor: usize, end: usize) -> usize {
        while cursor + 4 <= end {
            let words = [
                self.load(cursor),
                self.load(cursor + 1),
                self.load(cursor + 2),
                self.load(cursor + 3),
            ];
            cursor += 4;
            if let Some(nonzero) = words.iter().position(|&w| w != 0) {
                cursor -= 4 - nonzero;
                return cursor;
            }
        }

        while cursor < end && self.load(cursor) == 0 {
            cursor += 1;
        }
        cursor
    }

    /// Returns the index of the last nonzero word in `0..end`.
    fn skip_backward_all_zeros(&self, mut end: usize) -> Option<usize> {
        while end >= 4 {
            let words = [
                self.load(end - 1),
                self.load(end - 2),
                self.load(end - 3),
                self.load(end - 4),
            ];
            end -= 4;
            if let Some(nonzero) = words.iter().position(|&w| w != 0) {
                return Some(end + 3 - nonzero);
            }
        }

        while end > 0 {
            end -= 1;
            if self.load(end) != 0 {
                return Some(end);
            }
        }
        None
    }
}
