//! Lock-free claim-and-clear enumeration of set bits.

use crate::{Bitmap, WORD_MASK, atomic::and_return_orig, index, mask};

/// A cursor that enumerates the set bits of a bitmap subrange, clearing each
/// bit as it is claimed.
///
/// The bitmap is accessed one word at a time with an atomic fetch-and-clear;
/// the fetched bits are then consumed from a local buffer. A bit that one
/// cursor has fetched is gone from the bitmap, so two cursors (or a cursor
/// and [`Bitmap::test_clear_bit_atomic`]) can never both claim it.
///
/// Returned positions are relative to the start index passed to
/// [`Bitmap::atomic_cursor`], which matches how subzone quanta are numbered.
#[derive(Debug)]
pub struct AtomicCursor<'a> {
    bitmap: Bitmap<'a>,
    /// The bit that will be returned next if it is set.
    index: usize,
    /// Subtracted from every returned position.
    offset: usize,
    /// End of the scan, exclusive.
    max_index: usize,
    /// Bits already cleared from the bitmap and not yet returned.
    copied_bits: usize,
    /// Number of meaningful bits in `copied_bits`.
    valid_bits: usize,
}

impl<'a> Bitmap<'a> {
    /// Creates a cursor over the `length` bits starting at `start`.
    ///
    /// The first (possibly unaligned) word of the range is fetched and
    /// cleared immediately.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of the bitmap.
    pub fn atomic_cursor(&self, start: usize, length: usize) -> AtomicCursor<'a> {
        AtomicCursor::new(*self, start, length)
    }
}

impl<'a> AtomicCursor<'a> {
    fn new(bitmap: Bitmap<'a>, start: usize, length: usize) -> Self {
        let max_index = start
            .checked_add(length)
            .filter(|&max| max <= bitmap.size_in_bits())
            .unwrap_or_else(|| {
                panic!(
                    "cursor range {start}+{length} exceeds bitmap of {} bits",
                    bitmap.size_in_bits()
                )
            });

        let mut cursor = Self {
            bitmap,
            index: start,
            offset: start,
            max_index,
            copied_bits: 0,
            valid_bits: 0,
        };
        // after this fetch `index` only ever advances to word boundaries
        if start < max_index {
            (cursor.copied_bits, cursor.valid_bits) =
                cursor.fetch_clear_bits_atomic(start, max_index);
        }
        cursor
    }

    /// Returns the bias subtracted from every position this cursor returns.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Atomically fetches and clears the bits `bp..max` that share `bp`'s
    /// word.
    ///
    /// Returns the previous values of those bits shifted down to bit 0, and
    /// the number of bits fetched. Bits above the count are zero.
    pub fn fetch_clear_bits_atomic(&self, bp: usize, max: usize) -> (usize, usize) {
        debug_assert!(bp < max);
        let result_shift = bp & WORD_MASK;
        let count = usize::min(Bitmap::BITS_PER_WORD - result_shift, max - bp);
        let result_mask = mask(count);
        let old = and_return_orig(
            !(result_mask << result_shift),
            self.bitmap.word(index(bp)),
        );
        ((old >> result_shift) & result_mask, count)
    }

    /// Claims the next set bit of the range.
    ///
    /// Returns its position relative to the cursor's start, or `None` once
    /// the whole range has been scanned.
    pub fn next_set_bit(&mut self) -> Option<usize> {
        while self.copied_bits == 0 {
            // buffer exhausted: step past what it covered
            self.index += self.valid_bits;
            self.valid_bits = 0;
            if self.index >= self.max_index {
                self.index = self.max_index;
                return None;
            }

            debug_assert_eq!(self.index & WORD_MASK, 0);
            let cursor = self
                .bitmap
                .skip_all_zeros(index(self.index), index(self.max_index));
            self.index = cursor * Bitmap::BITS_PER_WORD;
            if self.index >= self.max_index {
                self.index = self.max_index;
                return None;
            }

            // either a nonzero word or the partial word at the end of the
            // range; a concurrent claimer may have emptied it meanwhile
            (self.copied_bits, self.valid_bits) =
                self.fetch_clear_bits_atomic(self.index, self.max_index);
        }

        let shift = self.copied_bits.trailing_zeros() as usize;
        let result = self.index + shift - self.offset;
        // a single shift by `shift + 1` would overflow when the top bit is set
        self.copied_bits >>= shift;
        self.copied_bits >>= 1;
        self.index += shift + 1;
        self.valid_bits -= shift + 1;
        Some(result)
    }
}

impl Iterator for AtomicCursor<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_set_bit()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(all(test, not(loom)))]
mod tests {
    use std::{collections::BTreeSet, sync::Barrier, thread};

    use crate::{
        Bitmap,
        testing::{Storage, XorShift},
    };

    const WORD: usize = Bitmap::BITS_PER_WORD;

    #[test]
    fn test_fetch_clear_bits_atomic() {
        let storage = Storage::<4>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bits(0, 2 * WORD);
        let cursor = bitmap.atomic_cursor(0, 0);

        let (bits, count) = cursor.fetch_clear_bits_atomic(4, 10);
        assert_eq!((bits, count), (0b11_1111, 6));
        assert!(bitmap.bits_are_clear(4, 6));
        assert!(bitmap.bit(3) && bitmap.bit(10));

        let (bits, count) = cursor.fetch_clear_bits_atomic(WORD - 2, 3 * WORD);
        assert_eq!((bits, count), (0b11, 2));
        assert!(bitmap.bit(WORD));

        let (bits, count) = cursor.fetch_clear_bits_atomic(WORD, 3 * WORD);
        assert_eq!((bits, count), (usize::MAX, WORD));
        assert!(bitmap.bits_are_clear(WORD, WORD));
    }

    #[test]
    fn test_cursor_outlives_bitmap_temporary() {
        let storage = Storage::<4>::new();
        storage.bitmap().set_bits(3, 4);
        let cursor = storage.bitmap().atomic_cursor(0, WORD);
        assert_eq!(cursor.collect::<Vec<_>>(), [3, 4, 5, 6]);
    }

    #[test]
    fn test_empty_cursor() {
        let storage = Storage::<4>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bits(0, bitmap.size_in_bits());
        let mut cursor = bitmap.atomic_cursor(bitmap.size_in_bits(), 0);
        assert_eq!(cursor.next_set_bit(), None);
        assert_eq!(bitmap.count_set(), bitmap.size_in_bits());
    }

    #[test]
    fn test_cursor_returns_offsets() {
        let storage = Storage::<4>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bit(8);
        bitmap.set_bit(WORD + 1);
        let mut cursor = bitmap.atomic_cursor(5, 3 * WORD);
        assert_eq!(cursor.offset(), 5);
        assert_eq!(cursor.next_set_bit(), Some(3));
        assert_eq!(cursor.next_set_bit(), Some(WORD - 4));
        assert_eq!(cursor.next_set_bit(), None);
        assert_eq!(cursor.next_set_bit(), None);
        assert_eq!(bitmap.count_set(), 0);
    }

    #[test]
    fn test_cursor_respects_range_bounds() {
        let storage = Storage::<4>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bits(0, bitmap.size_in_bits());
        let claimed: Vec<_> = bitmap.atomic_cursor(WORD - 3, WORD + 6).collect();
        assert_eq!(claimed, (0..WORD + 6).collect::<Vec<_>>());
        assert!(bitmap.bit(WORD - 4));
        assert!(bitmap.bit(2 * WORD + 3));
        assert_eq!(bitmap.count_set(), bitmap.size_in_bits() - (WORD + 6));
    }

    #[test]
    fn test_cursor_top_bit_of_word() {
        let storage = Storage::<4>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bit(WORD - 1);
        bitmap.set_bit(2 * WORD - 1);
        bitmap.set_bit(4 * WORD - 1);
        let claimed: Vec<_> = bitmap.atomic_cursor(0, 4 * WORD).collect();
        assert_eq!(claimed, [WORD - 1, 2 * WORD - 1, 4 * WORD - 1]);
    }

    #[test]
    fn test_cursor_skips_claimed_words() {
        let storage = Storage::<16>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bit(6 * WORD + 2);
        bitmap.set_bit(11 * WORD + 7);
        let mut cursor = bitmap.atomic_cursor(0, bitmap.size_in_bits());
        assert_eq!(cursor.next_set_bit(), Some(6 * WORD + 2));
        // claimed behind the cursor's back before it gets there
        assert!(bitmap.test_clear_bit_atomic(11 * WORD + 7));
        assert_eq!(cursor.next_set_bit(), None);
    }

    #[test]
    fn test_cursor_matches_set_bits() {
        let storage = Storage::<16>::new();
        let bitmap = storage.bitmap();
        let mut rng = XorShift::new(0x1234_5678);
        let mut expected = Vec::new();
        for bp in 0..bitmap.size_in_bits() {
            if rng.next().is_multiple_of(5) {
                bitmap.set_bit(bp);
                if (40..700.min(bitmap.size_in_bits())).contains(&bp) {
                    expected.push(bp - 40);
                }
            }
        }
        let before = bitmap.count_set();
        let length = 700.min(bitmap.size_in_bits()) - 40;
        let claimed: Vec<_> = bitmap.atomic_cursor(40, length).collect();
        assert_eq!(claimed, expected);
        assert!(bitmap.bits_are_clear(40, length));
        assert_eq!(bitmap.count_set(), before - expected.len());
    }

    #[test]
    fn test_parallel_cursors_over_disjoint_ranges() {
        const THREADS: usize = 6;

        let storage = Storage::<16>::new();
        let bitmap = storage.bitmap();
        let total = bitmap.size_in_bits();
        let mut rng = XorShift::new(0xdead_beef);
        let mut expected = BTreeSet::new();
        for bp in 0..total {
            if rng.next().is_multiple_of(3) {
                bitmap.set_bit(bp);
                expected.insert(bp);
            }
        }

        // odd-sized chunks so that several cursors share boundary words
        let chunk = total.div_ceil(THREADS);
        let barrier = Barrier::new(THREADS);
        let claimed: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let start = (i * chunk).min(total);
                    let end = ((i + 1) * chunk).min(total);
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        let cursor = bitmap.atomic_cursor(start, end - start);
                        let offset = cursor.offset();
                        cursor.map(|bp| bp + offset).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut seen = BTreeSet::new();
        for bits in &claimed {
            for &bp in bits {
                assert!(seen.insert(bp), "bit {bp} claimed twice");
            }
        }
        assert_eq!(seen, expected);
        assert_eq!(bitmap.count_set(), 0);
    }

    #[test]
    fn test_cursors_racing_over_same_range() {
        const THREADS: usize = 4;

        let storage = Storage::<16>::new();
        let bitmap = storage.bitmap();
        bitmap.set_bits(0, bitmap.size_in_bits());
        let barrier = Barrier::new(THREADS);
        let claimed: Vec<Vec<usize>> = thread::scope(|s| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        bitmap.atomic_cursor(0, bitmap.size_in_bits()).collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut all: Vec<_> = claimed.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (0..bitmap.size_in_bits()).collect::<Vec<_>>());
    }
}
