//! Packed per-quantum occupancy bitmap.
//!
//! A [`Bitmap`] is a bit vector laid over word storage owned by somebody
//! else (normally the zone allocator), one bit per allocation quantum. Bit
//! `k` lives in word `k / BITS_PER_WORD` at shift `k % BITS_PER_WORD`,
//! numbered from the least significant bit.
//!
//! # Operations
//!
//! - **Single bits**: [`bit`](Bitmap::bit), [`set_bit`](Bitmap::set_bit),
//!   [`clear_bit`](Bitmap::clear_bit)
//! - **Ranges**: [`set_bits`](Bitmap::set_bits),
//!   [`clear_bits`](Bitmap::clear_bits),
//!   [`bits_are_clear`](Bitmap::bits_are_clear). A range that fits in one
//!   word is handled with a single masked store; longer ranges are split
//!   into a head, whole interior words and a tail.
//! - **Search**: [`next_set`](Bitmap::next_set) and
//!   [`previous_set`](Bitmap::previous_set), skipping zero words four at a
//!   time.
//! - **Population**: [`count_set`](Bitmap::count_set).
//! - **Atomic**: [`test_set_bit_atomic`](Bitmap::test_set_bit_atomic) and
//!   friends, plus the claim-and-clear [`AtomicCursor`].
//!
//! # Concurrency
//!
//! Only the atomic single-bit operations and [`AtomicCursor`] may race with
//! each other. Every other operation expects the caller to hold the lock
//! that protects the owning region. Non-atomic operations are still
//! implemented as relaxed loads and stores on the shared words, so a racing
//! collector scan observes either the old or the new word, never a torn one.
//!
//! # Usage Example
//!
//! ```rust
//! use quantum_bitmap::{AtomicUsize, Bitmap};
//!
//! #[repr(align(16))]
//! struct Storage([AtomicUsize; 4]);
//!
//! let storage = Storage(core::array::from_fn(|_| AtomicUsize::new(0)));
//! let bitmap = Bitmap::new(&storage.0);
//!
//! bitmap.set_bits(10, 80);
//! assert_eq!(bitmap.count_set(), 80);
//! assert_eq!(bitmap.next_set(0), Some(10));
//!
//! let claimed: Vec<_> = bitmap.atomic_cursor(0, 32).collect();
//! assert_eq!(claimed, (10..32).collect::<Vec<_>>());
//! assert!(bitmap.bits_are_clear(0, 32));
//! ```

#![cfg_attr(not(any(test, loom)), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[cfg(not(loom))]
use core::ptr::NonNull;

use snafu::{Location, Snafu};

use self::sync::atomic::Ordering;
pub use self::{cursor::AtomicCursor, sync::atomic::AtomicUsize};

mod atomic;
mod cursor;
mod search;
mod sync;
#[cfg(all(test, not(loom)))]
mod testing;

/// Required alignment, in bytes, of both the base address and the length of
/// bitmap storage.
pub const STORAGE_ALIGN: usize = 16;

const BITS_PER_BYTE: usize = 8;
const BYTES_PER_WORD: usize = size_of::<usize>();
const WORD_SHIFT: u32 = usize::BITS.trailing_zeros();
const WORD_MASK: usize = Bitmap::BITS_PER_WORD - 1;
const _: () = assert!(Bitmap::BITS_PER_WORD == 1 << WORD_SHIFT);
const _: () = assert!(STORAGE_ALIGN.is_multiple_of(BYTES_PER_WORD));

/// Errors reported when bitmap storage does not meet the layout contract.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum BitmapError {
    #[snafu(display("bitmap storage at {addr:#x} is not aligned to {STORAGE_ALIGN} bytes"))]
    MisalignedStorage {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("bitmap storage of {bytes} bytes is not a multiple of {STORAGE_ALIGN} bytes"))]
    StorageLength {
        bytes: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A bit vector over externally owned word storage.
///
/// The view never allocates and never frees; the storage's lifetime is
/// governed by whoever handed it out. Copies of a `Bitmap` alias the same
/// words.
#[derive(Debug, Clone, Copy)]
pub struct Bitmap<'a> {
    words: &'a [AtomicUsize],
}

/// An empty view. It owns no words, so the storage alignment contract of
/// [`Bitmap::new`] does not apply and no memory is ever accessed through it.
impl Default for Bitmap<'_> {
    fn default() -> Self {
        Self { words: &[] }
    }
}

impl<'a> Bitmap<'a> {
    /// Number of bits packed in one storage word.
    pub const BITS_PER_WORD: usize = usize::BITS as usize;

    /// Creates a bitmap view over `words`.
    ///
    /// # Panics
    ///
    /// Panics if the storage is not aligned to [`STORAGE_ALIGN`] or its byte
    /// length is not a multiple of it.
    #[track_caller]
    #[must_use]
    pub fn new(words: &'a [AtomicUsize]) -> Self {
        match Self::try_new(words) {
            Ok(bitmap) => bitmap,
            Err(err) => {
                log::error!("rejecting bitmap storage: {err}");
                panic!("invalid bitmap storage: {err}");
            }
        }
    }

    /// Creates a bitmap view over `words`, reporting layout violations as an
    /// error.
    #[track_caller]
    pub fn try_new(words: &'a [AtomicUsize]) -> Result<Self, BitmapError> {
        let addr = words.as_ptr().addr();
        if !addr.is_multiple_of(STORAGE_ALIGN) {
            return bitmap_error::MisalignedStorageSnafu { addr }.fail();
        }
        let bytes = words.len() * BYTES_PER_WORD;
        if !bytes.is_multiple_of(STORAGE_ALIGN) {
            return bitmap_error::StorageLengthSnafu { bytes }.fail();
        }
        Ok(Self { words })
    }

    /// Creates a bitmap view over raw memory holding at least `n` bits.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `bits` points to [`bytes_needed(n)`](Self::bytes_needed) bytes that
    ///   are valid for reads and writes for the whole lifetime `'a`
    /// - the memory is only accessed through bitmap views (or atomics) while
    ///   any view exists
    ///
    /// # Panics
    ///
    /// Panics if `bits` or `bytes_needed(n)` is not a multiple of
    /// [`STORAGE_ALIGN`].
    #[cfg(not(loom))]
    #[track_caller]
    #[must_use]
    pub unsafe fn from_raw_parts(bits: NonNull<u8>, n: usize) -> Self {
        #[expect(clippy::cast_ptr_alignment)]
        let base = bits.as_ptr().cast::<AtomicUsize>();
        let len = Self::bytes_needed(n) / BYTES_PER_WORD;
        let words = unsafe { core::slice::from_raw_parts(base, len) };
        Self::new(words)
    }

    /// Re-targets this view at new storage.
    ///
    /// # Panics
    ///
    /// Panics under the same conditions as [`new`](Self::new).
    #[track_caller]
    pub fn initialize(&mut self, words: &'a [AtomicUsize]) {
        *self = Self::new(words);
        log::debug!(
            "bitmap view at {:#x} covers {} bits",
            words.as_ptr().addr(),
            self.size_in_bits()
        );
    }

    /// Returns the number of bytes needed to represent `n` bits.
    #[must_use]
    pub const fn bytes_needed(n: usize) -> usize {
        n.div_ceil(Self::BITS_PER_WORD) * BYTES_PER_WORD
    }

    /// Returns the storage words.
    #[must_use]
    pub const fn words(&self) -> &'a [AtomicUsize] {
        self.words
    }

    /// Returns the size of the storage in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.words.len() * BYTES_PER_WORD
    }

    /// Returns the number of bits in the bitmap.
    #[must_use]
    pub const fn size_in_bits(&self) -> usize {
        self.size() * BITS_PER_BYTE
    }

    /// Returns the state of the bit at `bp`.
    #[must_use]
    pub fn bit(&self, bp: usize) -> bool {
        (self.load(index(bp)) >> shift(bp)) & 1 != 0
    }

    /// Sets the bit at `bp` to 1.
    pub fn set_bit(&self, bp: usize) {
        let i = index(bp);
        self.store(i, self.load(i) | (1 << shift(bp)));
    }

    /// Sets the bit at `bp` to 0.
    pub fn clear_bit(&self, bp: usize) {
        let i = index(bp);
        self.store(i, self.load(i) & !(1 << shift(bp)));
    }

    /// Sets the `n` bits starting at `bp` to 1.
    pub fn set_bits(&self, bp: usize, n: usize) {
        debug_assert!(bp + n <= self.size_in_bits(), "range {bp}+{n} out of bounds");
        if n == 0 {
            return;
        }
        let sh = shift(bp);
        if sh + n > Self::BITS_PER_WORD {
            self.set_bits_large(bp, n);
        } else {
            let i = index(bp);
            self.store(i, self.load(i) | (mask(n) << sh));
        }
    }

    /// Sets the `n` bits starting at `bp` to 0.
    pub fn clear_bits(&self, bp: usize, n: usize) {
        debug_assert!(bp + n <= self.size_in_bits(), "range {bp}+{n} out of bounds");
        if n == 0 {
            return;
        }
        let sh = shift(bp);
        if sh + n > Self::BITS_PER_WORD {
            self.clear_bits_large(bp, n);
        } else {
            let i = index(bp);
            self.store(i, self.load(i) & !(mask(n) << sh));
        }
    }

    /// Returns `true` if all `n` bits starting at `bp` are 0.
    #[must_use]
    pub fn bits_are_clear(&self, bp: usize, n: usize) -> bool {
        debug_assert!(bp + n <= self.size_in_bits(), "range {bp}+{n} out of bounds");
        if n == 0 {
            return true;
        }
        let sh = shift(bp);
        if sh + n > Self::BITS_PER_WORD {
            self.bits_are_clear_large(bp, n)
        } else {
            self.load(index(bp)) & (mask(n) << sh) == 0
        }
    }

    // The `*_large` variants must only see ranges that cross a word boundary.

    fn set_bits_large(&self, bp: usize, n: usize) {
        let sh = shift(bp);
        assert!(sh + n > Self::BITS_PER_WORD);
        let mut i = index(bp);

        self.store(i, self.load(i) | (usize::MAX << sh));
        i += 1;

        let mut spill = sh + n - Self::BITS_PER_WORD;
        while spill >= Self::BITS_PER_WORD {
            self.store(i, usize::MAX);
            i += 1;
            spill -= Self::BITS_PER_WORD;
        }

        if spill > 0 {
            self.store(i, self.load(i) | mask(spill));
        }
    }

    fn clear_bits_large(&self, bp: usize, n: usize) {
        let sh = shift(bp);
        assert!(sh + n > Self::BITS_PER_WORD);
        let mut i = index(bp);

        self.store(i, self.load(i) & !(usize::MAX << sh));
        i += 1;

        let mut spill = sh + n - Self::BITS_PER_WORD;
        while spill >= Self::BITS_PER_WORD {
            self.store(i, 0);
            i += 1;
            spill -= Self::BITS_PER_WORD;
        }

        if spill > 0 {
            self.store(i, self.load(i) & !mask(spill));
        }
    }

    fn bits_are_clear_large(&self, bp: usize, n: usize) -> bool {
        let sh = shift(bp);
        assert!(sh + n > Self::BITS_PER_WORD);
        let mut i = index(bp);

        if self.load(i) & (usize::MAX << sh) != 0 {
            return false;
        }
        i += 1;

        let mut spill = sh + n - Self::BITS_PER_WORD;
        while spill >= Self::BITS_PER_WORD {
            if self.load(i) != 0 {
                return false;
            }
            i += 1;
            spill -= Self::BITS_PER_WORD;
        }

        spill == 0 || self.load(i) & mask(spill) == 0
    }

    /// Returns the number of bits set in the whole bitmap.
    ///
    /// The storage is treated as an array of 32-bit lanes. Each lane is
    /// reduced to per-byte counts (at most 8 each), and up to 31 lanes are
    /// summed byte-wise before the bytes are widened, so no byte can
    /// overflow.
    #[must_use]
    pub fn count_set(&self) -> usize {
        const FIVES: u32 = 0x5555_5555;
        const THREES: u32 = 0x3333_3333;
        const NIBBLES: u32 = 0x0f0f_0f0f;
        const LANES_PER_BATCH: usize = 31;

        let mut count = 0;
        let mut sum8 = 0;
        let mut batched = 0;
        for mut x in self.lanes() {
            x -= (x >> 1) & FIVES;
            x = (x & THREES) + ((x >> 2) & THREES);
            x = (x + (x >> 4)) & NIBBLES;
            sum8 += x;
            batched += 1;
            if batched == LANES_PER_BATCH {
                count += widen_byte_sums(sum8);
                sum8 = 0;
                batched = 0;
            }
        }
        count + widen_byte_sums(sum8)
    }

    fn lanes(&self) -> impl Iterator<Item = u32> + '_ {
        const LANES_PER_WORD: usize = usize::BITS as usize / 32;
        self.words.iter().flat_map(|word| {
            let word = word.load(Ordering::Relaxed);
            (0..LANES_PER_WORD).map(move |n| lane(word, n))
        })
    }

    fn word(&self, i: usize) -> &'a AtomicUsize {
        &self.words[i]
    }

    fn load(&self, i: usize) -> usize {
        self.words[i].load(Ordering::Relaxed)
    }

    fn store(&self, i: usize, value: usize) {
        self.words[i].store(value, Ordering::Relaxed);
    }
}

/// Returns the word index holding bit `bp`.
const fn index(bp: usize) -> usize {
    bp >> WORD_SHIFT
}

/// Returns the shift of bit `bp` within its word.
const fn shift(bp: usize) -> usize {
    bp & WORD_MASK
}

/// Returns a word with the low `n` bits set.
const fn mask(n: usize) -> usize {
    if n == 0 {
        0
    } else {
        usize::MAX >> (Bitmap::BITS_PER_WORD - n)
    }
}

/// Returns the `n`th 32-bit lane of `word`.
#[expect(clippy::cast_possible_truncation)]
const fn lane(word: usize, n: usize) -> u32 {
    (word >> (n * 32)) as u32
}

fn widen_byte_sums(sum8: u32) -> usize {
    const BYTES: u32 = 0x00ff_00ff;
    const SHORTS: u32 = 0x0000_ffff;
    let y = (sum8 & BYTES) + ((sum8 >> 8) & BYTES);
    ((y & SHORTS) + (y >> 16)) as usize
}
