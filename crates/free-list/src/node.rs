use core::{
    fmt,
    ops::Range,
    ptr::{self, NonNull},
};

use snafu::ensure;

use crate::{
    FreeListError, MEDIUM_QUANTUM_SIZE, MIN_NODE_SIZE, PAGE_SIZE, QUANTUM_SIZE, fatal,
    free_list_error,
};

const WORD_SIZE: usize = size_of::<usize>();

/// A list link stored as the bitwise complement of the target's address.
///
/// Conservative scans only recognize pointer-shaped values, so a `Link` is
/// never mistaken for a reference. An empty link is stored as all ones.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
struct Link(usize);

impl Link {
    fn new(node: Option<FreeListNode>) -> Self {
        Self(!node.map_or(0, |node| node.header.as_ptr().expose_provenance()))
    }

    fn get(self) -> Option<FreeListNode> {
        let header = ptr::with_exposed_provenance_mut::<NodeHeader>(!self.0);
        NonNull::new(header).map(|header| FreeListNode { header })
    }
}

/// Header written at the start of every free block.
///
/// The trailing size word lives at `size - WORD_SIZE` and may overlap
/// `purged` in a minimum-size block, which is why `purged` is only touched
/// for medium blocks.
#[repr(C)]
struct NodeHeader {
    prev: Link,
    next: Link,
    size: usize,
    purged: bool,
}
const _: () = assert!(size_of::<NodeHeader>() <= MIN_NODE_SIZE);
const _: () = assert!(align_of::<NodeHeader>() <= QUANTUM_SIZE);
const _: () = assert!(MEDIUM_QUANTUM_SIZE >= size_of::<NodeHeader>() + WORD_SIZE);

/// Handle to a free block header living in heap memory.
///
/// A handle is only meaningful while the bytes it points at are a free
/// block. Once the allocator hands those bytes out again the handle must
/// not be used, which is why every accessor that touches the block is
/// `unsafe`: the caller vouches that the block is still free.
///
/// ```compile_fail
/// fn mark_purged(node: free_list::FreeListNode) {
///     node.set_purged(true);
/// }
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FreeListNode {
    header: NonNull<NodeHeader>,
}

impl fmt::Debug for FreeListNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FreeListNode")
            .field(&format_args!("{:#x}", self.addr()))
            .finish()
    }
}

impl FreeListNode {
    /// Writes a free block header at `addr` and the trailing size word at
    /// the end of the block.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the range `addr..addr + size` is valid for writes and owned by the
    ///   caller's allocator
    /// - no live object overlaps the range
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not aligned to [`QUANTUM_SIZE`], or if `size` is
    /// smaller than [`MIN_NODE_SIZE`] or not a multiple of the word size.
    #[track_caller]
    pub unsafe fn new(
        addr: NonNull<u8>,
        prev: Option<Self>,
        next: Option<Self>,
        size: usize,
    ) -> Self {
        if let Err(err) = check_placement(addr, size) {
            fatal(&err);
        }

        let node = Self {
            header: addr.cast(),
        };
        let header = node.header.as_ptr();
        unsafe {
            (*header).prev = Link::new(prev);
            (*header).next = Link::new(next);
            node.set_size(size);
            if size >= MEDIUM_QUANTUM_SIZE {
                (*header).purged = false;
            }
        }
        node
    }

    /// Re-attaches to a free block header already present at `addr`.
    ///
    /// The links are reset to empty.
    ///
    /// # Safety
    ///
    /// Same as [`try_reconstruct`](Self::try_reconstruct).
    ///
    /// # Panics
    ///
    /// Panics if the block is misaligned, has an invalid size, or its header
    /// and trailing size disagree.
    #[track_caller]
    pub unsafe fn reconstruct(addr: NonNull<u8>) -> Self {
        match unsafe { Self::try_reconstruct(addr) } {
            Ok(node) => node,
            Err(err) => fatal(&err),
        }
    }

    /// Re-attaches to a free block header already present at `addr`,
    /// reporting a damaged block as an error.
    ///
    /// The block is left untouched on error; otherwise its links are reset
    /// to empty.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `addr` is the start of a range the
    /// allocator knows to be free, and that the header's size field (if
    /// plausible) does not extend past memory valid for reads and writes.
    #[track_caller]
    pub unsafe fn try_reconstruct(addr: NonNull<u8>) -> Result<Self, FreeListError> {
        let raw = addr.as_ptr().addr();
        ensure!(
            raw.is_multiple_of(QUANTUM_SIZE),
            free_list_error::MisalignedSnafu { addr: raw }
        );

        let node = Self {
            header: addr.cast(),
        };
        unsafe {
            node.check()?;
            node.set_prev(None);
            node.set_next(None);
        }
        Ok(node)
    }

    /// Returns the address of the free block.
    #[must_use]
    pub const fn address(self) -> NonNull<u8> {
        self.header.cast()
    }

    /// Returns the address of the free block as an integer.
    #[must_use]
    pub fn addr(self) -> usize {
        self.header.as_ptr().addr()
    }

    /// Returns the size of the whole free block, header and footer included.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    #[must_use]
    pub unsafe fn size(self) -> usize {
        unsafe { (*self.header.as_ptr()).size }
    }

    /// Returns the size stored in the last word of the block.
    ///
    /// # Safety
    ///
    /// The block must still be free and its header size must be intact.
    /// Use [`check`](Self::check) on a block that may be damaged.
    #[must_use]
    pub unsafe fn size_again(self) -> usize {
        unsafe { self.footer(self.size()).read() }
    }

    /// Returns the previous node on the list.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    #[must_use]
    pub unsafe fn prev(self) -> Option<Self> {
        unsafe { (*self.header.as_ptr()).prev }.get()
    }

    /// Returns the next node on the list.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    #[must_use]
    pub unsafe fn next(self) -> Option<Self> {
        unsafe { (*self.header.as_ptr()).next }.get()
    }

    pub(crate) unsafe fn set_prev(self, prev: Option<Self>) {
        unsafe { (*self.header.as_ptr()).prev = Link::new(prev) }
    }

    pub(crate) unsafe fn set_next(self, next: Option<Self>) {
        unsafe { (*self.header.as_ptr()).next = Link::new(next) }
    }

    /// Returns whether the interior pages of this block have been returned
    /// to the OS.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    ///
    /// # Panics
    ///
    /// Panics if the block is smaller than [`MEDIUM_QUANTUM_SIZE`].
    #[must_use]
    pub unsafe fn is_purged(self) -> bool {
        unsafe {
            self.assert_medium();
            (*self.header.as_ptr()).purged
        }
    }

    /// Records whether the interior pages of this block have been returned
    /// to the OS.
    ///
    /// # Safety
    ///
    /// The block must still be free. Once the allocator has handed its bytes
    /// out again this would write into a live object.
    ///
    /// # Panics
    ///
    /// Panics if the block is smaller than [`MEDIUM_QUANTUM_SIZE`].
    pub unsafe fn set_purged(self, purged: bool) {
        unsafe {
            self.assert_medium();
            (*self.header.as_ptr()).purged = purged;
        }
    }

    /// Checks that the header size is plausible and matches the trailing
    /// size word.
    ///
    /// The footer is only read once the header size has been validated.
    ///
    /// # Safety
    ///
    /// The block must still be free, and a plausible header size must not
    /// extend past memory valid for reads.
    #[track_caller]
    pub unsafe fn check(self) -> Result<(), FreeListError> {
        let addr = self.addr();
        let size = unsafe { self.size() };
        ensure!(
            size >= MIN_NODE_SIZE && size.is_multiple_of(WORD_SIZE),
            free_list_error::InvalidSizeSnafu { addr, size }
        );
        let size_again = unsafe { self.footer(size).read() };
        ensure!(
            size == size_again,
            free_list_error::BoundaryTagMismatchSnafu {
                addr,
                size,
                size_again,
            }
        );
        Ok(())
    }

    /// Aborts if the header size is implausible or disagrees with the
    /// trailing size word.
    ///
    /// # Safety
    ///
    /// Same as [`check`](Self::check).
    #[track_caller]
    pub unsafe fn validate(self) {
        if let Err(err) = unsafe { self.check() } {
            fatal(&err);
        }
    }

    /// Returns the address just past the end of this block.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    #[must_use]
    pub unsafe fn next_block(self) -> NonNull<u8> {
        unsafe { self.address().byte_add(self.size()) }
    }

    /// Returns the free block that physically precedes this one.
    ///
    /// The word just below this block is read as the trailing size of the
    /// preceding block.
    ///
    /// # Safety
    ///
    /// The caller must know (from its own occupancy index) that the bytes
    /// immediately before this block belong to a free block.
    #[must_use]
    pub unsafe fn prior_node(self) -> Self {
        unsafe {
            let end_size = self.address().byte_sub(WORD_SIZE).cast::<usize>().read();
            Self {
                header: self.address().byte_sub(end_size).cast(),
            }
        }
    }

    /// Returns the page-aligned interior of this block that can be handed to
    /// the decommit path.
    ///
    /// The header and the page holding the trailing size word are excluded.
    /// The range is empty when no whole page fits.
    ///
    /// # Safety
    ///
    /// The block must still be free.
    #[must_use]
    pub unsafe fn purgeable_range(self) -> Range<usize> {
        let size = unsafe { self.size() };
        let start = (self.addr() + size_of::<NodeHeader>()).next_multiple_of(PAGE_SIZE);
        let last = self.addr() + size - WORD_SIZE - 1;
        let end = last & !(PAGE_SIZE - 1);
        start..end.max(start)
    }

    /// Writes `size` to the header and to the last word of the block.
    unsafe fn set_size(self, size: usize) {
        unsafe {
            (*self.header.as_ptr()).size = size;
            self.footer(size).write(size);
        }
    }

    /// Pointer to the trailing size word of a block of `size` bytes.
    ///
    /// `size` must be at least [`MIN_NODE_SIZE`].
    unsafe fn footer(self, size: usize) -> *mut usize {
        debug_assert!(size >= MIN_NODE_SIZE);
        unsafe { self.address().byte_add(size - WORD_SIZE).cast().as_ptr() }
    }

    #[track_caller]
    unsafe fn assert_medium(self) {
        assert!(
            unsafe { self.size() } >= MEDIUM_QUANTUM_SIZE,
            "purged state is only kept for blocks of at least {MEDIUM_QUANTUM_SIZE} bytes"
        );
    }
}

fn check_placement(addr: NonNull<u8>, size: usize) -> Result<(), FreeListError> {
    let raw = addr.as_ptr().addr();
    ensure!(
        raw.is_multiple_of(QUANTUM_SIZE),
        free_list_error::MisalignedSnafu { addr: raw }
    );
    ensure!(
        size >= MIN_NODE_SIZE && size.is_multiple_of(WORD_SIZE),
        free_list_error::InvalidSizeSnafu { addr: raw, size }
    );
    Ok(())
}
