//! Boundary-tagged free list for a quantum-based heap.
//!
//! This crate tracks free byte ranges of a heap region with an intrusive,
//! doubly linked list whose headers are written into the free bytes
//! themselves. It never allocates: the memory belongs to the allocator, and
//! the list only records which ranges are currently free.
//!
//! # Memory Layout
//!
//! Each free block starts with a [`FreeListNode`] header and ends with a
//! copy of its size (the boundary tag). The trailing copy lets the allocator
//! find the header of the block physically before any address by reading
//! the word just below it.
//!
//! ```text
//! Free Block Layout:
//! ┌──────────────────────────────────────────┬───────────┬──────────────┐
//! │ Header                                   │ Unused    │ Footer       │
//! │ ┌────────┬────────┬────────┬───────────┐ │           │ ┌──────────┐ │
//! │ │ !prev  │ !next  │ size   │ purged    │ │           │ │ size     │ │
//! │ └────────┴────────┴────────┴───────────┘ │           │ └──────────┘ │
//! └──────────────────────────────────────────┴───────────┴──────────────┘
//! ```
//!
//! The links are stored bitwise complemented so that a conservative scan
//! over dead memory never mistakes them for references into the heap.
//!
//! # List Operations
//!
//! | Operation | Cost | Ordering |
//! |-----------|------|----------|
//! | [`push`](FreeList::push) | O(1) | prepends |
//! | [`pop`](FreeList::pop) | O(1) | removes the head |
//! | [`append`](FreeList::append) | O(1) | appends |
//! | [`remove`](FreeList::remove) | O(1) | unlinks any node |
//! | [`insert`](FreeList::insert) | O(n) | keeps ascending address order |
//!
//! # Usage Example
//!
//! ```rust
//! use core::{alloc::Layout, ptr::NonNull};
//!
//! use free_list::FreeList;
//!
//! let layout = Layout::from_size_align(1024, 16).unwrap();
//! let heap = NonNull::new(unsafe { std::alloc::alloc(layout) }).unwrap();
//!
//! let mut list = FreeList::new();
//! unsafe {
//!     list.insert(heap.byte_add(512), 256);
//!     list.insert(heap, 256);
//! }
//! let sizes: Vec<_> = list.iter().map(|node| unsafe { node.size() }).collect();
//! assert_eq!(sizes, [256, 256]);
//! assert_eq!(list.head().unwrap().address(), heap);
//!
//! list.reset();
//! unsafe { std::alloc::dealloc(heap.as_ptr(), layout) };
//! ```
//!
//! # Thread Safety
//!
//! [`FreeList`] is `Send` but not `Sync`. The allocator already serializes
//! free-list mutation under its own region lock, and the list adds none.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use snafu::{Location, Snafu};

pub use self::{
    list::{FreeList, Iter},
    node::FreeListNode,
};

mod list;
mod node;
#[cfg(test)]
mod testing;

/// Alignment of every free block address.
pub const QUANTUM_SIZE: usize = 16;

/// Smallest free block: the two links, the size and the trailing size word.
pub const MIN_NODE_SIZE: usize = 4 * size_of::<usize>();

/// Blocks of at least this size record whether their pages were purged.
pub const MEDIUM_QUANTUM_SIZE: usize = 2048;

/// Granularity of the ranges handed to the decommit path.
pub const PAGE_SIZE: usize = 4096;

const _: () = assert!(MIN_NODE_SIZE.is_multiple_of(size_of::<usize>()));
const _: () = assert!(PAGE_SIZE.is_power_of_two() && QUANTUM_SIZE.is_power_of_two());

/// Errors detected while attaching to a free block in memory.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum FreeListError {
    #[snafu(display("free block at {addr:#x} is not aligned to {QUANTUM_SIZE} bytes"))]
    Misaligned {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free block at {addr:#x} has invalid size {size:#x}"))]
    InvalidSize {
        addr: usize,
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free block at {addr:#x} has header size {size:#x} but footer size {size_again:#x}"
    ))]
    BoundaryTagMismatch {
        addr: usize,
        size: usize,
        size_again: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Reports a broken free-list invariant and aborts.
#[track_caller]
fn fatal(err: &FreeListError) -> ! {
    log::error!("{err}");
    panic!("free list invariant violated: {err}");
}
