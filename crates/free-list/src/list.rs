use core::{fmt, iter::FusedIterator, marker::PhantomData, ptr::NonNull};

use crate::FreeListNode;

/// An intrusive, doubly linked list of free blocks.
///
/// The list records membership only; the blocks themselves live in memory
/// owned by the allocator. Lists built with [`insert`](Self::insert) are
/// kept in ascending address order, which is what lets the allocator find
/// coalescing candidates deterministically.
///
/// Every node on the list stays free and readable until it is popped,
/// removed, or the list is reset. The unsafe insertion methods make the
/// caller promise this, and the safe methods rely on it.
///
/// # Thread Safety
///
/// `FreeList` is `Send` but not `Sync`. Every mutation must happen under the
/// lock that protects the heap region the nodes live in.
#[derive(Default)]
pub struct FreeList {
    head: Option<FreeListNode>,
    tail: Option<FreeListNode>,
}

unsafe impl Send for FreeList {}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl FreeList {
    /// Creates an empty list.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// Returns the first node.
    #[must_use]
    pub const fn head(&self) -> Option<FreeListNode> {
        self.head
    }

    /// Returns the last node.
    #[must_use]
    pub const fn tail(&self) -> Option<FreeListNode> {
        self.tail
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns an iterator over the nodes from head to tail.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }

    /// Removes and returns the head node.
    ///
    /// The returned handle stays usable only as long as the caller keeps
    /// the block free.
    pub fn pop(&mut self) -> Option<FreeListNode> {
        let node = self.head?;
        unsafe {
            self.head = node.next();
            match self.head {
                Some(head) => head.set_prev(None),
                None => self.tail = None,
            }
        }
        Some(node)
    }

    /// Writes a free block header over `addr..addr + size` and prepends it.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the range `addr..addr + size` is free memory owned by the allocator
    ///   and valid for reads and writes
    /// - the range does not overlap any node already on a list
    /// - the range stays free and valid until the node leaves this list
    ///   through [`pop`](Self::pop), [`remove`](Self::remove) or
    ///   [`reset`](Self::reset)
    ///
    /// # Panics
    ///
    /// Panics if the block placement is invalid, see [`FreeListNode::new`].
    #[track_caller]
    pub unsafe fn push(&mut self, addr: NonNull<u8>, size: usize) -> FreeListNode {
        unsafe {
            let node = FreeListNode::new(addr, None, self.head, size);
            match self.head {
                Some(head) => head.set_prev(Some(node)),
                None => self.tail = Some(node),
            }
            self.head = Some(node);
            node
        }
    }

    /// Attaches an already constructed node at the tail.
    ///
    /// # Safety
    ///
    /// `node` must be a valid free block that is not on any list, and it
    /// must stay free until it leaves this list.
    pub unsafe fn append(&mut self, node: FreeListNode) {
        unsafe {
            node.set_prev(self.tail);
            node.set_next(None);
            match self.tail {
                Some(tail) => tail.set_next(Some(node)),
                None => self.head = Some(node),
            }
        }
        self.tail = Some(node);
    }

    /// Unlinks `node` from the list.
    ///
    /// # Safety
    ///
    /// `node` must currently be on this list.
    pub unsafe fn remove(&mut self, node: FreeListNode) {
        unsafe {
            let Some(prev) = node.prev() else {
                debug_assert_eq!(self.head, Some(node), "node without predecessor is not the head");
                self.pop();
                return;
            };

            let next = node.next();
            prev.set_next(next);
            match next {
                Some(next) => next.set_prev(Some(prev)),
                None => self.tail = Some(prev),
            }
        }
    }

    /// Writes a free block header over `addr..addr + size` and links it in
    /// ascending address order.
    ///
    /// The list is scanned from the head, so this is linear in its length.
    ///
    /// # Safety
    ///
    /// Same as [`push`](Self::push). The list must already be in ascending
    /// address order.
    ///
    /// # Panics
    ///
    /// Panics if the block placement is invalid, see [`FreeListNode::new`].
    #[track_caller]
    pub unsafe fn insert(&mut self, addr: NonNull<u8>, size: usize) -> FreeListNode {
        unsafe {
            // first node above the new block
            let mut next = self.head;
            while let Some(node) = next {
                if node.address() > addr {
                    break;
                }
                next = node.next();
            }
            let prev = match next {
                Some(next) => next.prev(),
                None => self.tail,
            };

            let node = FreeListNode::new(addr, prev, next, size);
            match prev {
                Some(prev) => prev.set_next(Some(node)),
                None => self.head = Some(node),
            }
            match next {
                Some(next) => next.set_prev(Some(node)),
                None => self.tail = Some(node),
            }
            node
        }
    }

    /// Forgets every node without touching the memory they live in.
    pub fn reset(&mut self) {
        log::trace!("resetting free list, head={:?}", self.head);
        self.head = None;
        self.tail = None;
    }
}

impl<'a> IntoIterator for &'a FreeList {
    type Item = FreeListNode;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the nodes of a [`FreeList`], from head to tail.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    next: Option<FreeListNode>,
    _list: PhantomData<&'a FreeList>,
}

impl Iterator for Iter<'_> {
    type Item = FreeListNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // nodes on a borrowed list are still free
        self.next = unsafe { node.next() };
        Some(node)
    }
}

impl FusedIterator for Iter<'_> {}
