use core::{alloc::Layout, ptr::NonNull};

use crate::PAGE_SIZE;

/// Runs `test_fn` on a page-aligned scratch heap filled with garbage.
pub(crate) fn with_test_heap<F>(heap_size: usize, test_fn: F)
where
    F: FnOnce(NonNull<u8>),
{
    unsafe {
        let layout = Layout::from_size_align(heap_size, PAGE_SIZE).unwrap();
        let heap_start = NonNull::new(std::alloc::alloc(layout)).unwrap();
        heap_start.write_bytes(0x11, heap_size);
        test_fn(heap_start);
        std::alloc::dealloc(heap_start.as_ptr(), layout);
    }
}
