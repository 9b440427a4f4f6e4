//! The kernel heap.
//!
//! A fixed arena in the kernel image feeds a linked-list allocator. This is
//! deliberately small: the heap only carries kernel bookkeeping (process
//! records, mapping lists, module images in flight), not user memory.

use linked_list_allocator::LockedHeap;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

const HEAP_SIZE: usize = 4 * 1024 * 1024;

static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Hands the heap arena to the allocator. Must be called exactly once,
/// before the first allocation.
pub fn init() {
    // SAFETY: Called once during single-threaded boot; the arena is used for
    // nothing else.
    unsafe {
        ALLOCATOR.lock().init(core::ptr::addr_of_mut!(HEAP) as *mut u8, HEAP_SIZE);
    }
}
