use core::alloc::Layout;

use linked_list_allocator::LockedHeap;

const HEAP_SIZE: usize = 4 * 1024 * 1024;

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[link_section = ".bss.heap"]
static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

/// Initializes the kernel heap that backs page tables, process records and kernel stacks.
pub fn init_heap() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(core::ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, HEAP_SIZE);
    }
}

/// Bytes still free in the kernel heap.
pub fn free_bytes() -> usize {
    ALLOCATOR.lock().free()
}

#[alloc_error_handler]
fn alloc_error(layout: Layout) -> ! {
    panic!("kernel heap exhausted allocating {} bytes", layout.size());
}
