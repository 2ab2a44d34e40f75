// Global heap allocator for kernel-side `alloc` collections (Vec, Box, …
// used by fs/bio/proc bookkeeping). Backed by a static BSS region rather
// than the physical-page freelist in kalloc.rs: KMem owns all of
// end..PHYSTOP as fixed 4096-byte page frames for page tables and user
// memory, and handing part of that range to a byte-granularity allocator
// as well would let the two allocators double-grant the same pages.

use linked_list_allocator::LockedHeap;

const HEAP_SIZE: usize = 256 * 1024;

#[repr(align(16))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut HEAP_REGION: HeapRegion = HeapRegion([0; HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Must run once, on the boot hart, before anything allocates.
pub fn init() {
    unsafe {
        ALLOCATOR
            .lock()
            .init(HEAP_REGION.0.as_mut_ptr(), HEAP_SIZE);
    }
}
